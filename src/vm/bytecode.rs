//! Decoded instruction stream.
//!
//! Registers are 16-bit indices into the frame; wide values use the pair
//! `(r, r + 1)`. Branch targets and dex pcs are instruction indices.
//!
//! Operand use per opcode:
//! - `a`: destination (or source for stores, returns, throw, branches)
//! - `b`, `c`: source registers; `c` is the byte offset for quick field ops
//! - `index`: type, field or method table index of the enclosing method
//! - `literal`: constants and branch targets
//! - `args`: argument registers of `invoke`

use serde::Deserialize;

/// Register index meaning "no register" (e.g. invoke whose result is dropped).
pub const NO_REGISTER: u16 = u16::MAX;

/// Storage kind of an instance field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Wide,
    Object,
}

impl FieldKind {
    /// Size in bytes of a field of this kind. References are compressed.
    pub const fn width(self) -> usize {
        match self {
            FieldKind::Boolean | FieldKind::Byte => 1,
            FieldKind::Char | FieldKind::Short => 2,
            FieldKind::Int | FieldKind::Object => 4,
            FieldKind::Wide => 8,
        }
    }

    pub const fn is_reference(self) -> bool {
        matches!(self, FieldKind::Object)
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Boolean => "boolean",
            FieldKind::Byte => "byte",
            FieldKind::Char => "char",
            FieldKind::Short => "short",
            FieldKind::Int => "int",
            FieldKind::Wide => "wide",
            FieldKind::Object => "object",
        }
    }
}

macro_rules! opcodes {
    ($($name:ident => $mnemonic:literal,)*) => {
        /// Interpreter opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            /// Every opcode, in discriminant order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];
            pub const COUNT: usize = Self::ALL.len();

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    Nop => "nop",
    Const => "const",
    ConstWide => "const-wide",
    ConstNull => "const-null",
    Move => "move",
    MoveWide => "move-wide",
    MoveObject => "move-object",
    MoveException => "move-exception",
    ReturnVoid => "return-void",
    Return => "return",
    ReturnWide => "return-wide",
    ReturnObject => "return-object",
    Goto => "goto",
    IfEqz => "if-eqz",
    IfNez => "if-nez",
    IfEq => "if-eq",
    IfNe => "if-ne",
    IfLt => "if-lt",
    IfGe => "if-ge",
    AddInt => "add-int",
    SubInt => "sub-int",
    MulInt => "mul-int",
    DivInt => "div-int",
    AddIntLit => "add-int-lit",
    AddLong => "add-long",
    Throw => "throw",
    Invoke => "invoke",
    NewInstance => "new-instance",
    CheckCast => "check-cast",
    InstanceOf => "instance-of",
    Iget => "iget",
    Iput => "iput",
    IgetBooleanQuick => "iget-boolean-quick",
    IgetByteQuick => "iget-byte-quick",
    IgetCharQuick => "iget-char-quick",
    IgetShortQuick => "iget-short-quick",
    IgetQuick => "iget-quick",
    IgetWideQuick => "iget-wide-quick",
    IgetObjectQuick => "iget-object-quick",
    IputBooleanQuick => "iput-boolean-quick",
    IputByteQuick => "iput-byte-quick",
    IputCharQuick => "iput-char-quick",
    IputShortQuick => "iput-short-quick",
    IputQuick => "iput-quick",
    IputWideQuick => "iput-wide-quick",
    IputObjectQuick => "iput-object-quick",
}

impl Opcode {
    pub fn iget_quick(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Boolean => Opcode::IgetBooleanQuick,
            FieldKind::Byte => Opcode::IgetByteQuick,
            FieldKind::Char => Opcode::IgetCharQuick,
            FieldKind::Short => Opcode::IgetShortQuick,
            FieldKind::Int => Opcode::IgetQuick,
            FieldKind::Wide => Opcode::IgetWideQuick,
            FieldKind::Object => Opcode::IgetObjectQuick,
        }
    }

    pub fn iput_quick(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Boolean => Opcode::IputBooleanQuick,
            FieldKind::Byte => Opcode::IputByteQuick,
            FieldKind::Char => Opcode::IputCharQuick,
            FieldKind::Short => Opcode::IputShortQuick,
            FieldKind::Int => Opcode::IputQuick,
            FieldKind::Wide => Opcode::IputWideQuick,
            FieldKind::Object => Opcode::IputObjectQuick,
        }
    }

    /// Field kind accessed by a quick field opcode.
    pub fn quick_field_kind(self) -> Option<FieldKind> {
        Some(match self {
            Opcode::IgetBooleanQuick | Opcode::IputBooleanQuick => FieldKind::Boolean,
            Opcode::IgetByteQuick | Opcode::IputByteQuick => FieldKind::Byte,
            Opcode::IgetCharQuick | Opcode::IputCharQuick => FieldKind::Char,
            Opcode::IgetShortQuick | Opcode::IputShortQuick => FieldKind::Short,
            Opcode::IgetQuick | Opcode::IputQuick => FieldKind::Int,
            Opcode::IgetWideQuick | Opcode::IputWideQuick => FieldKind::Wide,
            Opcode::IgetObjectQuick | Opcode::IputObjectQuick => FieldKind::Object,
            _ => return None,
        })
    }

    /// Whether executing the opcode may leave an exception pending or call
    /// out of the method. Compiled code records a safepoint for these.
    pub fn can_throw(self) -> bool {
        !matches!(
            self,
            Opcode::Nop
                | Opcode::Const
                | Opcode::ConstWide
                | Opcode::ConstNull
                | Opcode::Move
                | Opcode::MoveWide
                | Opcode::MoveObject
                | Opcode::MoveException
                | Opcode::ReturnVoid
                | Opcode::Return
                | Opcode::ReturnWide
                | Opcode::ReturnObject
                | Opcode::Goto
                | Opcode::IfEqz
                | Opcode::IfNez
                | Opcode::IfEq
                | Opcode::IfNe
                | Opcode::IfLt
                | Opcode::IfGe
                | Opcode::AddInt
                | Opcode::SubInt
                | Opcode::MulInt
                | Opcode::AddIntLit
                | Opcode::AddLong
        )
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Goto
                | Opcode::IfEqz
                | Opcode::IfNez
                | Opcode::IfEq
                | Opcode::IfNe
                | Opcode::IfLt
                | Opcode::IfGe
        )
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub a: u16,
    pub b: u16,
    pub c: u16,
    pub index: u32,
    pub literal: i64,
    pub args: Box<[u16]>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            a: 0,
            b: 0,
            c: 0,
            index: 0,
            literal: 0,
            args: Box::new([]),
        }
    }

    pub fn with_a(mut self, a: u16) -> Self {
        self.a = a;
        self
    }

    pub fn with_b(mut self, b: u16) -> Self {
        self.b = b;
        self
    }

    pub fn with_c(mut self, c: u16) -> Self {
        self.c = c;
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn with_literal(mut self, literal: i64) -> Self {
        self.literal = literal;
        self
    }

    pub fn with_args(mut self, args: &[u16]) -> Self {
        self.args = args.into();
        self
    }

    /// Branch target of a branch instruction.
    pub fn target(&self) -> u32 {
        self.literal as u32
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} a={} b={} c={}", self.opcode.mnemonic(), self.a, self.b, self.c)?;
        if self.index != 0 {
            write!(f, " index={}", self.index)?;
        }
        if self.literal != 0 {
            write!(f, " lit={}", self.literal)?;
        }
        if !self.args.is_empty() {
            write!(f, " args={:?}", self.args)?;
        }
        Ok(())
    }
}

/// Textual instruction as written in program files. Symbolic operands are
/// resolved to table indices when the program is loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", deny_unknown_fields)]
pub enum InsnSpec {
    // Empty struct variants: a unit variant would accept stray keys.
    Nop {},
    Const { dst: u16, value: i32 },
    ConstWide { dst: u16, value: i64 },
    ConstNull { dst: u16 },
    Move { dst: u16, src: u16 },
    MoveWide { dst: u16, src: u16 },
    MoveObject { dst: u16, src: u16 },
    MoveException { dst: u16 },
    ReturnVoid {},
    Return { src: u16 },
    ReturnWide { src: u16 },
    ReturnObject { src: u16 },
    Goto { target: u32 },
    IfEqz { src: u16, target: u32 },
    IfNez { src: u16, target: u32 },
    IfEq { a: u16, b: u16, target: u32 },
    IfNe { a: u16, b: u16, target: u32 },
    IfLt { a: u16, b: u16, target: u32 },
    IfGe { a: u16, b: u16, target: u32 },
    AddInt { dst: u16, a: u16, b: u16 },
    SubInt { dst: u16, a: u16, b: u16 },
    MulInt { dst: u16, a: u16, b: u16 },
    DivInt { dst: u16, a: u16, b: u16 },
    AddIntLit { dst: u16, src: u16, value: i32 },
    AddLong { dst: u16, a: u16, b: u16 },
    Throw { src: u16 },
    Invoke {
        method: String,
        #[serde(default)]
        args: Vec<u16>,
        dst: Option<u16>,
    },
    NewInstance { dst: u16, class: String },
    CheckCast { dst: u16, src: u16, class: String },
    InstanceOf { dst: u16, src: u16, class: String },
    Iget { dst: u16, obj: u16, field: String },
    Iput { src: u16, obj: u16, field: String },
    IgetQuick { kind: FieldKind, dst: u16, obj: u16, offset: u16 },
    IputQuick { kind: FieldKind, src: u16, obj: u16, offset: u16 },
}
