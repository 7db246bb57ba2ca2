//! Per-architecture rules for code pointers.
//!
//! Everything the core needs to know about the target instruction set is
//! captured once in an [`InstructionSetPolicy`]: how entry points are tagged,
//! what alignment compiled code honors and how in-flight PCs are skewed.

use serde::{Deserialize, Serialize};

/// Required alignment of native stack frames on every supported target.
pub const STACK_ALIGNMENT: usize = 16;

/// Instruction sets the runtime can execute compiled code for.
///
/// 32-bit ARM code is always generated as Thumb-2, so `Arm` implies the
/// Thumb-2 entry point tagging rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionSet {
    Arm,
    Arm64,
    X86,
    X86_64,
    Riscv64,
}

impl InstructionSet {
    /// The instruction set of the running process.
    pub const fn runtime() -> Self {
        if cfg!(target_arch = "arm") {
            InstructionSet::Arm
        } else if cfg!(target_arch = "aarch64") {
            InstructionSet::Arm64
        } else if cfg!(target_arch = "x86") {
            InstructionSet::X86
        } else if cfg!(target_arch = "riscv64") {
            InstructionSet::Riscv64
        } else {
            InstructionSet::X86_64
        }
    }

    /// Alignment the code generator guarantees for method code.
    pub const fn code_alignment(self) -> usize {
        match self {
            InstructionSet::Arm => 8,
            InstructionSet::Arm64
            | InstructionSet::X86
            | InstructionSet::X86_64
            | InstructionSet::Riscv64 => 16,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            InstructionSet::Arm => "arm",
            InstructionSet::Arm64 => "arm64",
            InstructionSet::X86 => "x86",
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Riscv64 => "riscv64",
        }
    }
}

impl Default for InstructionSet {
    fn default() -> Self {
        Self::runtime()
    }
}

/// Entry point tagging and alignment rules, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionSetPolicy {
    isa: InstructionSet,
    alignment: usize,
    /// Bits OR-ed into a code address to form a callable entry point.
    entry_point_tag: usize,
}

impl InstructionSetPolicy {
    pub const fn new(isa: InstructionSet) -> Self {
        let entry_point_tag = match isa {
            // Thumb-2 selects the instruction encoding with the low bit.
            InstructionSet::Arm => 1,
            _ => 0,
        };
        Self {
            isa,
            alignment: isa.code_alignment(),
            entry_point_tag,
        }
    }

    pub const fn runtime() -> Self {
        Self::new(InstructionSet::runtime())
    }

    pub fn isa(&self) -> InstructionSet {
        self.isa
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Turn a raw code address into the address callers must jump to.
    pub fn entry_point_adjust(&self, code: usize) -> usize {
        code | self.entry_point_tag
    }

    /// Strip entry point tagging, recovering the raw code address.
    pub fn code_pointer(&self, entry_point: usize) -> usize {
        entry_point & !self.entry_point_tag
    }

    pub fn is_aligned(&self, address: usize) -> bool {
        address % self.alignment == 0
    }

    /// Skew between the start of a code blob and the lowest PC that can be
    /// observed inside it.
    pub fn pc_offset_adjust(&self) -> usize {
        self.entry_point_tag
    }

    pub fn stack_alignment(&self) -> usize {
        STACK_ALIGNMENT
    }
}

impl Default for InstructionSetPolicy {
    fn default() -> Self {
        Self::runtime()
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
