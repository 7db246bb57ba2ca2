//! Program files and decoded method bodies.
//!
//! A program is a TOML document declaring classes and methods. Loading it
//! defines the classes and links each method's textual instructions into
//! an immutable [`Method`]: symbolic class, field and method names become
//! indices into per-method tables, resolved on first use.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::Deserialize;

use super::bytecode::{FieldKind, InsnSpec, Instruction, NO_REGISTER, Opcode};
use super::class::ClassId;
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

fn default_entry() -> String {
    "Main.main".to_string()
}

fn default_count() -> usize {
    1
}

/// A program file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    /// Method run by `quickrt run`
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default)]
    pub classes: Vec<ClassSpec>,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
    /// Extra threads started alongside the entry method
    #[serde(default)]
    pub threads: Vec<ThreadSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSpec {
    pub name: String,
    #[serde(rename = "super")]
    pub super_class: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodSpec {
    pub name: String,
    pub registers: u16,
    /// Argument count; arguments land in the last `ins` registers
    #[serde(default)]
    pub ins: u16,
    pub code: Vec<InsnSpec>,
    #[serde(default)]
    pub tries: Vec<TrySpec>,
    /// Install compiled code for this method at load time
    #[serde(default)]
    pub compiled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrySpec {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// Caught class; absent means catch-all
    pub class: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadSpec {
    pub method: String,
    #[serde(default)]
    pub args: Vec<i32>,
    #[serde(default = "default_count")]
    pub count: usize,
}

impl Program {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RuntimeError::Parse {
            what: "program".to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

/// One try range: `[start, end)` is covered, `handler` is the catch block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryItem {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// Index into the method's type table; `None` catches everything
    pub catch_type: Option<u32>,
}

impl TryItem {
    pub fn covers(&self, dex_pc: u32) -> bool {
        self.start <= dex_pc && dex_pc < self.end
    }
}

/// A field after resolution: what quickening would embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedField {
    pub offset: u16,
    pub kind: FieldKind,
}

/// An immutable, linked method body.
#[derive(Debug)]
pub struct Method {
    id: MethodId,
    name: String,
    registers: u16,
    ins: u16,
    code: Box<[Instruction]>,
    tries: Box<[TryItem]>,
    compiled: bool,
    type_names: Box<[String]>,
    resolved_types: Box<[OnceLock<ClassId>]>,
    /// (class name, field name)
    field_names: Box<[(String, String)]>,
    resolved_fields: Box<[OnceLock<ResolvedField>]>,
    callees: Box<[MethodId]>,
}

impl Method {
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registers(&self) -> u16 {
        self.registers
    }

    pub fn ins(&self) -> u16 {
        self.ins
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn tries(&self) -> &[TryItem] {
        &self.tries
    }

    pub fn wants_compiled_code(&self) -> bool {
        self.compiled
    }

    pub fn type_name(&self, index: u32) -> &str {
        &self.type_names[index as usize]
    }

    pub fn resolved_type(&self, index: u32) -> Option<ClassId> {
        self.resolved_types[index as usize].get().copied()
    }

    pub(crate) fn cache_type(&self, index: u32, class: ClassId) {
        let _ = self.resolved_types[index as usize].set(class);
    }

    pub fn field_name(&self, index: u32) -> (&str, &str) {
        let (class, field) = &self.field_names[index as usize];
        (class, field)
    }

    pub fn resolved_field(&self, index: u32) -> Option<ResolvedField> {
        self.resolved_fields[index as usize].get().copied()
    }

    pub(crate) fn cache_field(&self, index: u32, field: ResolvedField) {
        let _ = self.resolved_fields[index as usize].set(field);
    }

    pub fn callee(&self, index: u32) -> MethodId {
        self.callees[index as usize]
    }
}

/// Interns symbolic operands while a method is linked.
#[derive(Default)]
struct Pools {
    types: Vec<String>,
    fields: Vec<(String, String)>,
    callees: Vec<MethodId>,
}

impl Pools {
    fn type_index(&mut self, name: &str) -> u32 {
        intern(&mut self.types, name.to_string())
    }

    fn field_index(&mut self, qualified: &str, method: &str) -> Result<u32> {
        let (class, field) = qualified.rsplit_once('.').ok_or_else(|| {
            RuntimeError::InvalidProgram(format!(
                "{}: field `{}` must be written Class.field",
                method, qualified
            ))
        })?;
        Ok(intern(
            &mut self.fields,
            (class.to_string(), field.to_string()),
        ))
    }

    fn callee_index(&mut self, id: MethodId) -> u32 {
        intern(&mut self.callees, id)
    }
}

fn intern<T: PartialEq>(pool: &mut Vec<T>, value: T) -> u32 {
    match pool.iter().position(|v| *v == value) {
        Some(i) => i as u32,
        None => {
            pool.push(value);
            (pool.len() - 1) as u32
        }
    }
}

/// Link a method body. `methods` maps every method name in the program to
/// its id, so calls may refer forward.
pub(crate) fn link_method(
    id: MethodId,
    spec: &MethodSpec,
    methods: &HashMap<String, MethodId>,
) -> Result<Method> {
    let invalid = |message: String| RuntimeError::InvalidProgram(format!("{}: {}", spec.name, message));
    if spec.ins > spec.registers {
        return Err(invalid(format!(
            "{} ins exceed {} registers",
            spec.ins, spec.registers
        )));
    }
    if spec.code.is_empty() {
        return Err(invalid("empty code".to_string()));
    }

    let mut pools = Pools::default();
    let mut code = Vec::with_capacity(spec.code.len());
    for insn in &spec.code {
        code.push(link_insn(insn, &mut pools, methods, &spec.name)?);
    }

    let mut tries = Vec::with_capacity(spec.tries.len());
    for t in &spec.tries {
        tries.push(TryItem {
            start: t.start,
            end: t.end,
            handler: t.handler,
            catch_type: t.class.as_deref().map(|name| pools.type_index(name)),
        });
    }

    let method = Method {
        id,
        name: spec.name.clone(),
        registers: spec.registers,
        ins: spec.ins,
        code: code.into(),
        tries: tries.into(),
        compiled: spec.compiled,
        resolved_types: pools.types.iter().map(|_| OnceLock::new()).collect(),
        type_names: pools.types.into(),
        resolved_fields: pools.fields.iter().map(|_| OnceLock::new()).collect(),
        field_names: pools.fields.into(),
        callees: pools.callees.into(),
    };
    verify(&method).map_err(invalid)?;
    Ok(method)
}

fn link_insn(
    insn: &InsnSpec,
    pools: &mut Pools,
    methods: &HashMap<String, MethodId>,
    method: &str,
) -> Result<Instruction> {
    use InsnSpec as S;
    use Opcode as O;

    let i = Instruction::new;
    Ok(match insn {
        S::Nop {} => i(O::Nop),
        S::Const { dst, value } => i(O::Const).with_a(*dst).with_literal(*value as i64),
        S::ConstWide { dst, value } => i(O::ConstWide).with_a(*dst).with_literal(*value),
        S::ConstNull { dst } => i(O::ConstNull).with_a(*dst),
        S::Move { dst, src } => i(O::Move).with_a(*dst).with_b(*src),
        S::MoveWide { dst, src } => i(O::MoveWide).with_a(*dst).with_b(*src),
        S::MoveObject { dst, src } => i(O::MoveObject).with_a(*dst).with_b(*src),
        S::MoveException { dst } => i(O::MoveException).with_a(*dst),
        S::ReturnVoid {} => i(O::ReturnVoid),
        S::Return { src } => i(O::Return).with_a(*src),
        S::ReturnWide { src } => i(O::ReturnWide).with_a(*src),
        S::ReturnObject { src } => i(O::ReturnObject).with_a(*src),
        S::Goto { target } => i(O::Goto).with_literal(*target as i64),
        S::IfEqz { src, target } => i(O::IfEqz).with_a(*src).with_literal(*target as i64),
        S::IfNez { src, target } => i(O::IfNez).with_a(*src).with_literal(*target as i64),
        S::IfEq { a, b, target } => i(O::IfEq).with_a(*a).with_b(*b).with_literal(*target as i64),
        S::IfNe { a, b, target } => i(O::IfNe).with_a(*a).with_b(*b).with_literal(*target as i64),
        S::IfLt { a, b, target } => i(O::IfLt).with_a(*a).with_b(*b).with_literal(*target as i64),
        S::IfGe { a, b, target } => i(O::IfGe).with_a(*a).with_b(*b).with_literal(*target as i64),
        S::AddInt { dst, a, b } => i(O::AddInt).with_a(*dst).with_b(*a).with_c(*b),
        S::SubInt { dst, a, b } => i(O::SubInt).with_a(*dst).with_b(*a).with_c(*b),
        S::MulInt { dst, a, b } => i(O::MulInt).with_a(*dst).with_b(*a).with_c(*b),
        S::DivInt { dst, a, b } => i(O::DivInt).with_a(*dst).with_b(*a).with_c(*b),
        S::AddIntLit { dst, src, value } => {
            i(O::AddIntLit).with_a(*dst).with_b(*src).with_literal(*value as i64)
        }
        S::AddLong { dst, a, b } => i(O::AddLong).with_a(*dst).with_b(*a).with_c(*b),
        S::Throw { src } => i(O::Throw).with_a(*src),
        S::Invoke {
            method: callee,
            args,
            dst,
        } => {
            let id = methods
                .get(callee)
                .copied()
                .ok_or_else(|| RuntimeError::UnknownMethod(format!("{} (called from {})", callee, method)))?;
            i(O::Invoke)
                .with_a(dst.unwrap_or(NO_REGISTER))
                .with_index(pools.callee_index(id))
                .with_args(args)
        }
        S::NewInstance { dst, class } => i(O::NewInstance)
            .with_a(*dst)
            .with_index(pools.type_index(class)),
        S::CheckCast { dst, src, class } => i(O::CheckCast)
            .with_a(*dst)
            .with_b(*src)
            .with_index(pools.type_index(class)),
        S::InstanceOf { dst, src, class } => i(O::InstanceOf)
            .with_a(*dst)
            .with_b(*src)
            .with_index(pools.type_index(class)),
        S::Iget { dst, obj, field } => i(O::Iget)
            .with_a(*dst)
            .with_b(*obj)
            .with_index(pools.field_index(field, method)?),
        S::Iput { src, obj, field } => i(O::Iput)
            .with_a(*src)
            .with_b(*obj)
            .with_index(pools.field_index(field, method)?),
        S::IgetQuick {
            kind,
            dst,
            obj,
            offset,
        } => i(O::iget_quick(*kind)).with_a(*dst).with_b(*obj).with_c(*offset),
        S::IputQuick {
            kind,
            src,
            obj,
            offset,
        } => i(O::iput_quick(*kind)).with_a(*src).with_b(*obj).with_c(*offset),
    })
}

/// Structural checks the interpreter relies on: registers in range, wide
/// pairs complete, branch and handler targets inside the code, and no path
/// falling off the end.
fn verify(method: &Method) -> std::result::Result<(), String> {
    let len = method.code.len() as u32;
    let regs = method.registers;
    let reg = |r: u16, pc: usize| {
        if r < regs {
            Ok(())
        } else {
            Err(format!("register v{} out of range at pc {}", r, pc))
        }
    };
    let pair = |r: u16, pc: usize| {
        if (r as u32) + 1 < regs as u32 {
            Ok(())
        } else {
            Err(format!("register pair v{} out of range at pc {}", r, pc))
        }
    };

    for (pc, insn) in method.code.iter().enumerate() {
        use Opcode as O;
        match insn.opcode {
            O::Nop | O::ReturnVoid | O::Goto => {}
            O::Const | O::ConstNull | O::MoveException | O::Return | O::ReturnObject
            | O::Throw | O::IfEqz | O::IfNez | O::NewInstance => reg(insn.a, pc)?,
            O::ConstWide | O::ReturnWide => pair(insn.a, pc)?,
            O::Move | O::MoveObject | O::AddIntLit | O::CheckCast | O::InstanceOf | O::IfEq
            | O::IfNe | O::IfLt | O::IfGe => {
                reg(insn.a, pc)?;
                reg(insn.b, pc)?;
            }
            O::MoveWide => {
                pair(insn.a, pc)?;
                pair(insn.b, pc)?;
            }
            O::AddInt | O::SubInt | O::MulInt | O::DivInt => {
                reg(insn.a, pc)?;
                reg(insn.b, pc)?;
                reg(insn.c, pc)?;
            }
            O::AddLong => {
                pair(insn.a, pc)?;
                pair(insn.b, pc)?;
                pair(insn.c, pc)?;
            }
            O::Invoke => {
                if insn.a != NO_REGISTER {
                    reg(insn.a, pc)?;
                }
                for &arg in insn.args.iter() {
                    reg(arg, pc)?;
                }
            }
            // Generic field ops: the width is only known after resolution.
            O::Iget | O::Iput => {
                reg(insn.a, pc)?;
                reg(insn.b, pc)?;
            }
            O::IgetWideQuick | O::IputWideQuick => {
                pair(insn.a, pc)?;
                reg(insn.b, pc)?;
            }
            _ => {
                debug_assert!(insn.opcode.quick_field_kind().is_some());
                reg(insn.a, pc)?;
                reg(insn.b, pc)?;
            }
        }
        if insn.opcode.is_branch() && insn.target() >= len {
            return Err(format!("branch target {} out of range at pc {}", insn.target(), pc));
        }
    }

    let last = method.code[method.code.len() - 1].opcode;
    if !matches!(
        last,
        Opcode::ReturnVoid
            | Opcode::Return
            | Opcode::ReturnWide
            | Opcode::ReturnObject
            | Opcode::Goto
            | Opcode::Throw
    ) {
        return Err("execution can fall off the end of the code".to_string());
    }

    for t in method.tries.iter() {
        if t.start >= t.end || t.end > len || t.handler >= len {
            return Err(format!(
                "bad try range [{}, {}) -> {}",
                t.start, t.end, t.handler
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
entry = "Main.main"

[[classes]]
name = "Point"
fields = [
    { name = "x", kind = "int" },
    { name = "y", kind = "int" },
]

[[methods]]
name = "Main.main"
registers = 3
code = [
    { op = "new-instance", dst = 0, class = "Point" },
    { op = "const", dst = 1, value = 4 },
    { op = "iput", src = 1, obj = 0, field = "Point.y" },
    { op = "invoke", method = "Main.twice", args = [1], dst = 2 },
    { op = "return", src = 2 },
]
tries = [{ start = 0, end = 4, handler = 4, class = "java.lang.Throwable" }]

[[methods]]
name = "Main.twice"
registers = 2
ins = 1
compiled = true
code = [
    { op = "add-int", dst = 0, a = 1, b = 1 },
    { op = "return", src = 0 },
]
"#;

    fn ids(program: &Program) -> HashMap<String, MethodId> {
        program
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), MethodId(i as u32)))
            .collect()
    }

    #[test]
    fn test_parse_program() {
        let program = Program::from_toml_str(SOURCE).unwrap();
        assert_eq!(program.entry, "Main.main");
        assert_eq!(program.classes[0].fields.len(), 2);
        assert_eq!(program.methods.len(), 2);
        assert!(program.methods[1].compiled);
        assert!(program.threads.is_empty());
    }

    #[test]
    fn test_link_interns_operands() {
        let program = Program::from_toml_str(SOURCE).unwrap();
        let ids = ids(&program);
        let method = link_method(MethodId(0), &program.methods[0], &ids).unwrap();

        assert_eq!(method.code().len(), 5);
        let new_instance = &method.code()[0];
        assert_eq!(method.type_name(new_instance.index), "Point");
        let iput = &method.code()[2];
        assert_eq!(method.field_name(iput.index), ("Point", "y"));
        let invoke = &method.code()[3];
        assert_eq!(method.callee(invoke.index), MethodId(1));
        assert_eq!(&*invoke.args, &[1]);
        let catch_type = method.tries()[0].catch_type.unwrap();
        assert_eq!(method.type_name(catch_type), "java.lang.Throwable");
        assert!(method.tries()[0].covers(3));
        assert!(!method.tries()[0].covers(4));
    }

    #[test]
    fn test_link_rejects_unknown_callee() {
        let mut program = Program::from_toml_str(SOURCE).unwrap();
        program.methods.truncate(1);
        let ids = ids(&program);
        assert!(matches!(
            link_method(MethodId(0), &program.methods[0], &ids),
            Err(RuntimeError::UnknownMethod(_))
        ));
    }

    fn link_one(code: &str, registers: u16) -> Result<Method> {
        let text = format!(
            "[[methods]]\nname = \"T.t\"\nregisters = {}\ncode = {}\n",
            registers, code
        );
        let program = Program::from_toml_str(&text)?;
        link_method(MethodId(0), &program.methods[0], &ids(&program))
    }

    #[test]
    fn test_verify_rejects_bad_bodies() {
        // register out of range
        assert!(link_one(r#"[{ op = "const", dst = 2, value = 0 }, { op = "return-void" }]"#, 2).is_err());
        // incomplete wide pair
        assert!(link_one(r#"[{ op = "const-wide", dst = 1, value = 0 }, { op = "return-void" }]"#, 2).is_err());
        // branch outside code
        assert!(link_one(r#"[{ op = "goto", target = 5 }]"#, 1).is_err());
        // falls off the end
        assert!(link_one(r#"[{ op = "nop" }]"#, 1).is_err());
        assert!(link_one(r#"[{ op = "nop" }, { op = "goto", target = 0 }]"#, 1).is_ok());
    }

    #[test]
    fn test_unknown_instruction_fields_rejected() {
        assert!(link_one(r#"[{ op = "return-void", bogus = 1 }]"#, 1).is_err());
        assert!(link_one(r#"[{ op = "frobnicate" }]"#, 1).is_err());
    }
}
