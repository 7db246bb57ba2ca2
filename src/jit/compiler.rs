//! Template compiler for method bodies.
//!
//! Each bytecode instruction is expanded into a fixed template. The
//! templates themselves are placeholders; what matters to the runtime is
//! the metadata produced alongside them:
//! - a call-site safepoint after every instruction that may throw or call
//! - a catch entry at the start of every exception handler
//! - an OSR entry at every loop header
//! - a frame layout sized for the method's registers

use super::builder::{CompiledMethod, CompiledMethodBuilder};
use super::stackmap::{FrameInfo, RefBitset, StackMapError};
use crate::isa::{STACK_ALIGNMENT, align_up};
use crate::vm::{Method, Opcode};

/// Frame pointer and link register are saved by every prologue.
const CORE_SPILL_MASK: u32 = (1 << 29) | (1 << 30);

/// Return address plus the method slot.
const FRAME_HEADER_SIZE: usize = 16;

/// Template opcodes
mod templates {
    pub const PROLOGUE: [u8; 4] = [0x55, 0x48, 0x89, 0xe5];
    pub const SAFEPOINT_POLL: u8 = 0x90;
    pub const CALL: u8 = 0xe8;
    pub const JUMP: u8 = 0xe9;
    pub const RETURN: u8 = 0xc3;
}

/// Frame size for a method with `registers` virtual registers.
pub fn frame_size_for(registers: u16) -> u32 {
    align_up(FRAME_HEADER_SIZE + 4 * registers as usize, STACK_ALIGNMENT) as u32
}

/// Registers that may hold a reference somewhere in `method`.
fn reference_registers(method: &Method) -> RefBitset {
    let mut refs = RefBitset::new();
    let mut mark = |reg: u16| {
        if reg < 64 {
            refs.set(reg as usize);
        }
    };
    for insn in method.code() {
        match insn.opcode {
            Opcode::ConstNull
            | Opcode::MoveObject
            | Opcode::MoveException
            | Opcode::NewInstance
            | Opcode::CheckCast
            | Opcode::IgetObjectQuick => mark(insn.a),
            Opcode::ReturnObject | Opcode::Throw => mark(insn.a),
            Opcode::IputObjectQuick => {
                mark(insn.a);
                mark(insn.b);
            }
            op if op.quick_field_kind().is_some() => mark(insn.b),
            Opcode::Iget | Opcode::Iput | Opcode::InstanceOf => mark(insn.b),
            _ => {}
        }
    }
    refs
}

pub struct TemplateCompiler {
    buf: CompiledMethodBuilder,
    /// (offset of the rel32 operand, target dex pc)
    forward_refs: Vec<(u32, u32)>,
}

impl TemplateCompiler {
    pub fn new() -> Self {
        Self {
            buf: CompiledMethodBuilder::new(),
            forward_refs: Vec::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(method = method.name()))]
    pub fn compile(mut self, method: &Method) -> Result<CompiledMethod, StackMapError> {
        let live_refs = reference_registers(method);
        let handlers: Vec<u32> = method.tries().iter().map(|t| t.handler).collect();
        let loop_headers: Vec<u32> = method
            .code()
            .iter()
            .enumerate()
            .filter(|(pc, insn)| insn.opcode.is_branch() && insn.target() as usize <= *pc)
            .map(|(_, insn)| insn.target())
            .collect();

        self.buf.set_frame_info(
            FrameInfo::new(frame_size_for(method.registers()), CORE_SPILL_MASK, 0),
            method.registers(),
        );
        self.buf.emit_bytes(&templates::PROLOGUE);

        for (pc, insn) in method.code().iter().enumerate() {
            let pc = pc as u32;
            self.buf.bind_dex_pc(pc);
            if handlers.contains(&pc) {
                self.buf.record_catch_entry(pc);
            }
            if loop_headers.contains(&pc) {
                self.buf.emit_u8(templates::SAFEPOINT_POLL);
                self.buf.record_osr_entry(pc, live_refs);
            }

            self.buf.emit_u8(insn.opcode as u8);
            self.buf.emit_u16(insn.a);
            self.buf.emit_u16(insn.b);
            self.buf.emit_u16(insn.c);

            if insn.opcode.is_branch() {
                self.buf.emit_u8(templates::JUMP);
                self.forward_refs.push((self.buf.offset(), insn.target()));
                self.buf.emit_u32(0);
            }
            if insn.opcode.can_throw() {
                // Call the runtime helper; the return address is the safepoint.
                self.buf.emit_u8(templates::CALL);
                self.buf.emit_u32(insn.opcode as u32);
                self.buf.record_call_site(pc, live_refs);
            }
            if matches!(
                insn.opcode,
                Opcode::ReturnVoid | Opcode::Return | Opcode::ReturnWide | Opcode::ReturnObject
            ) {
                self.buf.emit_u8(templates::RETURN);
            }
        }

        self.patch_forward_refs();
        self.buf.build()
    }

    fn patch_forward_refs(&mut self) {
        for (at, target) in std::mem::take(&mut self.forward_refs) {
            // Targets were verified when the method was linked.
            if let Some(dest) = self.buf.offset_of_dex_pc(target) {
                let rel = i64::from(dest) - (i64::from(at) + 4);
                self.buf.patch_u32(at, rel as i32 as u32);
            }
        }
    }
}

impl Default for TemplateCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{MethodId, Program};
    use std::collections::HashMap;

    fn method(source: &str) -> Method {
        let program = Program::from_toml_str(source).unwrap();
        let ids: HashMap<String, MethodId> = program
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), MethodId(i as u32)))
            .collect();
        crate::vm::link_method(MethodId(0), &program.methods[0], &ids).unwrap()
    }

    const LOOP: &str = r#"
[[methods]]
name = "Main.loop"
registers = 3
code = [
    { op = "const", dst = 0, value = 0 },
    { op = "const", dst = 1, value = 10 },
    { op = "add-int-lit", dst = 0, src = 0, value = 1 },
    { op = "div-int", dst = 2, a = 1, b = 0 },
    { op = "if-lt", a = 0, b = 1, target = 2 },
    { op = "return", src = 0 },
    { op = "move-exception", dst = 2 },
    { op = "return", src = 0 },
]
tries = [{ start = 2, end = 5, handler = 6 }]
"#;

    #[test]
    fn test_frame_size_is_stack_aligned() {
        for registers in [0, 1, 3, 4, 5, 17, 255] {
            assert_eq!(frame_size_for(registers) as usize % STACK_ALIGNMENT, 0);
        }
        assert_eq!(frame_size_for(0), 16);
        assert_eq!(frame_size_for(1), 32);
    }

    #[test]
    fn test_safepoints_for_throwing_instructions() {
        let method = method(LOOP);
        let compiled = TemplateCompiler::new().compile(&method).unwrap();
        let table = compiled.stack_map.unwrap();

        // div-int is the only instruction that may throw.
        assert!(table.for_dex_pc(3).is_some());
        assert!(table.for_dex_pc(2).is_none());
        assert!(table.catch_for_dex_pc(6).is_some());
        assert!(table.osr_entry_for_dex_pc(2).is_some());
        assert_eq!(table.num_vregs(), 3);
        assert_eq!(table.frame_info().core_spill_mask(), CORE_SPILL_MASK);

        let call = table.for_dex_pc(3).unwrap();
        assert_eq!(table.for_native_pc_offset(call.native_pc_offset), Some(call));
        assert!(call.native_pc_offset as usize <= compiled.code.len());
    }
}
