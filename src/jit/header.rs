//! Header that precedes every compiled code blob.
//!
//! Memory layout of one installed method:
//!
//! ```text
//!   code_address - frame_info_offset                code_address
//!   |                                                |
//!   v                                                v
//!   +----------------------+-------------+-----------+------------------+
//!   | stack map table      | frame info  | code size |  machine code    |
//!   | (optional)           | offset u32  | + flag u32|                  |
//!   +----------------------+-------------+-----------+------------------+
//!                          ^
//!                          header_address = code_address - CODE_OFFSET
//! ```
//!
//! The header is recovered from any PC inside the code by the code cache.
//! The Rust-side header object is the authority for the code size and the
//! should-deoptimize bit; the in-memory copy is written once at install time.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use super::memory::ExecutableMemory;
use super::stackmap::{DEX_NO_INDEX, FrameInfo, StackMapTable};
use crate::fatal;
use crate::isa::{InstructionSetPolicy, STACK_ALIGNMENT};
use crate::vm::{Method, MethodId};

/// Distance from the header to the first byte of code.
pub const CODE_OFFSET: usize = 8;

/// Code size written by the code generator in front of stubs and trampolines.
pub const STUB_CODE_SIZE: u32 = 0xFFFF_FFFF;

/// Native PC returned when a mapping is missing and the caller asked not to abort.
pub const UNKNOWN_NATIVE_PC: usize = usize::MAX;

const SHOULD_DEOPTIMIZE_MASK: u32 = 0x8000_0000;
const CODE_SIZE_MASK: u32 = !SHOULD_DEOPTIMIZE_MASK;

pub struct CompiledCodeHeader {
    method: Option<MethodId>,
    /// Bytes from the stack map table to the code; 0 = no table
    frame_info_offset: u32,
    /// Code length; the top bit is the should-deoptimize flag
    code_size_and_flags: AtomicU32,
    memory: Arc<ExecutableMemory>,
    /// Offset of the header within `memory`
    header_offset: usize,
    policy: InstructionSetPolicy,
    code_info: OnceLock<StackMapTable>,
}

impl CompiledCodeHeader {
    /// Header address for a raw code pointer.
    ///
    /// Either the code or the header must honor the instruction set
    /// alignment; anything else is a pointer into the middle of a blob.
    pub fn header_address_for(code_ptr: usize, policy: &InstructionSetPolicy) -> usize {
        let header = code_ptr.wrapping_sub(CODE_OFFSET);
        if !policy.is_aligned(code_ptr) && !policy.is_aligned(header) {
            fatal!(
                "misaligned code pointer {:#x} (header {:#x}) for {}",
                code_ptr,
                header,
                policy.isa().name()
            );
        }
        header
    }

    /// Wrap a header that lives at `header_offset` inside `memory`.
    pub fn from_parts(
        method: Option<MethodId>,
        memory: Arc<ExecutableMemory>,
        header_offset: usize,
        frame_info_offset: u32,
        code_size_and_flags: u32,
        policy: InstructionSetPolicy,
    ) -> Self {
        let code_offset = header_offset + CODE_OFFSET;
        if code_offset > memory.len() {
            fatal!(
                "header at offset {} does not fit in {} bytes of code memory",
                header_offset,
                memory.len()
            );
        }
        if frame_info_offset != 0
            && ((frame_info_offset as usize) < CODE_OFFSET
                || frame_info_offset as usize > code_offset)
        {
            fatal!(
                "frame info offset {} points outside the code memory",
                frame_info_offset
            );
        }
        if code_size_and_flags != STUB_CODE_SIZE
            && code_offset + (code_size_and_flags & CODE_SIZE_MASK) as usize > memory.len()
        {
            fatal!(
                "code of {} bytes overruns its memory ({} bytes)",
                code_size_and_flags & CODE_SIZE_MASK,
                memory.len()
            );
        }

        let header = Self {
            method,
            frame_info_offset,
            code_size_and_flags: AtomicU32::new(code_size_and_flags),
            memory,
            header_offset,
            policy,
            code_info: OnceLock::new(),
        };
        Self::header_address_for(header.code_address(), &policy);
        header
    }

    pub fn method(&self) -> Option<MethodId> {
        self.method
    }

    pub fn policy(&self) -> &InstructionSetPolicy {
        &self.policy
    }

    pub fn header_address(&self) -> usize {
        self.memory.base_address() + self.header_offset
    }

    /// Raw address of the first code byte. Never call this address directly;
    /// use [`get_entry_point`](Self::get_entry_point).
    pub fn code_address(&self) -> usize {
        self.header_address() + CODE_OFFSET
    }

    pub fn get_code(&self) -> &[u8] {
        let start = self.header_offset + CODE_OFFSET;
        &self.memory.as_slice()[start..start + self.get_code_size() as usize]
    }

    pub fn get_code_size(&self) -> u32 {
        let raw = self.code_size_and_flags.load(Ordering::Acquire);
        if raw == STUB_CODE_SIZE {
            fatal!(
                "code size read through a stub or trampoline at {:#x}",
                self.code_address()
            );
        }
        raw & CODE_SIZE_MASK
    }

    /// Whether this header fronts a stub or trampoline rather than a method.
    pub fn is_stub(&self) -> bool {
        self.code_size_and_flags.load(Ordering::Acquire) == STUB_CODE_SIZE
    }

    pub fn get_frame_info_offset(&self) -> u32 {
        self.frame_info_offset
    }

    pub fn native_quick_pc_offset(&self, pc: usize) -> usize {
        pc.wrapping_sub(self.get_entry_point())
    }

    pub fn is_optimized(&self) -> bool {
        self.get_code_size() != 0 && self.frame_info_offset != 0
    }

    pub fn get_optimized_code_info_ptr(&self) -> usize {
        if !self.is_optimized() {
            fatal!("no optimized code info at {:#x}", self.code_address());
        }
        self.code_address() - self.frame_info_offset as usize
    }

    /// Legacy vmap table of non-optimized code; `None` when absent.
    pub fn get_vmap_table(&self) -> Option<usize> {
        if self.is_optimized() {
            fatal!("vmap table requested for optimized code");
        }
        if self.frame_info_offset == 0 {
            None
        } else {
            Some(self.code_address() - self.frame_info_offset as usize)
        }
    }

    /// Whether `pc` falls inside this method's code.
    pub fn contains(&self, pc: usize) -> bool {
        let code_start = self.code_address() + self.policy.pc_offset_adjust();
        code_start <= pc && pc <= code_start + self.get_code_size() as usize
    }

    pub fn get_entry_point(&self) -> usize {
        self.policy.entry_point_adjust(self.code_address())
    }

    fn code_info_bytes(&self) -> &[u8] {
        let start = self.get_optimized_code_info_ptr() - self.memory.base_address();
        &self.memory.as_slice()[start..self.header_offset]
    }

    /// Stack map table, decoded on first use.
    pub fn code_info(&self) -> &StackMapTable {
        self.code_info
            .get_or_init(|| match StackMapTable::decode(self.code_info_bytes()) {
                Ok(table) => table,
                Err(e) => fatal!(
                    "corrupt stack map for code at {:#x}: {}",
                    self.code_address(),
                    e
                ),
            })
    }

    pub fn get_frame_info(&self) -> FrameInfo {
        self.code_info().frame_info()
    }

    pub fn get_frame_size_in_bytes(&self) -> u32 {
        let size = self.get_frame_info().frame_size_in_bytes();
        if size as usize % STACK_ALIGNMENT != 0 {
            fatal!("frame size {} is not stack aligned", size);
        }
        size
    }

    /// Native PC for a bytecode position of `method`.
    ///
    /// With `for_catch_handler` the catch block entry is returned instead of
    /// the call-site return address. Returns [`UNKNOWN_NATIVE_PC`] when the
    /// mapping is missing and `abort_on_failure` is false.
    pub fn to_native_quick_pc(
        &self,
        method: &Method,
        dex_pc: u32,
        for_catch_handler: bool,
        abort_on_failure: bool,
    ) -> usize {
        debug_assert_eq!(self.method, Some(method.id()));
        if self.is_optimized() {
            let table = self.code_info();
            let entry = if for_catch_handler {
                table.catch_for_dex_pc(dex_pc)
            } else {
                table.for_dex_pc(dex_pc)
            };
            if let Some(entry) = entry {
                return self.get_entry_point() + entry.native_pc_offset as usize;
            }
        }

        if abort_on_failure {
            fatal!(
                "failed to find native offset for dex pc {:#x} in {} (catch handler: {})",
                dex_pc,
                method.name(),
                for_catch_handler
            );
        }
        UNKNOWN_NATIVE_PC
    }

    /// Bytecode position for a native PC (a return address) in this code.
    ///
    /// Returns [`DEX_NO_INDEX`] when the mapping is missing and
    /// `abort_on_failure` is false.
    pub fn to_dex_pc(&self, method: &Method, pc: usize, abort_on_failure: bool) -> u32 {
        debug_assert_eq!(self.method, Some(method.id()));
        let offset = self.native_quick_pc_offset(pc);
        if self.is_optimized() && offset <= u32::MAX as usize {
            if let Some(entry) = self.code_info().for_native_pc_offset(offset as u32) {
                return entry.dex_pc;
            }
        }

        if abort_on_failure {
            fatal!(
                "failed to find dex pc for native pc {:#x} (offset {:#x}) in {}",
                pc,
                offset,
                method.name()
            );
        }
        DEX_NO_INDEX
    }

    /// Request that the next return into this code falls back to the
    /// interpreter. Safe to call from any thread, any number of times.
    pub fn set_has_should_deoptimize_flag(&self) {
        let previous = self
            .code_size_and_flags
            .fetch_or(SHOULD_DEOPTIMIZE_MASK, Ordering::Release);
        if previous & SHOULD_DEOPTIMIZE_MASK == 0 {
            tracing::debug!(code = %format_args!("{:#x}", self.code_address()), "should-deoptimize set");
        }
    }

    pub fn has_should_deoptimize_flag(&self) -> bool {
        self.code_size_and_flags.load(Ordering::Acquire) & SHOULD_DEOPTIMIZE_MASK != 0
    }
}

impl fmt::Debug for CompiledCodeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCodeHeader")
            .field("method", &self.method)
            .field("code", &format_args!("{:#x}", self.code_address()))
            .field("frame_info_offset", &self.frame_info_offset)
            .field(
                "code_size_and_flags",
                &format_args!("{:#x}", self.code_size_and_flags.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::InstructionSet;
    use crate::jit::stackmap::StackMapKind;
    use crate::jit::{CodeCache, TemplateCompiler};
    use crate::vm::Program;
    use std::collections::HashMap;

    /// Lay out `[info padding][header][code]` with the code at `code_offset`.
    fn raw_header(
        code_offset: usize,
        frame_info_offset: u32,
        code_size: u32,
        isa: InstructionSet,
    ) -> CompiledCodeHeader {
        let image = vec![0u8; code_offset + code_size.max(1) as usize];
        let memory = Arc::new(ExecutableMemory::from_image(&image).unwrap());
        CompiledCodeHeader::from_parts(
            Some(MethodId(0)),
            memory,
            code_offset - CODE_OFFSET,
            frame_info_offset,
            code_size,
            InstructionSetPolicy::new(isa),
        )
    }

    #[test]
    fn test_unoptimized_header_has_no_vmap_table() {
        let header = raw_header(16, 0, 128, InstructionSet::X86_64);
        assert!(!header.is_optimized());
        assert_eq!(header.get_vmap_table(), None);
        assert_eq!(header.get_code_size(), 128);
        assert_eq!(header.get_code().len(), 128);
    }

    #[test]
    fn test_optimized_code_info_ptr() {
        let header = raw_header(48, 40, 64, InstructionSet::Arm64);
        assert!(header.is_optimized());
        assert_eq!(
            header.get_optimized_code_info_ptr(),
            header.code_address() - 40
        );
    }

    #[test]
    fn test_empty_code_is_not_optimized() {
        let header = raw_header(48, 40, 0, InstructionSet::X86_64);
        assert!(!header.is_optimized());
    }

    #[test]
    fn test_deoptimize_flag_does_not_change_code_size() {
        let header = raw_header(16, 0, 100, InstructionSet::X86_64);
        assert!(!header.has_should_deoptimize_flag());
        header.set_has_should_deoptimize_flag();
        assert!(header.has_should_deoptimize_flag());
        assert_eq!(header.get_code_size(), 100);
        header.set_has_should_deoptimize_flag();
        assert!(header.has_should_deoptimize_flag());
    }

    #[test]
    fn test_contains_and_entry_point_untagged() {
        let header = raw_header(16, 0, 32, InstructionSet::X86_64);
        let code = header.code_address();
        assert_eq!(header.get_entry_point(), code);
        assert!(header.contains(code));
        assert!(header.contains(code + 32));
        assert!(!header.contains(code + 33));
        assert!(!header.contains(code - 1));
    }

    #[test]
    fn test_contains_and_entry_point_thumb() {
        let header = raw_header(16, 0, 32, InstructionSet::Arm);
        let code = header.code_address();
        assert_eq!(header.get_entry_point(), code | 1);
        assert!(!header.contains(code));
        assert!(header.contains(code + 1));
        assert!(header.contains(code + 33));
        assert!(!header.contains(code + 34));
        assert_eq!(header.native_quick_pc_offset(code + 9), 8);
    }

    #[test]
    fn test_header_address_for_aligned_code() {
        let policy = InstructionSetPolicy::new(InstructionSet::X86_64);
        assert_eq!(CompiledCodeHeader::header_address_for(0x1010, &policy), 0x1008);
        // Header aligned, code not: still accepted.
        assert_eq!(CompiledCodeHeader::header_address_for(0x1008, &policy), 0x1000);
    }

    #[test]
    #[should_panic(expected = "misaligned code pointer")]
    fn test_header_address_for_misaligned_code() {
        crate::fatal::install_test_hook();
        let policy = InstructionSetPolicy::new(InstructionSet::X86_64);
        CompiledCodeHeader::header_address_for(0x1004, &policy);
    }

    #[test]
    #[should_panic(expected = "stub or trampoline")]
    fn test_stub_code_size_is_fatal() {
        crate::fatal::install_test_hook();
        let header = raw_header(16, 0, STUB_CODE_SIZE, InstructionSet::X86_64);
        header.get_code_size();
    }

    const TWO_DIVISIONS: &str = r#"
[[methods]]
name = "Main.divide"
registers = 3
code = [
    { op = "const", dst = 0, value = 84 },
    { op = "const", dst = 1, value = 2 },
    { op = "div-int", dst = 2, a = 0, b = 1 },
    { op = "const", dst = 1, value = 3 },
    { op = "div-int", dst = 2, a = 2, b = 1 },
    { op = "return", src = 2 },
]
"#;

    fn installed(source: &str) -> (Method, CodeCache, Arc<CompiledCodeHeader>) {
        let program = Program::from_toml_str(source).unwrap();
        let ids: HashMap<String, MethodId> = HashMap::from([(
            program.methods[0].name.clone(),
            MethodId(0),
        )]);
        let method = crate::vm::link_method(MethodId(0), &program.methods[0], &ids).unwrap();
        let compiled = TemplateCompiler::new().compile(&method).unwrap();
        let cache = CodeCache::new(InstructionSetPolicy::new(InstructionSet::X86_64));
        let header = cache.install(method.id(), &compiled).unwrap();
        (method, cache, header)
    }

    #[test]
    fn test_call_site_pcs_round_trip() {
        let (method, _cache, header) = installed(TWO_DIVISIONS);
        assert!(header.is_optimized());

        let call_sites: Vec<u32> = header
            .code_info()
            .entries()
            .iter()
            .filter(|e| e.kind == StackMapKind::Default)
            .map(|e| e.dex_pc)
            .collect();
        assert_eq!(call_sites, vec![2, 4]);

        for dex_pc in call_sites {
            let native = header.to_native_quick_pc(&method, dex_pc, false, true);
            assert!(header.contains(native));
            assert_eq!(header.to_dex_pc(&method, native, true), dex_pc);
        }
    }

    #[test]
    fn test_unmapped_pcs_without_abort() {
        let (method, _cache, header) = installed(TWO_DIVISIONS);
        for dex_pc in [0, 1, 3, 5] {
            assert_eq!(
                header.to_native_quick_pc(&method, dex_pc, false, false),
                UNKNOWN_NATIVE_PC
            );
        }
        // No catch handlers were compiled.
        assert_eq!(
            header.to_native_quick_pc(&method, 2, true, false),
            UNKNOWN_NATIVE_PC
        );
        // The entry point is never a return address.
        assert_eq!(
            header.to_dex_pc(&method, header.get_entry_point(), false),
            DEX_NO_INDEX
        );
    }

    #[test]
    #[should_panic(expected = "failed to find native offset")]
    fn test_unmapped_pc_with_abort_is_fatal() {
        crate::fatal::install_test_hook();
        let (method, _cache, header) = installed(TWO_DIVISIONS);
        header.to_native_quick_pc(&method, 1, false, true);
    }
}
