//! Builder for compiled method images.
//!
//! Code producers emit machine code bytes and record safepoints as they go;
//! `build` checks the metadata against the finished code and hands back a
//! `CompiledMethod` ready for the code cache.

use std::collections::BTreeMap;

use super::stackmap::{FrameInfo, RefBitset, StackMapEntry, StackMapError, StackMapKind, StackMapTable};

/// Output of a code producer: code bytes plus optional stack map.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub code: Vec<u8>,
    pub stack_map: Option<StackMapTable>,
}

/// A buffer for building one compiled method.
#[derive(Debug, Default)]
pub struct CompiledMethodBuilder {
    code: Vec<u8>,
    /// Native offset of the first byte emitted for each bytecode pc.
    pc_offsets: BTreeMap<u32, u32>,
    frame_info: FrameInfo,
    num_vregs: u16,
    entries: Vec<StackMapEntry>,
    optimized: bool,
}

impl CompiledMethodBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Native offset the next emitted byte will land at.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit_bytes(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend(bytes);
    }

    /// Mark the current offset as the start of bytecode `dex_pc`.
    pub fn bind_dex_pc(&mut self, dex_pc: u32) {
        let at = self.offset();
        self.pc_offsets.entry(dex_pc).or_insert(at);
    }

    pub fn offset_of_dex_pc(&self, dex_pc: u32) -> Option<u32> {
        self.pc_offsets.get(&dex_pc).copied()
    }

    /// Overwrite four already emitted bytes, used for forward jumps.
    pub fn patch_u32(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Declare the frame layout. Marks the method as optimized, so a stack
    /// map is emitted even when no safepoint is recorded.
    pub fn set_frame_info(&mut self, frame_info: FrameInfo, num_vregs: u16) {
        self.frame_info = frame_info;
        self.num_vregs = num_vregs;
        self.optimized = true;
    }

    /// Record a call site whose return address is the current offset.
    pub fn record_call_site(&mut self, dex_pc: u32, live_refs: RefBitset) {
        self.record(StackMapKind::Default, dex_pc, live_refs);
    }

    /// Record the entry of the catch block for the handler at `dex_pc`.
    pub fn record_catch_entry(&mut self, dex_pc: u32) {
        self.record(StackMapKind::Catch, dex_pc, RefBitset::new());
    }

    pub fn record_osr_entry(&mut self, dex_pc: u32, live_refs: RefBitset) {
        self.record(StackMapKind::Osr, dex_pc, live_refs);
    }

    fn record(&mut self, kind: StackMapKind, dex_pc: u32, live_refs: RefBitset) {
        let mut entry = StackMapEntry::new(self.offset(), dex_pc, kind);
        entry.live_refs = live_refs;
        self.entries.push(entry);
        self.optimized = true;
    }

    /// Finish the method.
    pub fn build(self) -> Result<CompiledMethod, StackMapError> {
        let code_size = self.code.len() as u32;
        if let Some(bad) = self
            .entries
            .iter()
            .find(|e| e.native_pc_offset > code_size)
        {
            return Err(StackMapError::OutOfRange {
                offset: bad.native_pc_offset,
                code_size,
            });
        }

        let stack_map = if self.optimized {
            Some(StackMapTable::new(
                self.frame_info,
                self.num_vregs,
                self.entries,
            )?)
        } else {
            None
        };
        Ok(CompiledMethod {
            code: self.code,
            stack_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_pcs_and_patching() {
        let mut b = CompiledMethodBuilder::new();
        b.emit_u8(0x90);
        b.bind_dex_pc(0);
        b.emit_u32(0xdeadbeef);
        b.bind_dex_pc(0);
        b.emit_u16(0x0102);
        assert_eq!(b.offset(), 7);
        assert_eq!(b.offset_of_dex_pc(0), Some(1));
        assert_eq!(b.offset_of_dex_pc(1), None);

        b.patch_u32(1, 0x0403_0201);
        let method = b.build().unwrap();
        assert_eq!(&method.code[..5], &[0x90, 1, 2, 3, 4]);
    }

    #[test]
    fn test_plain_code_has_no_stack_map() {
        let mut b = CompiledMethodBuilder::new();
        b.emit_bytes(&[0xc3; 16]);
        let method = b.build().unwrap();
        assert_eq!(method.code.len(), 16);
        assert!(method.stack_map.is_none());
    }

    #[test]
    fn test_safepoints_recorded_at_current_offset() {
        let mut b = CompiledMethodBuilder::new();
        b.set_frame_info(FrameInfo::new(32, 0, 0), 4);
        b.emit_bytes(&[0; 8]);
        let mut refs = RefBitset::new();
        refs.set(2);
        b.record_call_site(3, refs);
        b.emit_bytes(&[0; 8]);
        b.record_catch_entry(10);

        let method = b.build().unwrap();
        let table = method.stack_map.unwrap();
        assert_eq!(table.for_dex_pc(3).unwrap().native_pc_offset, 8);
        assert!(table.for_dex_pc(3).unwrap().live_refs.is_set(2));
        assert_eq!(table.catch_for_dex_pc(10).unwrap().native_pc_offset, 16);
    }

    #[test]
    fn test_misaligned_frame_rejected() {
        let mut b = CompiledMethodBuilder::new();
        b.set_frame_info(FrameInfo::new(20, 0, 0), 1);
        b.emit_u32(0);
        assert!(matches!(b.build(), Err(StackMapError::MisalignedFrame(20))));
    }
}
