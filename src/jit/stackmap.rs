//! Stack maps for compiled code.
//!
//! A stack map table travels with every optimized code blob. It records the
//! frame layout of the method and, for each safepoint, which bytecode
//! position the native PC corresponds to and which virtual registers hold
//! references. The table is stored in a compact little-endian encoding in
//! front of the method header and decoded on demand.
//!
//! Encoding:
//!
//! ```text
//! +------------+------------+----------+-----------+-------------+
//! | frame size | core spill | fp spill | num vregs | num entries |   16 bytes
//! |    u32     |    u32     |   u32    |    u16    |     u16     |
//! +------------+------------+----------+-----------+-------------+
//! | native pc | dex pc | kind | pad x3 | register mask | vreg refs |   24 bytes
//! |    u32    |  u32   |  u8  |        |      u32      |    u64    |   per entry
//! +-----------+--------+------+--------+---------------+-----------+
//! ```

use thiserror::Error;

use crate::isa::STACK_ALIGNMENT;

/// Sentinel bytecode position meaning "unknown".
pub const DEX_NO_INDEX: u32 = u32::MAX;

const TABLE_HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackMapError {
    #[error("stack map truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid stack map kind {0}")]
    InvalidKind(u8),
    #[error("frame size {0} is not a multiple of the stack alignment")]
    MisalignedFrame(u32),
    #[error("duplicate safepoint at native pc offset {0:#x}")]
    DuplicateNativePc(u32),
    #[error("safepoint at native pc offset {offset:#x} lies outside {code_size} bytes of code")]
    OutOfRange { offset: u32, code_size: u32 },
    #[error("too many stack map entries ({0})")]
    TooManyEntries(usize),
    #[error("stack map entries are not sorted by native pc")]
    Unsorted,
}

/// A bitset for tracking which virtual registers hold references.
/// Supports up to 64 registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefBitset(u64);

impl RefBitset {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < 64, "RefBitset supports max 64 slots");
        self.0 |= 1 << index;
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= 64 {
            return false;
        }
        (self.0 & (1 << index)) != 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn iter_set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(|&i| self.is_set(i))
    }
}

/// What a safepoint is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StackMapKind {
    /// Call site or other safepoint; keyed by the return address.
    Default = 0,
    /// Entry of a catch block; used only for exception delivery.
    Catch = 1,
    /// On-stack-replacement entry from the interpreter.
    Osr = 2,
}

impl StackMapKind {
    fn from_raw(raw: u8) -> Result<Self, StackMapError> {
        match raw {
            0 => Ok(StackMapKind::Default),
            1 => Ok(StackMapKind::Catch),
            2 => Ok(StackMapKind::Osr),
            other => Err(StackMapError::InvalidKind(other)),
        }
    }
}

/// A single safepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapEntry {
    /// Offset of the safepoint from the start of the code
    pub native_pc_offset: u32,
    /// Bytecode position of the safepoint
    pub dex_pc: u32,
    pub kind: StackMapKind,
    /// Machine registers holding references
    pub register_mask: u32,
    /// Virtual registers holding references
    pub live_refs: RefBitset,
}

impl StackMapEntry {
    pub fn new(native_pc_offset: u32, dex_pc: u32, kind: StackMapKind) -> Self {
        Self {
            native_pc_offset,
            dex_pc,
            kind,
            register_mask: 0,
            live_refs: RefBitset::new(),
        }
    }
}

/// Frame layout of a compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    frame_size_in_bytes: u32,
    core_spill_mask: u32,
    fp_spill_mask: u32,
}

impl FrameInfo {
    pub fn new(frame_size_in_bytes: u32, core_spill_mask: u32, fp_spill_mask: u32) -> Self {
        Self {
            frame_size_in_bytes,
            core_spill_mask,
            fp_spill_mask,
        }
    }

    pub fn frame_size_in_bytes(&self) -> u32 {
        self.frame_size_in_bytes
    }

    pub fn core_spill_mask(&self) -> u32 {
        self.core_spill_mask
    }

    pub fn fp_spill_mask(&self) -> u32 {
        self.fp_spill_mask
    }

    fn check_alignment(&self) -> Result<(), StackMapError> {
        if self.frame_size_in_bytes as usize % STACK_ALIGNMENT != 0 {
            return Err(StackMapError::MisalignedFrame(self.frame_size_in_bytes));
        }
        Ok(())
    }
}

/// Decoded stack map table for one compiled method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackMapTable {
    frame_info: FrameInfo,
    num_vregs: u16,
    /// Sorted by native pc offset, then kind
    entries: Vec<StackMapEntry>,
}

impl StackMapTable {
    /// Build a table, validating the invariants the decoder relies on.
    pub fn new(
        frame_info: FrameInfo,
        num_vregs: u16,
        mut entries: Vec<StackMapEntry>,
    ) -> Result<Self, StackMapError> {
        frame_info.check_alignment()?;
        if entries.len() > u16::MAX as usize {
            return Err(StackMapError::TooManyEntries(entries.len()));
        }
        entries.sort_by_key(|e| (e.native_pc_offset, e.kind));
        for pair in entries.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.native_pc_offset == b.native_pc_offset
                && a.kind != StackMapKind::Catch
                && b.kind != StackMapKind::Catch
            {
                return Err(StackMapError::DuplicateNativePc(a.native_pc_offset));
            }
        }
        Ok(Self {
            frame_info,
            num_vregs,
            entries,
        })
    }

    pub fn frame_info(&self) -> FrameInfo {
        self.frame_info
    }

    pub fn num_vregs(&self) -> u16 {
        self.num_vregs
    }

    pub fn entries(&self) -> &[StackMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Safepoint whose return address is exactly `native_pc_offset`.
    /// Catch entries are never returned: they are not return addresses.
    pub fn for_native_pc_offset(&self, native_pc_offset: u32) -> Option<&StackMapEntry> {
        let start = self
            .entries
            .partition_point(|e| e.native_pc_offset < native_pc_offset);
        self.entries[start..]
            .iter()
            .take_while(|e| e.native_pc_offset == native_pc_offset)
            .find(|e| e.kind != StackMapKind::Catch)
    }

    /// Call-site safepoint recorded for `dex_pc`.
    pub fn for_dex_pc(&self, dex_pc: u32) -> Option<&StackMapEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == StackMapKind::Default && e.dex_pc == dex_pc)
    }

    /// Catch block entry recorded for the handler at `dex_pc`.
    pub fn catch_for_dex_pc(&self, dex_pc: u32) -> Option<&StackMapEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == StackMapKind::Catch && e.dex_pc == dex_pc)
    }

    pub fn osr_entry_for_dex_pc(&self, dex_pc: u32) -> Option<&StackMapEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == StackMapKind::Osr && e.dex_pc == dex_pc)
    }

    /// Size of the encoded table in bytes.
    pub fn encoded_len(&self) -> usize {
        TABLE_HEADER_SIZE + ENTRY_SIZE * self.entries.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.frame_info.frame_size_in_bytes.to_le_bytes());
        out.extend_from_slice(&self.frame_info.core_spill_mask.to_le_bytes());
        out.extend_from_slice(&self.frame_info.fp_spill_mask.to_le_bytes());
        out.extend_from_slice(&self.num_vregs.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.native_pc_offset.to_le_bytes());
            out.extend_from_slice(&entry.dex_pc.to_le_bytes());
            out.push(entry.kind as u8);
            out.extend_from_slice(&[0; 3]);
            out.extend_from_slice(&entry.register_mask.to_le_bytes());
            out.extend_from_slice(&entry.live_refs.bits().to_le_bytes());
        }
        out
    }

    /// Decode only the frame layout, without materializing the entries.
    pub fn decode_frame_info(bytes: &[u8]) -> Result<FrameInfo, StackMapError> {
        let mut reader = Reader::new(bytes);
        let info = FrameInfo::new(reader.u32()?, reader.u32()?, reader.u32()?);
        info.check_alignment()?;
        Ok(info)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StackMapError> {
        let mut reader = Reader::new(bytes);
        let frame_info = FrameInfo::new(reader.u32()?, reader.u32()?, reader.u32()?);
        frame_info.check_alignment()?;
        let num_vregs = reader.u16()?;
        let count = reader.u16()? as usize;
        reader.require(count * ENTRY_SIZE)?;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let native_pc_offset = reader.u32()?;
            let dex_pc = reader.u32()?;
            let kind = StackMapKind::from_raw(reader.u8()?)?;
            reader.skip(3)?;
            let register_mask = reader.u32()?;
            let live_refs = RefBitset::from_bits(reader.u64()?);
            entries.push(StackMapEntry {
                native_pc_offset,
                dex_pc,
                kind,
                register_mask,
                live_refs,
            });
        }
        if entries
            .windows(2)
            .any(|w| (w[0].native_pc_offset, w[0].kind) > (w[1].native_pc_offset, w[1].kind))
        {
            return Err(StackMapError::Unsorted);
        }

        Ok(Self {
            frame_info,
            num_vregs,
            entries,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn require(&self, len: usize) -> Result<(), StackMapError> {
        let needed = self.pos + len;
        if needed > self.bytes.len() {
            return Err(StackMapError::Truncated {
                needed,
                available: self.bytes.len(),
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], StackMapError> {
        self.require(N)?;
        let mut out = [0; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> Result<(), StackMapError> {
        self.require(len)?;
        self.pos += len;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, StackMapError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, StackMapError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, StackMapError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, StackMapError> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}
