//! Registry of installed compiled code.
//!
//! Each installation gets its own executable mapping laid out as
//! `[padding][stack map][header][code]`, with the code aligned for the
//! configured instruction set. Headers are indexed by address so that any
//! PC can be mapped back to its method.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::builder::CompiledMethod;
use super::header::{CODE_OFFSET, CompiledCodeHeader, STUB_CODE_SIZE};
use super::memory::{ExecutableMemory, MemoryError};
use crate::fatal;
use crate::isa::{InstructionSetPolicy, align_up};
use crate::vm::MethodId;

pub struct CodeCache {
    policy: InstructionSetPolicy,
    /// Header address -> header
    by_address: RwLock<BTreeMap<usize, Arc<CompiledCodeHeader>>>,
    /// Current code of each method
    by_method: RwLock<HashMap<MethodId, Arc<CompiledCodeHeader>>>,
}

impl CodeCache {
    pub fn new(policy: InstructionSetPolicy) -> Self {
        Self {
            policy,
            by_address: RwLock::new(BTreeMap::new()),
            by_method: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &InstructionSetPolicy {
        &self.policy
    }

    /// Install compiled code for `method`, replacing any previous code.
    ///
    /// Replaced code stays registered: frames may still be executing it.
    #[tracing::instrument(level = "debug", skip(self, compiled), fields(code_size = compiled.code.len()))]
    pub fn install(
        &self,
        method: MethodId,
        compiled: &CompiledMethod,
    ) -> Result<Arc<CompiledCodeHeader>, MemoryError> {
        let code_size = u32::try_from(compiled.code.len())
            .ok()
            .filter(|&size| size < STUB_CODE_SIZE & 0x7FFF_FFFF)
            .ok_or(MemoryError::InvalidSize(compiled.code.len()))?;
        let info = compiled
            .stack_map
            .as_ref()
            .map(|table| table.encode())
            .unwrap_or_default();

        let header = self.materialize(Some(method), &info, code_size, &compiled.code)?;
        tracing::debug!(
            ?method,
            code_size,
            frame_info_offset = header.get_frame_info_offset(),
            "installed compiled code"
        );

        self.by_method.write().insert(method, Arc::clone(&header));
        Ok(header)
    }

    /// Install a stub or trampoline. Its header carries the reserved size
    /// sentinel, so asking it for a code size is fatal.
    pub fn install_stub(&self, code: &[u8]) -> Result<Arc<CompiledCodeHeader>, MemoryError> {
        let header = self.materialize(None, &[], STUB_CODE_SIZE, code)?;
        tracing::debug!(len = code.len(), "installed stub");
        Ok(header)
    }

    fn materialize(
        &self,
        method: Option<MethodId>,
        info: &[u8],
        code_size_and_flags: u32,
        code: &[u8],
    ) -> Result<Arc<CompiledCodeHeader>, MemoryError> {
        let code_offset = align_up(info.len() + CODE_OFFSET, self.policy.alignment());
        let header_offset = code_offset - CODE_OFFSET;
        let frame_info_offset = if info.is_empty() {
            0
        } else {
            (info.len() + CODE_OFFSET) as u32
        };

        let mut image = vec![0u8; code_offset + code.len()];
        image[header_offset - info.len()..header_offset].copy_from_slice(info);
        image[header_offset..header_offset + 4].copy_from_slice(&frame_info_offset.to_le_bytes());
        image[header_offset + 4..code_offset].copy_from_slice(&code_size_and_flags.to_le_bytes());
        image[code_offset..].copy_from_slice(code);

        let memory = Arc::new(ExecutableMemory::from_image(&image)?);
        let header = Arc::new(CompiledCodeHeader::from_parts(
            method,
            memory,
            header_offset,
            frame_info_offset,
            code_size_and_flags,
            self.policy,
        ));
        self.by_address
            .write()
            .insert(header.header_address(), Arc::clone(&header));
        Ok(header)
    }

    /// Header for a raw code pointer. An unknown pointer is fatal.
    pub fn from_code_pointer(&self, code_ptr: usize) -> Arc<CompiledCodeHeader> {
        let address = CompiledCodeHeader::header_address_for(code_ptr, &self.policy);
        match self.by_address.read().get(&address) {
            Some(header) => Arc::clone(header),
            None => fatal!("no compiled code header at {:#x}", address),
        }
    }

    pub fn from_entry_point(&self, entry_point: usize) -> Arc<CompiledCodeHeader> {
        self.from_code_pointer(self.policy.code_pointer(entry_point))
    }

    /// Header whose code contains `pc`, if any. Stubs are never returned.
    pub fn find_by_pc(&self, pc: usize) -> Option<Arc<CompiledCodeHeader>> {
        let map = self.by_address.read();
        let (_, header) = map.range(..=pc).next_back()?;
        if header.is_stub() || !header.contains(pc) {
            return None;
        }
        Some(Arc::clone(header))
    }

    pub fn code_for(&self, method: MethodId) -> Option<Arc<CompiledCodeHeader>> {
        self.by_method.read().get(&method).cloned()
    }

    /// Force frames of `method` back into the interpreter on their next
    /// return. Returns false when the method has no compiled code.
    pub fn invalidate_method(&self, method: MethodId) -> bool {
        match self.code_for(method) {
            Some(header) => {
                header.set_has_should_deoptimize_flag();
                tracing::info!(?method, "invalidated compiled code");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_address.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.read().is_empty()
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("isa", &self.policy.isa())
            .field("entries", &self.len())
            .finish()
    }
}
