//! Compiled code support.
//!
//! This module provides what the runtime needs to live alongside native
//! code produced by an external compiler:
//! - Executable memory allocation
//! - A builder for code images and their stack maps
//! - A template compiler producing those images from method bodies
//! - The header glued in front of every code blob
//! - The code cache mapping PCs back to methods

mod builder;
mod code_cache;
mod compiler;
mod header;
mod memory;
pub mod stackmap;

pub use builder::{CompiledMethod, CompiledMethodBuilder};
pub use code_cache::CodeCache;
pub use compiler::{TemplateCompiler, frame_size_for};
pub use header::{CODE_OFFSET, CompiledCodeHeader, STUB_CODE_SIZE, UNKNOWN_NATIVE_PC};
pub use memory::{ExecutableMemory, MemoryError};
pub use stackmap::{
    DEX_NO_INDEX, FrameInfo, RefBitset, StackMapEntry, StackMapError, StackMapKind, StackMapTable,
};
