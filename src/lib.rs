//! quickrt - execution engine for a register-based managed bytecode.
//!
//! This library provides the interpreter, the compiled-code header and
//! stack-map machinery used to map native PCs back to bytecode positions,
//! and the per-thread exception protocol shared by both.

pub mod config;
pub mod error;
pub mod fatal;
pub mod isa;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{GcMode, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use isa::{InstructionSet, InstructionSetPolicy};
pub use jit::{CodeCache, CompiledCodeHeader};
pub use vm::{ExecutionContext, JValue, Program, Runtime};
