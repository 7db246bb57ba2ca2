//! The managed side of the runtime: program loading, the heap and its
//! collector, threads, and the dispatch loop that runs method bodies.

pub mod bytecode;
pub mod class;
pub mod entrypoints;
pub mod gc;
pub mod heap;
pub mod stack_walk;
pub mod threads;

mod context;
mod interpreter;
mod program;
mod runtime;
mod value;

pub use bytecode::{FieldKind, InsnSpec, Instruction, Opcode};
pub use context::{ExecutionContext, ExecutionFrame, FrameMode};
pub use gc::{GcStats, RootVisitor};
pub use program::{
    ClassSpec, FieldSpec, Method, MethodId, MethodSpec, Program, ResolvedField, ThreadSpec,
    TryItem, TrySpec,
};
pub use runtime::Runtime;
pub use threads::ThreadHandle;
pub use value::{JValue, ObjRef, Register};

#[cfg(test)]
pub(crate) use program::link_method;
