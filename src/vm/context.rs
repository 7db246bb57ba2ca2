//! Per-thread execution state.
//!
//! An `ExecutionContext` is the only handle through which a thread runs
//! managed code. It owns the thread's frame stack and exception slot and
//! is the thread's side of the safepoint protocol: whenever it polls or
//! leaves managed code it hands the collector exactly the references held
//! in its frames' registers, its exception slot and its local references.

use std::sync::Arc;

use super::gc::RootVisitor;
use super::interpreter;
use super::program::Method;
use super::runtime::Runtime;
use super::threads::ThreadRecord;
use super::value::{JValue, ObjRef, Register};
use crate::error::{Result, RuntimeError};
use crate::jit::CompiledCodeHeader;

/// How a frame is being executed.
#[derive(Debug, Clone)]
pub enum FrameMode {
    Interpreted,
    /// Running the method's compiled code. `native_pc` is the return
    /// address of the call site currently in flight.
    Quick {
        header: Arc<CompiledCodeHeader>,
        native_pc: usize,
    },
}

/// One activation of a managed method.
///
/// The caller is the frame below this one on the context's stack.
#[derive(Debug)]
pub struct ExecutionFrame {
    pub(crate) method: Arc<Method>,
    pub(crate) registers: Vec<Register>,
    pub(crate) dex_pc: u32,
    pub(crate) thread_id: u32,
    pub(crate) mode: FrameMode,
}

impl ExecutionFrame {
    pub(crate) fn new(method: Arc<Method>, thread_id: u32, mode: FrameMode) -> Self {
        let registers = vec![Register::default(); method.registers() as usize];
        Self {
            method,
            registers,
            dex_pc: 0,
            thread_id,
            mode,
        }
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn mode(&self) -> &FrameMode {
        &self.mode
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn is_quick(&self) -> bool {
        matches!(self.mode, FrameMode::Quick { .. })
    }

    /// Fall back to interpretation at the current dex pc.
    pub(crate) fn deoptimize(&mut self) {
        if let FrameMode::Quick { header, .. } = &self.mode {
            tracing::debug!(
                method = self.method.name(),
                dex_pc = self.dex_pc,
                code = %format_args!("{:#x}", header.code_address()),
                "deoptimizing frame"
            );
            self.mode = FrameMode::Interpreted;
        }
    }

    fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        for reg in &self.registers {
            if let Some(r) = reg.reference() {
                visitor.visit_root(r);
            }
        }
    }
}

pub struct ExecutionContext {
    runtime: Arc<Runtime>,
    thread: Arc<ThreadRecord>,
    /// Pending exception; at most one at a time
    exception: Option<ObjRef>,
    pub(crate) frames: Vec<ExecutionFrame>,
    /// References handed out to the host; kept alive until cleared
    local_refs: Vec<ObjRef>,
}

impl ExecutionContext {
    /// Attach `thread` (registered but still in native state) to managed code.
    pub(crate) fn new(runtime: Arc<Runtime>, thread: Arc<ThreadRecord>) -> Self {
        thread.leave_native();
        Self {
            runtime,
            thread,
            exception: None,
            frames: Vec::new(),
            local_refs: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn thread_id(&self) -> u32 {
        self.thread.id()
    }

    pub fn thread_name(&self) -> &str {
        self.thread.name()
    }

    pub fn frames(&self) -> &[ExecutionFrame] {
        &self.frames
    }

    pub(crate) fn top(&self) -> &ExecutionFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => crate::fatal!("no managed frame on thread {}", self.thread_id()),
        }
    }

    pub(crate) fn top_mut(&mut self) -> &mut ExecutionFrame {
        let id = self.thread.id();
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => crate::fatal!("no managed frame on thread {}", id),
        }
    }

    // -------------------------------------------------------------------------
    // Registers of the current frame
    // -------------------------------------------------------------------------

    pub(crate) fn reg(&self, index: u16) -> Register {
        self.top().registers[index as usize]
    }

    pub(crate) fn set_reg(&mut self, index: u16, value: Register) {
        self.top_mut().registers[index as usize] = value;
    }

    /// A wide value held in the pair `index`, `index + 1` (low word first).
    pub(crate) fn wide(&self, index: u16) -> i64 {
        let regs = &self.top().registers;
        let lo = regs[index as usize].bits() as u64;
        let hi = regs[index as usize + 1].bits() as u64;
        ((hi << 32) | lo) as i64
    }

    pub(crate) fn set_wide(&mut self, index: u16, value: i64) {
        let regs = &mut self.top_mut().registers;
        if index as usize + 1 >= regs.len() {
            crate::fatal!("register pair v{} out of range", index);
        }
        regs[index as usize] = Register::from_bits(value as u32);
        regs[index as usize + 1] = Register::from_bits((value as u64 >> 32) as u32);
    }

    // -------------------------------------------------------------------------
    // Exception slot
    // -------------------------------------------------------------------------

    pub fn is_exception_pending(&self) -> bool {
        self.exception.is_some()
    }

    pub fn pending_exception(&self) -> Option<ObjRef> {
        self.exception
    }

    /// Raise `exception`. A thread never holds two pending exceptions: the
    /// newer one replaces the older.
    pub fn set_exception(&mut self, exception: ObjRef) {
        if let Some(previous) = self.exception {
            tracing::debug!(?previous, ?exception, "replacing pending exception");
        }
        self.exception = Some(exception);
    }

    /// Consume the pending exception.
    pub fn take_exception(&mut self) -> Option<ObjRef> {
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    // -------------------------------------------------------------------------
    // Roots and safepoints
    // -------------------------------------------------------------------------

    /// Report every reference this thread keeps alive.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        for frame in &self.frames {
            frame.visit_roots(visitor);
        }
        if let Some(exception) = self.exception {
            visitor.visit_root(exception);
        }
        visitor.visit_roots(&self.local_refs);
    }

    /// Safepoint poll: block here if a suspension has been requested.
    pub fn poll_safepoint(&self) {
        if self.thread.suspend_requested() {
            self.thread.check_suspend(|roots| self.visit_roots(roots));
        }
    }

    /// Leave managed code, e.g. before blocking on another thread.
    pub fn enter_native(&self) {
        self.thread.enter_native(|roots| self.visit_roots(roots));
    }

    pub fn leave_native(&self) {
        self.thread.leave_native();
    }

    /// Keep `r` alive while the host holds it.
    pub fn add_local_ref(&mut self, r: ObjRef) {
        self.local_refs.push(r);
    }

    pub fn clear_local_refs(&mut self) {
        self.local_refs.clear();
    }

    /// Run a full collection from this thread.
    pub fn collect_garbage(&self) {
        let runtime = &self.runtime;
        // Publish our roots while waiting: another thread may be collecting.
        self.enter_native();
        let cycle = runtime.collector.lock_cycle();
        self.leave_native();
        runtime.collector.collect(
            &cycle,
            &runtime.heap,
            &runtime.threads,
            Some(self.thread_id()),
            &|visitor| {
                self.visit_roots(visitor);
                runtime.visit_global_roots(visitor);
            },
        );
    }

    // -------------------------------------------------------------------------
    // Host entry points
    // -------------------------------------------------------------------------

    /// Invoke a method by name.
    pub fn invoke(&mut self, name: &str, args: &[JValue]) -> Result<JValue> {
        let method = self
            .runtime
            .method_by_name(name)
            .ok_or_else(|| RuntimeError::UnknownMethod(name.to_string()))?;
        self.invoke_method(&method, args)
    }

    /// Invoke `method`. An exception escaping the method is returned as
    /// [`RuntimeError::UncaughtException`] and the slot is cleared.
    pub fn invoke_method(&mut self, method: &Arc<Method>, args: &[JValue]) -> Result<JValue> {
        let width: usize = args.iter().map(JValue::register_width).sum();
        if width != method.ins() as usize {
            return Err(RuntimeError::InvalidProgram(format!(
                "{} takes {} argument registers, got {}",
                method.name(),
                method.ins(),
                width
            )));
        }

        let mut registers = Vec::with_capacity(width);
        for arg in args {
            match *arg {
                JValue::Void => {}
                JValue::Int(n) => registers.push(Register::from_int(n)),
                JValue::Wide(n) => {
                    registers.push(Register::from_bits(n as u32));
                    registers.push(Register::from_bits((n as u64 >> 32) as u32));
                }
                JValue::Ref(r) => registers.push(Register::from_ref(r)),
            }
        }

        match interpreter::execute(self, Arc::clone(method), &registers) {
            Some(value) => {
                if let JValue::Ref(Some(r)) = value {
                    self.add_local_ref(r);
                }
                Ok(value)
            }
            None => match self.take_exception() {
                Some(exception) => Err(self.runtime.describe_exception(exception)),
                None => crate::fatal!("{} unwound without a pending exception", method.name()),
            },
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.runtime.threads.unregister(&self.thread);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("thread", &self.thread.id())
            .field("frames", &self.frames.len())
            .field("exception", &self.exception)
            .finish()
    }
}
