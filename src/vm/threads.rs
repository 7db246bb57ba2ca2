//! Thread registry and cooperative suspension.
//!
//! Every thread running managed code is registered in the runtime's
//! `ThreadList`. A collector (or debugger) requests suspension by raising
//! each thread's suspend count; a running thread notices at its next
//! safepoint, publishes its roots and blocks until the count drops back
//! to zero. Threads blocked outside managed code sit in the `Native` state
//! with their roots already published, so they never delay a pause.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::context::ExecutionContext;
use super::value::{JValue, ObjRef};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code; must be waited for
    Running,
    /// Parked at a safepoint
    Suspended,
    /// Outside managed code; roots already published
    Native,
}

#[derive(Debug)]
struct Control {
    state: ThreadState,
    /// Roots published at the last suspension or native transition
    roots: Vec<ObjRef>,
}

/// Per-thread suspension state shared with the thread list.
#[derive(Debug)]
pub struct ThreadRecord {
    id: u32,
    name: String,
    /// Polled without the lock; changed only with it held
    suspend_count: AtomicU32,
    control: Mutex<Control>,
    cond: Condvar,
}

impl ThreadRecord {
    fn new(id: u32, name: &str, suspend_count: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            suspend_count: AtomicU32::new(suspend_count),
            control: Mutex::new(Control {
                state: ThreadState::Native,
                roots: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.control.lock().state
    }

    /// The suspend-check flag polled at every safepoint.
    pub fn suspend_requested(&self) -> bool {
        self.suspend_count.load(Ordering::Acquire) > 0
    }

    /// Block while a suspension is requested. `publish` fills in the
    /// thread's roots before anyone is told the thread has stopped.
    pub fn check_suspend(&self, publish: impl FnOnce(&mut Vec<ObjRef>)) {
        if !self.suspend_requested() {
            return;
        }
        let mut control = self.control.lock();
        if self.suspend_count.load(Ordering::Acquire) == 0 {
            return;
        }
        control.roots.clear();
        publish(&mut control.roots);
        control.state = ThreadState::Suspended;
        self.cond.notify_all();
        tracing::trace!(thread = self.id, "suspended at safepoint");

        while self.suspend_count.load(Ordering::Acquire) > 0 {
            self.cond.wait(&mut control);
        }
        control.state = ThreadState::Running;
        tracing::trace!(thread = self.id, "resumed");
    }

    /// Leave managed code. The roots published here stay valid until
    /// [`leave_native`](Self::leave_native).
    pub fn enter_native(&self, publish: impl FnOnce(&mut Vec<ObjRef>)) {
        let mut control = self.control.lock();
        control.roots.clear();
        publish(&mut control.roots);
        control.state = ThreadState::Native;
        self.cond.notify_all();
    }

    /// Return to managed code, first waiting out any suspension.
    pub fn leave_native(&self) {
        let mut control = self.control.lock();
        while self.suspend_count.load(Ordering::Acquire) > 0 {
            self.cond.wait(&mut control);
        }
        control.state = ThreadState::Running;
    }

    fn request_suspend(&self) {
        let _control = self.control.lock();
        self.suspend_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release_suspend(&self) {
        let _control = self.control.lock();
        let previous = self.suspend_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced resume of thread {}", self.id);
        self.cond.notify_all();
    }

    /// Wait until the thread stops running managed code, then copy its roots.
    fn wait_stopped(&self, roots: &mut Vec<ObjRef>) {
        let mut control = self.control.lock();
        while control.state == ThreadState::Running {
            self.cond.wait(&mut control);
        }
        roots.extend_from_slice(&control.roots);
    }
}

#[derive(Debug, Default)]
struct Registry {
    threads: Vec<Arc<ThreadRecord>>,
    /// Outstanding suspend-all requests; inherited by new threads
    global_suspend: u32,
}

/// All threads attached to a runtime.
#[derive(Debug)]
pub struct ThreadList {
    registry: Mutex<Registry>,
    next_id: AtomicU32,
}

impl ThreadList {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a thread. It starts in the `Native` state; the caller moves
    /// it to `Running` with [`ThreadRecord::leave_native`].
    pub fn register(&self, name: &str) -> Arc<ThreadRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock();
        let record = Arc::new(ThreadRecord::new(id, name, registry.global_suspend));
        registry.threads.push(Arc::clone(&record));
        tracing::debug!(thread = id, name, "thread attached");
        record
    }

    pub fn unregister(&self, record: &ThreadRecord) {
        record.enter_native(|_| {});
        self.registry.lock().threads.retain(|t| t.id != record.id);
        tracing::debug!(thread = record.id, "thread detached");
    }

    pub fn len(&self) -> usize {
        self.registry.lock().threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Suspend every thread except `self_id` and collect their roots.
    ///
    /// Returns once each thread is parked at a safepoint or in native code.
    /// Must be paired with [`resume_all`](Self::resume_all).
    pub fn suspend_all(&self, self_id: Option<u32>) -> Vec<ObjRef> {
        let others: Vec<Arc<ThreadRecord>> = {
            let mut registry = self.registry.lock();
            registry.global_suspend += 1;
            registry
                .threads
                .iter()
                .filter(|t| Some(t.id) != self_id)
                .cloned()
                .collect()
        };
        for thread in &others {
            thread.request_suspend();
        }

        let mut roots = Vec::new();
        for thread in &others {
            thread.wait_stopped(&mut roots);
        }
        tracing::debug!(threads = others.len(), roots = roots.len(), "all threads suspended");
        roots
    }

    pub fn resume_all(&self, self_id: Option<u32>) {
        let mut registry = self.registry.lock();
        registry.global_suspend -= 1;
        for thread in registry.threads.iter().filter(|t| Some(t.id) != self_id) {
            thread.release_suspend();
        }
        tracing::debug!("all threads resumed");
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a spawned managed thread.
#[derive(Debug)]
pub struct ThreadHandle {
    /// Unique thread ID
    pub id: u32,
    handle: Option<JoinHandle<Result<JValue>>>,
}

impl ThreadHandle {
    pub(crate) fn new(id: u32, handle: JoinHandle<Result<JValue>>) -> Self {
        Self {
            id,
            handle: Some(handle),
        }
    }

    /// Wait for the thread to finish and return its result.
    ///
    /// The joining thread is in native state while it waits, so a
    /// collection triggered by the joined thread can proceed.
    pub fn join(mut self, ctx: &mut ExecutionContext) -> Result<JValue> {
        let handle = match self.handle.take() {
            Some(h) => h,
            None => return Err(RuntimeError::ThreadPanicked(self.id)),
        };
        ctx.enter_native();
        let result = handle.join();
        ctx.leave_native();
        result.map_err(|_| RuntimeError::ThreadPanicked(self.id))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_register_and_unregister() {
        let list = ThreadList::new();
        let a = list.register("a");
        let b = list.register("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(list.len(), 2);
        assert_eq!(a.state(), ThreadState::Native);
        list.unregister(&a);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_suspend_waits_for_safepoint() {
        let list = Arc::new(ThreadList::new());
        let record = list.register("mutator");
        let root = ObjRef::from_raw(3).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let record = Arc::clone(&record);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                record.leave_native();
                while !stop.load(Ordering::Acquire) {
                    record.check_suspend(|roots| roots.push(root));
                    std::thread::sleep(Duration::from_micros(50));
                }
                record.enter_native(|_| {});
            })
        };

        while record.state() != ThreadState::Running {
            std::thread::yield_now();
        }
        let roots = list.suspend_all(None);
        assert_eq!(roots, vec![root]);
        assert_eq!(record.state(), ThreadState::Suspended);
        list.resume_all(None);

        stop.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_native_thread_does_not_block_suspend() {
        let list = ThreadList::new();
        let record = list.register("blocked");
        let root = ObjRef::from_raw(9).unwrap();
        record.enter_native(|roots| roots.push(root));

        assert_eq!(list.suspend_all(None), vec![root]);
        assert!(record.suspend_requested());
        list.resume_all(None);
        assert!(!record.suspend_requested());
    }

    #[test]
    fn test_thread_registered_during_pause_starts_suspended() {
        let list = ThreadList::new();
        list.suspend_all(None);
        let late = list.register("late");
        assert!(late.suspend_requested());
        list.resume_all(None);
        assert!(!late.suspend_requested());
        late.leave_native();
        assert_eq!(late.state(), ThreadState::Running);
    }

    #[test]
    fn test_suspend_skips_self() {
        let list = ThreadList::new();
        let me = list.register("collector");
        me.leave_native();
        // Would deadlock if the caller waited for itself.
        assert!(list.suspend_all(Some(me.id())).is_empty());
        assert!(!me.suspend_requested());
        list.resume_all(Some(me.id()));
    }
}
