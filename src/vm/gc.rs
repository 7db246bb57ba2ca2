//! Garbage collection.
//!
//! A mark-sweep collector with two modes:
//! - stop-the-world: every thread parks at a safepoint for the whole cycle
//! - concurrent: threads pause only to report roots (initial mark and
//!   remark); marking runs while they mutate the heap
//!
//! Concurrent marking uses an incremental-update barrier: a mutator storing
//! a reference while marking is active records the holder object in the
//! remembered set *before* the store. Remark rescans those holders and the
//! roots, so a reference moved behind the marker is never lost. Objects
//! allocated during marking are born marked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use super::heap::Heap;
use super::threads::ThreadList;
use super::value::ObjRef;
use crate::config::GcMode;

/// Receives the references a thread or the runtime keeps alive.
pub trait RootVisitor {
    fn visit_root(&mut self, root: ObjRef);

    fn visit_roots(&mut self, roots: &[ObjRef]) {
        for &root in roots {
            self.visit_root(root);
        }
    }
}

impl RootVisitor for Vec<ObjRef> {
    fn visit_root(&mut self, root: ObjRef) {
        self.push(root);
    }
}

/// GC phase states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcPhase {
    /// No GC in progress
    Idle,
    /// Threads paused, roots being gathered
    InitialMark,
    /// Marking while mutators run
    ConcurrentMark,
    /// Threads paused, roots and remembered set rescanned
    Remark,
    Sweep,
}

/// Statistics for GC operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Total number of GC cycles
    pub cycles: usize,
    pub objects_marked: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    /// Live bytes after the last sweep
    pub live_bytes: usize,
    /// Total time threads spent paused (microseconds)
    pub total_pause_us: u64,
    /// Maximum pause time (microseconds)
    pub max_pause_us: u64,
    /// Time spent marking concurrently (microseconds)
    pub concurrent_mark_us: u64,
    /// Holders recorded by the write barrier
    pub remembered_set_entries: usize,
}

impl GcStats {
    fn record_pause(&mut self, pause: Duration) {
        let us = pause.as_micros() as u64;
        self.total_pause_us += us;
        self.max_pause_us = self.max_pause_us.max(us);
    }
}

/// Held for the duration of one collection cycle.
pub struct CycleGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

pub struct Collector {
    mode: GcMode,
    phase: Mutex<GcPhase>,
    /// Whether marking is in progress (for write barrier)
    marking: AtomicBool,
    /// Holders written to during concurrent marking
    remembered: Mutex<Vec<ObjRef>>,
    cycle: Mutex<()>,
    stats: Mutex<GcStats>,
}

impl Collector {
    pub fn new(mode: GcMode) -> Self {
        Self {
            mode,
            phase: Mutex::new(GcPhase::Idle),
            marking: AtomicBool::new(false),
            remembered: Mutex::new(Vec::new()),
            cycle: Mutex::new(()),
            stats: Mutex::new(GcStats::default()),
        }
    }

    pub fn mode(&self) -> GcMode {
        self.mode
    }

    pub fn phase(&self) -> GcPhase {
        *self.phase.lock()
    }

    /// Check if marking is in progress (for write barrier).
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Write barrier: call *before* storing `value` into a field of `holder`.
    pub fn write_barrier(&self, holder: ObjRef, value: Option<ObjRef>) {
        if value.is_some() && self.is_marking() {
            self.remembered.lock().push(holder);
        }
    }

    /// Exclusive right to run a cycle. Blocks while another cycle runs.
    pub fn lock_cycle(&self) -> CycleGuard<'_> {
        CycleGuard {
            _guard: self.cycle.lock(),
        }
    }

    fn set_phase(&self, phase: GcPhase) {
        *self.phase.lock() = phase;
        tracing::trace!(?phase, "gc phase");
    }

    /// Run one full cycle.
    ///
    /// `self_id` is the collecting thread (never waited for). `own_roots`
    /// reports the collecting thread's and the runtime's own roots; it may
    /// be called once per pause.
    #[tracing::instrument(level = "debug", skip_all, fields(mode = ?self.mode))]
    pub fn collect(
        &self,
        _cycle: &CycleGuard<'_>,
        heap: &Heap,
        threads: &ThreadList,
        self_id: Option<u32>,
        own_roots: &dyn Fn(&mut dyn RootVisitor),
    ) -> GcStats {
        let mut stats = self.stats();
        stats.cycles += 1;
        match self.mode {
            GcMode::Stw => self.collect_stw(heap, threads, self_id, own_roots, &mut stats),
            GcMode::Concurrent => {
                self.collect_concurrent(heap, threads, self_id, own_roots, &mut stats)
            }
        }
        self.set_phase(GcPhase::Idle);
        tracing::info!(
            cycle = stats.cycles,
            freed = stats.objects_freed,
            live_bytes = stats.live_bytes,
            max_pause_us = stats.max_pause_us,
            "gc cycle complete"
        );
        *self.stats.lock() = stats.clone();
        stats
    }

    fn gather_roots(
        threads: &ThreadList,
        self_id: Option<u32>,
        own_roots: &dyn Fn(&mut dyn RootVisitor),
    ) -> Vec<ObjRef> {
        let mut roots = threads.suspend_all(self_id);
        own_roots(&mut roots);
        roots
    }

    fn collect_stw(
        &self,
        heap: &Heap,
        threads: &ThreadList,
        self_id: Option<u32>,
        own_roots: &dyn Fn(&mut dyn RootVisitor),
        stats: &mut GcStats,
    ) {
        let start = Instant::now();
        self.set_phase(GcPhase::InitialMark);
        let roots = Self::gather_roots(threads, self_id, own_roots);
        stats.objects_marked += mark_from(heap, roots);

        self.set_phase(GcPhase::Sweep);
        let swept = heap.sweep();
        threads.resume_all(self_id);
        stats.record_pause(start.elapsed());

        stats.objects_freed += swept.objects_freed;
        stats.bytes_freed += swept.bytes_freed;
        stats.live_bytes = swept.bytes_live;
    }

    fn collect_concurrent(
        &self,
        heap: &Heap,
        threads: &ThreadList,
        self_id: Option<u32>,
        own_roots: &dyn Fn(&mut dyn RootVisitor),
        stats: &mut GcStats,
    ) {
        // Initial mark: roots only, then let the mutators go.
        let start = Instant::now();
        self.set_phase(GcPhase::InitialMark);
        let roots = Self::gather_roots(threads, self_id, own_roots);
        heap.set_allocate_marked(true);
        self.marking.store(true, Ordering::Release);
        let mut worklist = mark_roots(heap, roots);
        threads.resume_all(self_id);
        stats.record_pause(start.elapsed());

        self.set_phase(GcPhase::ConcurrentMark);
        let start = Instant::now();
        stats.objects_marked += worklist.len() + drain(heap, &mut worklist);
        stats.concurrent_mark_us += start.elapsed().as_micros() as u64;

        // Remark: rescan roots and every holder written to meanwhile.
        let start = Instant::now();
        self.set_phase(GcPhase::Remark);
        let roots = Self::gather_roots(threads, self_id, own_roots);
        let holders = std::mem::take(&mut *self.remembered.lock());
        stats.remembered_set_entries += holders.len();
        let mut worklist = mark_roots(heap, roots);
        stats.objects_marked += worklist.len();
        for holder in holders {
            heap.mark_children(holder, &mut worklist);
        }
        stats.objects_marked += drain(heap, &mut worklist);
        self.marking.store(false, Ordering::Release);
        threads.resume_all(self_id);
        stats.record_pause(start.elapsed());

        // Allocations stay marked until the sweep has the heap locked.
        self.set_phase(GcPhase::Sweep);
        let swept = heap.sweep();
        stats.objects_freed += swept.objects_freed;
        stats.bytes_freed += swept.bytes_freed;
        stats.live_bytes = swept.bytes_live;
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("mode", &self.mode)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Mark the roots; returns the newly marked ones for tracing.
fn mark_roots(heap: &Heap, roots: Vec<ObjRef>) -> Vec<ObjRef> {
    roots.into_iter().filter(|&r| heap.mark(r)).collect()
}

/// Trace until the worklist is empty. Returns the number of objects marked.
fn drain(heap: &Heap, worklist: &mut Vec<ObjRef>) -> usize {
    let mut marked = 0;
    while let Some(r) = worklist.pop() {
        let before = worklist.len();
        heap.mark_children(r, worklist);
        marked += worklist.len() - before;
    }
    marked
}

fn mark_from(heap: &Heap, roots: Vec<ObjRef>) -> usize {
    let mut worklist = mark_roots(heap, roots);
    let marked = worklist.len();
    marked + drain(heap, &mut worklist)
}
