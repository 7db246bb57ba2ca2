use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::bytecode::FieldKind;
use super::class::{Class, ClassId, OBJECT_HEADER_SIZE};
use super::value::ObjRef;
use crate::fatal;

// =============================================================================
// Header word layout (word 0 of every object)
// =============================================================================
//
// +--------+-------------------+---------------------+
// | marked | lock word (31)    | class id (32)       |
// | bit 63 | bits 32-62        | bits 0-31           |
// +--------+-------------------+---------------------+
//
// Mutators never store into word 0; only the collector flips the mark bit.

const HEADER_MARKED_BIT: u64 = 1 << 63;
const HEADER_CLASS_MASK: u64 = 0xFFFF_FFFF;

fn encode_header(class: ClassId, marked: bool) -> u64 {
    let mut header = class.0 as u64;
    if marked {
        header |= HEADER_MARKED_BIT;
    }
    header
}

fn decode_class(header: u64) -> ClassId {
    ClassId((header & HEADER_CLASS_MASK) as u32)
}

fn decode_marked(header: u64) -> bool {
    header & HEADER_MARKED_BIT != 0
}

/// Number of 64-bit words backing an instance of `instance_size` bytes.
const fn object_size_words(instance_size: usize) -> usize {
    instance_size.div_ceil(8)
}

/// Description attached to throwable objects when they are created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrowableInfo {
    pub message: String,
    pub stack_trace: Vec<String>,
}

/// A heap object: a header word followed by field words.
///
/// Every word is atomic, so field loads and stores from different threads
/// never tear. Sub-word fields share their containing word.
#[derive(Debug)]
pub struct HeapObject {
    words: Box<[AtomicU64]>,
    reference_offsets: Arc<[u16]>,
    instance_size: usize,
    throwable: OnceLock<ThrowableInfo>,
}

impl HeapObject {
    fn new(class: &Class, marked: bool) -> Self {
        let words: Box<[AtomicU64]> = (0..object_size_words(class.instance_size))
            .map(|_| AtomicU64::new(0))
            .collect();
        words[0].store(encode_header(class.id, marked), Ordering::Relaxed);
        Self {
            words,
            reference_offsets: Arc::clone(&class.reference_offsets),
            instance_size: class.instance_size,
            throwable: OnceLock::new(),
        }
    }

    pub fn class_id(&self) -> ClassId {
        decode_class(self.words[0].load(Ordering::Relaxed))
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * 8
    }

    fn is_marked(&self) -> bool {
        decode_marked(self.words[0].load(Ordering::Acquire))
    }

    /// Set the mark bit. Returns true if this call marked the object.
    fn mark(&self) -> bool {
        let previous = self.words[0].fetch_or(HEADER_MARKED_BIT, Ordering::AcqRel);
        !decode_marked(previous)
    }

    fn clear_mark(&self) {
        self.words[0].fetch_and(!HEADER_MARKED_BIT, Ordering::AcqRel);
    }

    /// Word index and bit shift of a field, after validating the access.
    fn locate(&self, offset: usize, width: usize) -> (usize, u32) {
        if offset < OBJECT_HEADER_SIZE
            || offset % width != 0
            || offset + width > self.instance_size
        {
            fatal!(
                "invalid field access: offset {} width {} on object of {} bytes (class {})",
                offset,
                width,
                self.instance_size,
                self.class_id().0
            );
        }
        (offset / 8, ((offset % 8) * 8) as u32)
    }

    fn load(&self, offset: usize, width: usize) -> u64 {
        let (word, shift) = self.locate(offset, width);
        let value = self.words[word].load(Ordering::Acquire);
        if width == 8 {
            value
        } else {
            (value >> shift) & ((1u64 << (width * 8)) - 1)
        }
    }

    fn store(&self, offset: usize, width: usize, value: u64) {
        let (word, shift) = self.locate(offset, width);
        if width == 8 {
            // Single atomic store: a wide field is never half-visible.
            self.words[word].store(value, Ordering::Release);
            return;
        }
        let mask = ((1u64 << (width * 8)) - 1) << shift;
        let bits = (value << shift) & mask;
        // Neighbouring fields in the same word may be written concurrently.
        let _ = self.words[word].fetch_update(Ordering::Release, Ordering::Relaxed, |old| {
            Some((old & !mask) | bits)
        });
    }
}

/// Counters reported after each sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub objects_live: usize,
    pub bytes_live: usize,
}

#[derive(Debug, Default)]
struct Slots {
    objects: Vec<Option<HeapObject>>,
    free: Vec<usize>,
}

/// The garbage-collected heap.
///
/// Objects live in a slot table indexed by their compressed reference. The
/// table lock is shared for field access and marking and exclusive only
/// for allocation and sweeping.
pub struct Heap {
    slots: RwLock<Slots>,
    /// Bytes held by live (or not yet swept) objects
    bytes_allocated: AtomicUsize,
    /// Bytes allocated since the last sweep
    bytes_since_gc: AtomicUsize,
    /// Collection trigger
    gc_threshold: AtomicUsize,
    min_threshold: usize,
    /// Hard limit on heap size (None = unlimited)
    heap_limit: Option<usize>,
    gc_enabled: bool,
    /// New objects are born marked while a concurrent mark is running
    allocate_marked: AtomicBool,
}

impl Heap {
    /// Create a new heap.
    ///
    /// # Arguments
    /// * `heap_limit` - Hard limit on heap size in bytes (None = unlimited)
    /// * `gc_threshold` - Bytes allocated between collections
    /// * `gc_enabled` - Whether GC is enabled
    pub fn new(heap_limit: Option<usize>, gc_threshold: usize, gc_enabled: bool) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            bytes_allocated: AtomicUsize::new(0),
            bytes_since_gc: AtomicUsize::new(0),
            gc_threshold: AtomicUsize::new(gc_threshold),
            min_threshold: gc_threshold,
            heap_limit,
            gc_enabled,
            allocate_marked: AtomicBool::new(false),
        }
    }

    /// Whether the next allocation should be preceded by a collection.
    pub fn should_gc(&self) -> bool {
        self.gc_enabled
            && self.bytes_since_gc.load(Ordering::Relaxed) >= self.gc_threshold.load(Ordering::Relaxed)
    }

    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Allocate a zeroed instance of `class`. Returns `None` when the heap
    /// limit would be exceeded; collecting is the caller's business.
    pub fn allocate(&self, class: &Class) -> Option<ObjRef> {
        let size = object_size_words(class.instance_size) * 8;
        // The limit is checked and the bytes claimed under the table lock, so
        // racing allocators (and a concurrent sweep) see one running total.
        let mut slots = self.slots.write();
        self.bytes_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let next = used.checked_add(size)?;
                match self.heap_limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .ok()?;
        let object = HeapObject::new(class, self.allocate_marked.load(Ordering::Acquire));
        let index = match slots.free.pop() {
            Some(index) => {
                slots.objects[index] = Some(object);
                index
            }
            None => {
                slots.objects.push(Some(object));
                slots.objects.len() - 1
            }
        };
        drop(slots);

        self.bytes_since_gc.fetch_add(size, Ordering::Relaxed);
        match ObjRef::from_index(index) {
            Some(r) => Some(r),
            None => fatal!("object table overflow at index {}", index),
        }
    }

    fn with_object<R>(&self, r: ObjRef, f: impl FnOnce(&HeapObject) -> R) -> R {
        let slots = self.slots.read();
        match slots.objects.get(r.index()).and_then(Option::as_ref) {
            Some(object) => f(object),
            None => fatal!("dangling reference {:?}", r),
        }
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        matches!(self.slots.read().objects.get(r.index()), Some(Some(_)))
    }

    pub fn class_of(&self, r: ObjRef) -> ClassId {
        self.with_object(r, HeapObject::class_id)
    }

    /// Load a primitive field, zero-extended to 64 bits.
    pub fn load(&self, r: ObjRef, offset: usize, kind: FieldKind) -> u64 {
        self.with_object(r, |o| o.load(offset, kind.width()))
    }

    /// Store a primitive field. Only the low `kind.width()` bytes are used.
    pub fn store(&self, r: ObjRef, offset: usize, kind: FieldKind, value: u64) {
        debug_assert!(!kind.is_reference());
        self.with_object(r, |o| o.store(offset, kind.width(), value))
    }

    pub fn load_ref(&self, r: ObjRef, offset: usize) -> Option<ObjRef> {
        let raw = self.with_object(r, |o| o.load(offset, FieldKind::Object.width()));
        ObjRef::from_raw(raw as u32)
    }

    /// Store a reference field. The caller runs the write barrier first.
    pub fn store_ref(&self, r: ObjRef, offset: usize, value: Option<ObjRef>) {
        self.with_object(r, |o| {
            o.store(offset, FieldKind::Object.width(), ObjRef::encode(value) as u64)
        })
    }

    pub fn set_throwable_info(&self, r: ObjRef, info: ThrowableInfo) {
        self.with_object(r, |o| {
            let _ = o.throwable.set(info);
        })
    }

    pub fn throwable_info(&self, r: ObjRef) -> Option<ThrowableInfo> {
        self.with_object(r, |o| o.throwable.get().cloned())
    }

    // -------------------------------------------------------------------------
    // Collector interface
    // -------------------------------------------------------------------------

    pub(crate) fn set_allocate_marked(&self, marked: bool) {
        self.allocate_marked.store(marked, Ordering::Release);
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.with_object(r, HeapObject::is_marked)
    }

    /// Mark `r`. Returns true if it was not marked before.
    pub(crate) fn mark(&self, r: ObjRef) -> bool {
        self.with_object(r, HeapObject::mark)
    }

    /// Mark every object `r` refers to, pushing the newly marked ones onto
    /// `worklist`. Runs under a single read lock.
    pub(crate) fn mark_children(&self, r: ObjRef, worklist: &mut Vec<ObjRef>) {
        let slots = self.slots.read();
        let Some(object) = slots.objects.get(r.index()).and_then(Option::as_ref) else {
            fatal!("dangling reference {:?}", r);
        };
        for &offset in object.reference_offsets.iter() {
            let raw = object.load(offset as usize, FieldKind::Object.width());
            let Some(child) = ObjRef::from_raw(raw as u32) else {
                continue;
            };
            match slots.objects.get(child.index()).and_then(Option::as_ref) {
                Some(target) => {
                    if target.mark() {
                        worklist.push(child);
                    }
                }
                None => fatal!(
                    "dangling reference {:?} in field {} of {:?}",
                    child,
                    offset,
                    r
                ),
            }
        }
    }

    /// Free every unmarked object and clear the marks of the survivors.
    pub(crate) fn sweep(&self) -> SweepResult {
        let mut result = SweepResult::default();
        let mut guard = self.slots.write();
        let slots = &mut *guard;
        for (index, slot) in slots.objects.iter_mut().enumerate() {
            let Some(object) = slot else { continue };
            if object.is_marked() {
                object.clear_mark();
                result.objects_live += 1;
                result.bytes_live += object.size_bytes();
            } else {
                result.objects_freed += 1;
                result.bytes_freed += object.size_bytes();
                *slot = None;
                slots.free.push(index);
            }
        }
        // Still under the lock: no allocation can observe the old setting.
        self.allocate_marked.store(false, Ordering::Release);
        self.bytes_allocated.store(result.bytes_live, Ordering::Relaxed);
        drop(guard);

        self.bytes_since_gc.store(0, Ordering::Relaxed);
        self.gc_threshold
            .store(result.bytes_live.max(self.min_threshold), Ordering::Relaxed);
        result
    }

    /// Get count of allocated objects.
    pub fn object_count(&self) -> usize {
        self.slots.read().objects.iter().filter(|o| o.is_some()).count()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("bytes_allocated", &self.bytes_allocated())
            .field("heap_limit", &self.heap_limit)
            .finish()
    }
}
