use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::segment::Segment;
use crate::spinlock::Spinlock;
use crate::ShmqError;

/// Default name in the shm namespace. Stays for `ShmqConfig` default.
pub static SEGMENT_NAME: &'static str = "/shmq";

/// Default number of slots a fresh queue is created with.
pub const DEFAULT_CAPACITY: u64 = 64;

// Segment layout. Every control field sits in its own 64-byte cache block
// so producer and consumer traffic do not false-share.
//
//   block 0: global spinlock (offset 0), capacity in elements (offset 8)
//   block 1: head-pointer spinlock
//   block 2: tail-pointer spinlock
//   block 3: head, the index of the next slot a producer writes
//   block 4: tail, the index of the next slot a consumer reads
//   block 5...: the circular element array
const CACHE_BLOCK: u64 = 64;
const OFF_GLOBAL_LOCK: u64 = 0;
const OFF_CAPACITY: u64 = 8;
const OFF_HEAD_LOCK: u64 = CACHE_BLOCK;
const OFF_TAIL_LOCK: u64 = 2 * CACHE_BLOCK;
const OFF_HEAD: u64 = 3 * CACHE_BLOCK;
const OFF_TAIL: u64 = 4 * CACHE_BLOCK;
const OFF_ARRAY: u64 = 5 * CACHE_BLOCK;

const _: () = {
    assert!(OFF_ARRAY % CACHE_BLOCK == 0);
    assert!(OFF_TAIL + 8 <= OFF_ARRAY);
};

/// Queue setup shared by every process that attaches to the same segment.
/// Use [`ShmqConfig::builder()`](ShmqConfig::builder) to construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmqConfig {
    pub segment_name: String,
    pub initial_capacity: u64,
}

impl Default for ShmqConfig {
    fn default() -> Self {
        ShmqConfig {
            segment_name: String::from(SEGMENT_NAME),
            initial_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ShmqConfig {
    pub fn builder() -> ShmqConfigBuilder {
        ShmqConfigBuilder {
            config: ShmqConfig::default(),
        }
    }
}

pub struct ShmqConfigBuilder {
    config: ShmqConfig,
}

impl ShmqConfigBuilder {
    pub fn segment_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.segment_name = name.into();
        self
    }

    pub fn initial_capacity(mut self, slots: u64) -> Self {
        self.config.initial_capacity = slots;
        self
    }

    pub fn build(self) -> Result<ShmqConfig, ShmqError> {
        if !self.config.initial_capacity.is_power_of_two() || self.config.initial_capacity < 2 {
            return Err(ShmqError::Logic(format!(
                "initial_capacity ({}) must be a power of two and at least 2",
                self.config.initial_capacity
            )));
        }
        if self.config.segment_name.is_empty() {
            return Err(ShmqError::Logic(
                "segment_name must not be empty".to_owned(),
            ));
        }
        Ok(self.config)
    }
}

/// A message-passing queue laid out inside a shared-memory [`Segment`],
/// growable by doubling while messages are in flight.
///
/// Three spinlocks protect the queue: one each for the head and tail
/// indices, and a global one taken only while the segment is being resized.
/// Lock order is head → tail → global for [`push`](ShmQueue::push) and
/// tail → global for [`pop`](ShmQueue::pop); pushes on a non-full queue
/// and pops therefore never contend with each other.
///
/// Only producers grow the queue. A consumer notices a peer's grow by
/// comparing the capacity it last observed against the one recorded in the
/// segment header, and adopts it by remapping locally before reading.
///
/// All views into the mapping (the lock cells, the three header words and
/// the array base) are rebound after every local remap; no pointer derived
/// from the segment survives a potential grow point.
pub struct ShmQueue<'seg, T: Copy> {
    segment: &'seg mut Segment,
    sl_global: Spinlock,
    sl_head: Spinlock,
    sl_tail: Spinlock,
    nelem: NonNull<AtomicU64>,
    head: NonNull<AtomicU64>,
    tail: NonNull<AtomicU64>,
    array: NonNull<T>,
    last_nelem: u64,
}

// Safety: the queue can move to another thread along with its segment
// borrow; the shared state it touches is synchronized by the in-segment
// locks and atomics.
unsafe impl<T: Copy + Send> Send for ShmQueue<'_, T> {}

impl<'seg, T: Copy> ShmQueue<'seg, T> {
    /// Attach to the queue living in `segment`, initializing the segment if
    /// this process is the first attacher (backing object of length zero).
    ///
    /// `initial_capacity` must be a power of two of at least 2 and only
    /// takes effect for the first attacher; later attachers inherit the
    /// capacity recorded in the segment header.
    pub fn attach(
        segment: &'seg mut Segment,
        initial_capacity: u64,
    ) -> Result<ShmQueue<'seg, T>, ShmqError> {
        if !initial_capacity.is_power_of_two() || initial_capacity < 2 {
            return Err(ShmqError::Logic(format!(
                "initial capacity ({}) must be a power of two and at least 2",
                initial_capacity
            )));
        }
        if mem::size_of::<T>() == 0 {
            return Err(ShmqError::Logic(
                "element type must not be zero-sized".to_owned(),
            ));
        }
        if mem::align_of::<T>() > CACHE_BLOCK as usize {
            return Err(ShmqError::Logic(format!(
                "element alignment ({}) exceeds the {}-byte array alignment",
                mem::align_of::<T>(),
                CACHE_BLOCK
            )));
        }

        if segment.size() == 0 {
            // First attacher: size the segment, zero every control word and
            // slot, and record the capacity for everyone else.
            segment.resize(Self::segment_bytes(initial_capacity))?;
            unsafe {
                ptr::write_bytes(segment.ptr(), 0, segment.size() as usize);
                (*(segment.ptr_at(OFF_CAPACITY) as *const AtomicU64))
                    .store(initial_capacity, Ordering::Release);
            }
            debug!(capacity = initial_capacity, "initialized queue segment");
        }

        let mut queue = ShmQueue {
            segment,
            sl_global: Spinlock::new(),
            sl_head: Spinlock::new(),
            sl_tail: Spinlock::new(),
            nelem: NonNull::dangling(),
            head: NonNull::dangling(),
            tail: NonNull::dangling(),
            array: NonNull::dangling(),
            last_nelem: 0,
        };
        queue.internal_resize()?;

        if queue.last_nelem == 0 {
            return Err(ShmqError::Logic(
                "segment header does not carry a capacity yet".to_owned(),
            ));
        }
        if !queue.last_nelem.is_power_of_two() {
            return Err(ShmqError::Logic(format!(
                "segment header capacity ({}) is not a power of two",
                queue.last_nelem
            )));
        }
        Ok(queue)
    }

    /// Push an item. With `expand` set, a full queue doubles its capacity
    /// in place; with `expand` clear, pushing onto a full queue returns
    /// false and changes nothing.
    ///
    /// Returns false without pushing if a mid-grow remap fails; the
    /// capacity is restored so peers never adopt a size the backing object
    /// does not have.
    pub fn push(&mut self, value: T, expand: bool) -> bool {
        // A failed remap leaves the queue detached from the segment; every
        // view is gone, so the only honest answer is failure.
        if self.segment.ptr().is_null() {
            return false;
        }
        self.sl_head.lock();

        // Grow while one slot is still free: head may never catch the tail
        // from behind, or full and empty would both read head == tail.
        if self.is_full() {
            if !expand {
                self.sl_head.unlock();
                return false;
            }

            self.sl_tail.lock();
            // Re-test under the tail lock; a consumer may have freed a slot
            // while we were acquiring it.
            if self.is_full() {
                self.sl_global.lock();

                let old = self.nelem_ref().load(Ordering::Relaxed);
                self.nelem_ref().store(old << 1, Ordering::Release);

                if let Err(e) = self.internal_resize() {
                    error!("queue grow to {} slots failed: {}", old << 1, e);
                    // Back out the doubling so peers never adopt a capacity
                    // the backing object cannot be trusted to have, then
                    // release in reverse order. The header outlived the
                    // failed remap, so the old geometry is mapped again
                    // first if the attempt tore this view down.
                    if !self.reattach(old) {
                        return false;
                    }
                    self.nelem_ref().store(old, Ordering::Release);
                    self.sl_global.unlock();
                    self.sl_tail.unlock();
                    self.sl_head.unlock();
                    return false;
                }

                // The enlarged array keeps the old slots at their old
                // indices. If the live range had wrapped, relocate the
                // leading part past the old end so it follows the tail
                // again and tail < head holds once more.
                let head = self.head_ref().load(Ordering::Relaxed);
                let tail = self.tail_ref().load(Ordering::Relaxed);
                if head < tail {
                    unsafe {
                        let base = self.array.as_ptr();
                        ptr::copy_nonoverlapping(base, base.add(old as usize), head as usize);
                    }
                    self.head_ref().store(head + old, Ordering::Release);
                }

                self.sl_global.unlock();
            }
            self.sl_tail.unlock();
        }

        let capacity = self.nelem_ref().load(Ordering::Relaxed);
        let head = self.head_ref().load(Ordering::Relaxed);
        unsafe {
            ptr::write(self.array.as_ptr().add(head as usize), value);
        }
        self.head_ref().store((head + 1) & (capacity - 1), Ordering::Release);
        self.sl_head.unlock();

        true
    }

    /// Pop an item into `out`. Returns false and leaves `out` untouched if
    /// the queue is empty, or if adopting a peer's grow fails (the locks
    /// are released and the next call retries the adoption).
    pub fn pop(&mut self, out: &mut T) -> bool {
        if self.segment.ptr().is_null() {
            return false;
        }
        self.sl_tail.lock();

        // Recognize and adopt a resize done by a peer before touching the
        // array; our views may point into a mapping that is too small.
        let target = self.nelem_ref().load(Ordering::Acquire);
        if self.last_nelem != target {
            self.sl_global.lock();
            if let Err(e) = self.internal_resize() {
                error!("adopting a peer's grow failed: {}", e);
                // The peer's capacity stands; only this view has to be
                // re-established before the locks can be released.
                if !self.reattach(target) {
                    return false;
                }
                self.sl_global.unlock();
                self.sl_tail.unlock();
                return false;
            }
            self.sl_global.unlock();
        }

        // Capacity doubles before head could wrap onto tail, so
        // head == tail only ever means empty.
        let head = self.head_ref().load(Ordering::Acquire);
        let tail = self.tail_ref().load(Ordering::Relaxed);
        if tail == head {
            self.sl_tail.unlock();
            return false;
        }

        unsafe {
            *out = ptr::read(self.array.as_ptr().add(tail as usize));
        }
        let capacity = self.nelem_ref().load(Ordering::Relaxed);
        self.tail_ref().store((tail + 1) & (capacity - 1), Ordering::Release);
        self.sl_tail.unlock();

        true
    }

    /// True if the queue is currently empty.
    ///
    /// Takes no locks: the only legitimate use is spinning in a loop, and a
    /// push or pop racing with these two loads serializes either before or
    /// after them, both acceptable outcomes there. Head and tail are single
    /// aligned words, so each load is itself atomic.
    pub fn empty(&self) -> bool {
        if self.segment.ptr().is_null() {
            return true;
        }
        self.head_ref().load(Ordering::Acquire) == self.tail_ref().load(Ordering::Acquire)
    }

    /// The slot count currently recorded in the segment header, or the
    /// last observed one if the queue lost its mapping.
    pub fn capacity(&self) -> u64 {
        if self.segment.ptr().is_null() {
            return self.last_nelem;
        }
        self.nelem_ref().load(Ordering::Acquire)
    }

    #[inline]
    fn segment_bytes(capacity: u64) -> u64 {
        OFF_ARRAY + mem::size_of::<T>() as u64 * capacity
    }

    /// Remap locally and re-derive every view if the capacity we last
    /// observed no longer matches the segment header.
    ///
    /// Takes no locks itself; callers hold whatever the lock hierarchy
    /// requires at their call site.
    fn internal_resize(&mut self) -> Result<(), ShmqError> {
        let current = unsafe { &*(self.segment.ptr_at(OFF_CAPACITY) as *const AtomicU64) }
            .load(Ordering::Acquire);
        if self.last_nelem == current {
            return Ok(());
        }

        self.segment.resize(Self::segment_bytes(current))?;
        self.bind_views();
        self.last_nelem = current;
        trace!(capacity = current, "rebound queue views after remap");
        Ok(())
    }

    /// Derive every lock and header view from the current mapping base.
    /// The segment must be mapped and at least one page long.
    fn bind_views(&mut self) {
        unsafe {
            self.sl_global.rebind(self.segment, OFF_GLOBAL_LOCK);
            self.sl_head.rebind(self.segment, OFF_HEAD_LOCK);
            self.sl_tail.rebind(self.segment, OFF_TAIL_LOCK);
            self.nelem = NonNull::new_unchecked(self.segment.ptr_at(OFF_CAPACITY) as *mut AtomicU64);
            self.head = NonNull::new_unchecked(self.segment.ptr_at(OFF_HEAD) as *mut AtomicU64);
            self.tail = NonNull::new_unchecked(self.segment.ptr_at(OFF_TAIL) as *mut AtomicU64);
            self.array = NonNull::new_unchecked(self.segment.ptr_at(OFF_ARRAY) as *mut T);
        }
    }

    /// Map the backing object again after a failed remap tore the local
    /// mapping down, so the header words and the lock cells held across
    /// the failure are reachable again. The named object survived; only
    /// this process's mapping attempt failed.
    ///
    /// Maps the geometry for `capacity` slots without touching the
    /// object's length, which may legitimately be longer. Returns false
    /// when even that fails; the queue is then detached for good and the
    /// locks it holds cannot be released.
    fn reattach(&mut self, capacity: u64) -> bool {
        if !self.segment.ptr().is_null() {
            // The resize failed before unmapping; every view still stands.
            return true;
        }
        if let Err(e) = self.segment.remap(Self::segment_bytes(capacity)) {
            error!("re-establishing the mapping failed, queue detached: {}", e);
            return false;
        }
        self.bind_views();
        self.last_nelem = capacity;
        true
    }

    #[inline]
    fn is_full(&self) -> bool {
        let capacity = self.nelem_ref().load(Ordering::Relaxed);
        let head = self.head_ref().load(Ordering::Relaxed);
        let tail = self.tail_ref().load(Ordering::Acquire);
        (head + 1) % capacity == tail
    }

    #[inline]
    fn nelem_ref(&self) -> &AtomicU64 {
        unsafe { self.nelem.as_ref() }
    }

    #[inline]
    fn head_ref(&self) -> &AtomicU64 {
        unsafe { self.head.as_ref() }
    }

    #[inline]
    fn tail_ref(&self) -> &AtomicU64 {
        unsafe { self.tail.as_ref() }
    }

    #[cfg(test)]
    fn indices(&self) -> (u64, u64) {
        (
            self.head_ref().load(Ordering::Acquire),
            self.tail_ref().load(Ordering::Acquire),
        )
    }
}
