use std::hint;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::segment::Segment;

/// A busy-wait mutex stored as a single 64-bit cell in shared memory.
///
/// The `Spinlock` value is a *view* of the cell, not its owner: the cell
/// lives in a [`Segment`] and is shared by every process that binds a view
/// at the same offset. `0` means unlocked, `1` means locked.
///
/// Never yields to the OS; holders that die without unlocking wedge the
/// lock permanently. Not recursive: re-locking from the current holder
/// deadlocks. Lock hierarchy is the caller's responsibility.
///
/// Invariant maintained by callers: between [`rebind`](Spinlock::rebind)
/// and the next local remap of the segment, the view points at a live
/// 8-byte-aligned cell inside the mapping.
pub struct Spinlock {
    cell: NonNull<AtomicU64>,
}

// Safety: the view may move between threads; the cell it points at is
// shared memory whose accesses are all atomic.
unsafe impl Send for Spinlock {}

impl Spinlock {
    /// An unbound view. Must be [`rebind`](Spinlock::rebind)ed before any
    /// other operation.
    pub fn new() -> Spinlock {
        Spinlock {
            cell: NonNull::dangling(),
        }
    }

    /// Point the view at the cell `offset` bytes into `segment`'s mapping.
    ///
    /// Called once after attaching and again after every local remap, since
    /// remapping moves the base address of the same logical cell.
    ///
    /// # Safety
    /// `segment` must be mapped, `offset + 8` must be within the mapping,
    /// and `offset` must be 8-byte aligned.
    pub unsafe fn rebind(&mut self, segment: &Segment, offset: u64) {
        self.cell = NonNull::new_unchecked(segment.ptr_at(offset) as *mut AtomicU64);
    }

    /// Store 0 into the cell. Used exactly once, by the process that
    /// initializes the segment; the lock is unusable before that.
    #[inline]
    pub fn zero(&self) {
        self.cell().store(0, Ordering::Relaxed);
    }

    /// Acquire the lock by test-and-test-and-set: spin on relaxed loads
    /// until the cell reads 0, then exchange 1 in; if the prior value was
    /// non-zero another thread won the race, so restart.
    #[inline]
    pub fn lock(&self) {
        let cell = self.cell();
        loop {
            while cell.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
            if cell.swap(1, Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    /// Release the lock. A releasing store is all that is needed; the
    /// exchange in [`lock`](Spinlock::lock) provides the acquire side.
    #[inline]
    pub fn unlock(&self) {
        self.cell().store(0, Ordering::Release);
    }

    #[inline]
    fn cell(&self) -> &AtomicU64 {
        unsafe { self.cell.as_ref() }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Spinlock::new()
    }
}
