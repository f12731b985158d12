//! A message-passing queue (`shmq`) living entirely in POSIX shared memory,
//! for inter-process communication without kernel mediation on the fast
//! path.
//!
//! # Overview
//! Producers and consumers in different processes exchange fixed-size
//! messages through a circular buffer mapped into each of their address
//! spaces. Synchronization happens through spinlocks stored inside the
//! same mapping, so steady-state pushes and pops never enter the kernel.
//! When a producer finds the buffer full it doubles the slot count by
//! extending the shared segment in place; consumers adopt the new size the
//! next time they pop.
//!
//! Key components:
//! - [`Segment`](segment::Segment): a named shared-memory object, mapped
//!   read-write into the calling process, resizable and unlinkable.
//! - [`Spinlock`](spinlock::Spinlock): a busy-wait mutex stored as a
//!   single 64-bit cell inside a segment.
//! - [`ShmQueue`](queue::ShmQueue): the growable circular buffer, generic
//!   over a `Copy` element type.
//! - [`ShmqConfig`](queue::ShmqConfig): segment name and initial capacity,
//!   constructed via [`ShmqConfig::builder()`](queue::ShmqConfig::builder).
//! - [`ShmqError`](errors::ShmqError): error type for segment and
//!   constructor failures.
//!
//! # Concurrency Model and Safety
//!
//! Three locks live in the segment header: one for the head index, one for
//! the tail index, and a global one guarding capacity changes.
//!
//! - **Push** takes the head lock; on an apparently full queue it takes
//!   the tail lock to re-test, and only if the queue is genuinely full the
//!   global lock, under which it doubles the capacity, remaps, and
//!   relocates any wrapped part of the live range. The lock order is
//!   always head, then tail, then global.
//! - **Pop** takes the tail lock, then the global lock only when it has to
//!   adopt a capacity change made by a peer. It never takes the head lock,
//!   so pops and non-growing pushes proceed in parallel.
//! - **`empty()`** takes no lock at all. It is meant for spin loops, where
//!   a result that races with a concurrent push or pop is
//!   indistinguishable from having called a moment earlier or later.
//!
//! **User responsibilities:**
//! - One producer and one consumer per queue is the tested configuration.
//!   Using several of either relies on every process observing the lock
//!   hierarchy above; see the notes on `ShmQueue`.
//! - Spinlocks never yield and are not recursive: a process killed while
//!   holding one wedges the queue, and re-locking from the holder
//!   deadlocks.
//! - Pointers obtained from a segment are invalidated by any operation
//!   that may resize it; derive them again afterwards (the queue does this
//!   internally).
//!
//! The element type crosses process boundaries as raw bytes: it must be
//! `Copy`, have a stable layout (`#[repr(C)]` in practice), alignment of
//! at most 64, and contain no pointers or process-local handles.

pub mod errors;
pub mod segment;
pub mod spinlock;
pub mod queue;

#[cfg(test)]
mod tests;

pub use errors::ShmqError;
pub use queue::{ShmQueue, ShmqConfig, DEFAULT_CAPACITY, SEGMENT_NAME};
pub use segment::Segment;
