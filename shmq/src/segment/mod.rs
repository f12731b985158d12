use std::ffi::CString;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::ShmqError;

/// Mapping granularity. Backing-object lengths are always rounded up to this.
pub const PAGE_SIZE: u64 = 4096;

/// POSIX NAME_MAX; `shm_open` rejects longer names on Linux.
pub const MAX_NAME_LEN: usize = 255;

#[inline]
pub(crate) const fn round_to_page(bytes: u64) -> u64 {
    (bytes + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// A named POSIX shared-memory segment mapped into this process.
///
/// Each process holds its own `Segment` handle; the underlying named object
/// is shared and persists until some process calls [`unlink`](Segment::unlink).
/// Dropping a `Segment` unmaps and closes but leaves the name in place for
/// peers.
///
/// The mapped length is process-local: when a peer resizes the backing
/// object, this handle keeps its old mapping until [`resize`](Segment::resize)
/// is called here with the new length. Higher layers communicate sizes
/// through the segment contents themselves.
pub struct Segment {
    name: CString,
    fd: Option<OwnedFd>,
    base: Option<NonNull<u8>>,
    len: u64,
    #[cfg(test)]
    fail_next_remap: bool,
}

// Safety: the mapping is plain shared memory; the handle carries no
// thread-affine state. Concurrent access to the contents is governed by
// the locks the queue layer places inside the mapping.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Attach to or create the named shared-memory object, read-write,
    /// mode 0644 on creation.
    ///
    /// An object that already has a non-zero length is mapped immediately
    /// (its length rounded up to a page multiple); a freshly created object
    /// stays unmapped at length zero until the first [`resize`](Segment::resize).
    pub fn open(name: &str) -> Result<Segment, ShmqError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ShmqError::Name(format!(
                "`{}` must be between 1 and {} bytes",
                name, MAX_NAME_LEN
            )));
        }
        let c_name = CString::new(name)
            .map_err(|_| ShmqError::Name(format!("`{}` contains an interior NUL byte", name)))?;

        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o644 as libc::mode_t,
            )
        };
        if raw < 0 {
            return Err(ShmqError::last_os("shm_open"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
            return Err(ShmqError::last_os("fstat"));
        }

        let mut segment = Segment {
            name: c_name,
            fd: Some(fd),
            base: None,
            len: 0,
            #[cfg(test)]
            fail_next_remap: false,
        };

        let existing = round_to_page(st.st_size as u64);
        if existing > 0 {
            // A peer may have left a length that is not a page multiple;
            // bring the object up to the boundary before mapping it.
            if existing != st.st_size as u64 {
                let raw = segment.raw_fd();
                if unsafe { libc::ftruncate(raw, existing as libc::off_t) } != 0 {
                    return Err(ShmqError::last_os("ftruncate"));
                }
            }
            let raw = segment.raw_fd();
            segment.map(raw, existing)?;
        }
        trace!(name, bytes = segment.len, "attached shared-memory segment");
        Ok(segment)
    }

    /// Pointer to the mapping base, or null while unmapped.
    ///
    /// Invalidated by any subsequent [`resize`](Segment::resize) in this
    /// process.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.base.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Pointer to `offset` bytes past the mapping base, or null while
    /// unmapped. Same invalidation rule as [`ptr`](Segment::ptr).
    #[inline]
    pub fn ptr_at(&self, offset: u64) -> *mut u8 {
        match self.base {
            Some(base) => unsafe { base.as_ptr().add(offset as usize) },
            None => ptr::null_mut(),
        }
    }

    /// Currently mapped length in bytes. Not necessarily the backing
    /// object's length if a peer has resized it.
    #[inline]
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Grow or shrink the backing object to `new_bytes` (rounded up to a
    /// page multiple) and remap it locally at the new length.
    ///
    /// The mapping base typically moves; every pointer previously obtained
    /// from [`ptr`](Segment::ptr)/[`ptr_at`](Segment::ptr_at) is invalid
    /// afterwards. On mapping failure the segment degrades to the unmapped
    /// state and the error is returned.
    pub fn resize(&mut self, new_bytes: u64) -> Result<(), ShmqError> {
        if new_bytes == self.len {
            return Ok(());
        }
        let raw = match &self.fd {
            Some(fd) => fd.as_raw_fd(),
            None => {
                return Err(ShmqError::Logic(
                    "segment descriptor already closed".to_owned(),
                ))
            }
        };
        let rounded = round_to_page(new_bytes);
        if unsafe { libc::ftruncate(raw, rounded as libc::off_t) } != 0 {
            return Err(ShmqError::last_os("ftruncate"));
        }
        #[cfg(test)]
        if self.fail_next_remap {
            // Behaves like an mmap failure after the old mapping is gone:
            // the object is already truncated, the local view is not.
            self.fail_next_remap = false;
            self.unmap();
            return Err(ShmqError::Os {
                op: "mmap",
                source: std::io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        self.unmap();
        self.map(raw, rounded)?;
        debug!(bytes = rounded, "remapped shared-memory segment");
        Ok(())
    }

    /// Map the backing object again at `bytes` (rounded up to a page
    /// multiple) without changing the object's length, which may
    /// legitimately be longer. Used to re-establish a view after a failed
    /// [`resize`](Segment::resize) left the segment unmapped.
    pub(crate) fn remap(&mut self, bytes: u64) -> Result<(), ShmqError> {
        let raw = match &self.fd {
            Some(fd) => fd.as_raw_fd(),
            None => {
                return Err(ShmqError::Logic(
                    "segment descriptor already closed".to_owned(),
                ))
            }
        };
        self.unmap();
        self.map(raw, round_to_page(bytes))
    }

    /// Make the next resize fail the way a failed mmap does: object
    /// truncated, local mapping gone.
    #[cfg(test)]
    pub(crate) fn inject_remap_failure(&mut self) {
        self.fail_next_remap = true;
    }

    /// Remove the name from the shm namespace, after unmapping and closing
    /// this handle. Peers that still have the segment mapped keep operating
    /// on it; no new opener will find the name.
    pub fn unlink(&mut self) {
        self.unmap();
        if let Some(fd) = self.fd.take() {
            drop(fd);
            if unsafe { libc::shm_unlink(self.name.as_ptr()) } != 0 {
                debug!(
                    "shm_unlink failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[inline]
    fn raw_fd(&self) -> RawFd {
        // Callers only reach here while fd is present; unlink is the one
        // path that clears it and it takes &mut self.
        self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn map(&mut self, fd: RawFd, bytes: u64) -> Result<(), ShmqError> {
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            self.base = None;
            self.len = 0;
            return Err(ShmqError::last_os("mmap"));
        }
        self.base = NonNull::new(p as *mut u8);
        self.len = bytes;
        Ok(())
    }

    fn unmap(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe {
                libc::munmap(base.as_ptr() as *mut libc::c_void, self.len as usize);
            }
            self.len = 0;
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Unmap and close only; the name stays until someone unlinks it.
        self.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/shmq-seg-{}-{}-{}",
            tag,
            process::id(),
            TEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn fresh_segment_is_unmapped() {
        let name = unique_name("fresh");
        let mut segment = Segment::open(&name).unwrap();
        assert_eq!(segment.size(), 0);
        assert!(segment.ptr().is_null());
        segment.unlink();
    }

    #[test]
    fn resize_rounds_up_to_page() {
        let name = unique_name("round");
        let mut segment = Segment::open(&name).unwrap();

        segment.resize(100).unwrap();
        assert_eq!(segment.size(), PAGE_SIZE);
        assert!(!segment.ptr().is_null());

        segment.resize(PAGE_SIZE + 1).unwrap();
        assert_eq!(segment.size(), 2 * PAGE_SIZE);

        segment.unlink();
    }

    #[test]
    fn resize_to_current_size_is_a_noop() {
        let name = unique_name("noop");
        let mut segment = Segment::open(&name).unwrap();
        segment.resize(PAGE_SIZE).unwrap();
        let base = segment.ptr();

        segment.resize(PAGE_SIZE).unwrap();
        assert_eq!(segment.size(), PAGE_SIZE);
        assert_eq!(segment.ptr(), base);

        segment.unlink();
    }

    #[test]
    fn contents_survive_resize() {
        let name = unique_name("grow");
        let mut segment = Segment::open(&name).unwrap();
        segment.resize(PAGE_SIZE).unwrap();

        unsafe {
            *segment.ptr_at(17) = 0xAB;
            *segment.ptr_at(PAGE_SIZE - 1) = 0xCD;
        }
        segment.resize(4 * PAGE_SIZE).unwrap();
        unsafe {
            assert_eq!(*segment.ptr_at(17), 0xAB);
            assert_eq!(*segment.ptr_at(PAGE_SIZE - 1), 0xCD);
        }

        segment.unlink();
    }

    #[test]
    fn peer_handle_sees_writes() {
        let name = unique_name("peer");
        let mut writer = Segment::open(&name).unwrap();
        writer.resize(PAGE_SIZE).unwrap();
        unsafe { *writer.ptr_at(123) = 0x5A };

        let reader = Segment::open(&name).unwrap();
        assert_eq!(reader.size(), PAGE_SIZE);
        unsafe { assert_eq!(*reader.ptr_at(123), 0x5A) };

        drop(reader);
        writer.unlink();
    }

    #[test]
    fn unlink_detaches_the_name() {
        let name = unique_name("unlink");
        let mut segment = Segment::open(&name).unwrap();
        segment.resize(PAGE_SIZE).unwrap();
        segment.unlink();

        // A new opener gets a fresh, empty object rather than the old one.
        let mut fresh = Segment::open(&name).unwrap();
        assert_eq!(fresh.size(), 0);
        fresh.unlink();
    }

    #[test]
    fn remap_reestablishes_a_torn_mapping() {
        let name = unique_name("remap");
        let mut segment = Segment::open(&name).unwrap();
        segment.resize(PAGE_SIZE).unwrap();
        unsafe { *segment.ptr_at(9) = 0x7E };

        segment.inject_remap_failure();
        assert!(segment.resize(4 * PAGE_SIZE).is_err());
        assert_eq!(segment.size(), 0);
        assert!(segment.ptr().is_null());

        // The object survived the failed remap; a plain remap gets the
        // contents back without touching the object's length.
        segment.remap(PAGE_SIZE).unwrap();
        assert_eq!(segment.size(), PAGE_SIZE);
        unsafe { assert_eq!(*segment.ptr_at(9), 0x7E) };

        segment.unlink();
    }

    #[test]
    fn rejects_bad_names() {
        let long = format!("/{}", "x".repeat(300));
        assert!(matches!(Segment::open(&long), Err(ShmqError::Name(_))));
        assert!(matches!(Segment::open(""), Err(ShmqError::Name(_))));
        assert!(matches!(
            Segment::open("/bad\0name"),
            Err(ShmqError::Name(_))
        ));
    }
}
