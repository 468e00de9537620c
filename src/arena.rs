//! The reserved-memory arena standing in for a PM window.
//!
//! An anonymous mapping is the userspace analogue of a kernel driver's
//! `ioremap()`'d high-memory region. The real PM reservation allocator and
//! the `HM`/`VM` distinction between `ioremap()` and `vmalloc()` are out of
//! scope (spec.md §1); both config modes resolve to the same arena here.

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use std::ptr::NonNull;

use crate::error::{PmbdError, Result};

/// An anonymous memory mapping standing in for a reserved PM window.
///
/// Owns its mapping exclusively; dropped (and `munmap`'d) on device teardown.
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Maps `len` bytes, rounded up to the host page size.
    pub fn new(len: usize) -> Result<Self> {
        let page_size = page_size();
        let mapped_len = round_up(len, page_size);

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                mapped_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == MAP_FAILED {
            return Err(PmbdError::OutOfMemory(format!(
                "mmap of {mapped_len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let ptr = NonNull::new(addr as *mut u8)
            .expect("mmap returned null without MAP_FAILED");

        Ok(Self { ptr, len: mapped_len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Raw byte slice over the whole arena. Callers are responsible for the
    /// same aliasing discipline the write-protection layer enforces: no
    /// mutable access without going through the protected-write path.
    ///
    /// # Safety
    /// The caller must ensure no other mutable borrow of the same range is
    /// alive, and that `range` is within bounds.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }

    /// # Safety
    /// Same contract as [`Arena::slice`], mutably.
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr.as_ptr() as *mut _, self.len);
        }
    }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_touch() {
        let arena = Arena::new(64 * 1024).unwrap();
        assert!(arena.len() >= 64 * 1024);
        unsafe {
            let s = arena.slice_mut(0, 16);
            s.copy_from_slice(&[7u8; 16]);
            assert_eq!(arena.slice(0, 16), &[7u8; 16]);
        }
    }
}
