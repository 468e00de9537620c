//! Write-protection mode switch (spec.md §4.4, §9 `PageProtector`) and the
//! `MemoryOps` abstraction for non-temporal copies and cache/fence
//! primitives.
//!
//! Two interchangeable [`PageProtector`] strategies are offered, selected
//! per device at construction: a PTE-flip mode and a supervisor-bypass
//! mode. Both present the same API to the flush engine and the unbuffered
//! writer (spec.md §4.4: "Both modes present the same API").

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use libc::{mprotect, PROT_READ, PROT_WRITE};
use tracing::trace;

use crate::arena::Arena;
use crate::error::{PmbdError, Result};

/// Per-device write-protection strategy, selected by `wpmode<n,...>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProtectMode {
    /// PM pages are read-only at rest; a window is flipped writable per flush run.
    Pte,
    /// PM pages stay mapped read-write; "supervisor write-protect" is modeled
    /// as a window marker only (see module docs and DESIGN.md) since
    /// userspace has no CR0.WP-equivalent to toggle.
    Bypass,
}

/// The page-permission interface the flush engine and unbuffered writer
/// consume (spec.md §9). Whether the host toggles PTEs or swaps
/// processor-level write-protect is invisible above this layer.
pub trait PageProtector: Send + Sync {
    /// Mark `[first_byte, last_byte)` of the arena read-only.
    fn protect_range_ro(&self, arena: &Arena, byte_range: Range<usize>) -> Result<()>;

    /// Mark `[first_byte, last_byte)` of the arena read-write.
    fn protect_range_rw(&self, arena: &Arena, byte_range: Range<usize>) -> Result<()>;

    /// Invalidate the TLB entry for one page. A no-op above the PTE layer
    /// when running without a real MMU shootdown primitive (see DESIGN.md).
    fn flush_one_tlb(&self, addr: *mut u8);

    fn mode(&self) -> WriteProtectMode;

    /// Whether a dirty-slot snapshot should be sorted by PBN before flushing
    /// (spec.md §4.3 step 4): true for PTE mode, false for bypass mode.
    fn needs_sort(&self) -> bool {
        self.mode() == WriteProtectMode::Pte
    }
}

/// PTE-flip protector: calls `mprotect` on the backing arena.
pub struct MprotectProtector {
    page_size: usize,
}

impl MprotectProtector {
    pub fn new() -> Self {
        Self {
            page_size: crate::arena::page_size(),
        }
    }

    fn aligned_range(&self, byte_range: &Range<usize>) -> Range<usize> {
        let start = byte_range.start / self.page_size * self.page_size;
        let end = (byte_range.end + self.page_size - 1) / self.page_size * self.page_size;
        start..end
    }
}

impl Default for MprotectProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProtector for MprotectProtector {
    fn protect_range_ro(&self, arena: &Arena, byte_range: Range<usize>) -> Result<()> {
        let r = self.aligned_range(&byte_range);
        let rc = unsafe {
            mprotect(
                arena.as_ptr().add(r.start) as *mut _,
                r.end - r.start,
                PROT_READ,
            )
        };
        if rc != 0 {
            return Err(PmbdError::OutOfMemory(format!(
                "mprotect(RO) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        trace!(start = r.start, end = r.end, "protect_range_ro");
        Ok(())
    }

    fn protect_range_rw(&self, arena: &Arena, byte_range: Range<usize>) -> Result<()> {
        let r = self.aligned_range(&byte_range);
        let rc = unsafe {
            mprotect(
                arena.as_ptr().add(r.start) as *mut _,
                r.end - r.start,
                PROT_READ | PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(PmbdError::OutOfMemory(format!(
                "mprotect(RW) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        trace!(start = r.start, end = r.end, "protect_range_rw");
        Ok(())
    }

    fn flush_one_tlb(&self, addr: *mut u8) {
        trace!(?addr, "flush_one_tlb (no-op: mprotect already shoots down the range)");
    }

    fn mode(&self) -> WriteProtectMode {
        WriteProtectMode::Pte
    }
}

/// Supervisor-bypass protector. The arena is always mapped read-write; the
/// "disable write protection" window is tracked only so tracing mirrors the
/// interrupt disable/enable bracket a kernel driver would use. See
/// DESIGN.md for why this cannot be a literal CR0.WP toggle in userspace.
///
/// The window is a single counter rather than per-range state, so it does
/// not actually arbitrate overlapping ranges — `wrprot` still serializes
/// every write through the PBI lock per PBN (spec.md §3). It is a *count*,
/// not a bool, because spec.md §5 requires concurrent writes to disjoint
/// PBNs to proceed without contention: distinct buffers' `flush_range`
/// calls (`buf_num>1`) and `unbuffered_write` on an unrelated PBN routinely
/// hold overlapping bypass windows at once, which a single open/closed flag
/// would misreport as illegal nesting.
pub struct BypassProtector {
    open_count: AtomicU32,
}

impl BypassProtector {
    pub fn new() -> Self {
        Self {
            open_count: AtomicU32::new(0),
        }
    }
}

impl Default for BypassProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProtector for BypassProtector {
    fn protect_range_ro(&self, _arena: &Arena, _byte_range: Range<usize>) -> Result<()> {
        let previous = self.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "closed a write window that was never opened");
        Ok(())
    }

    fn protect_range_rw(&self, _arena: &Arena, _byte_range: Range<usize>) -> Result<()> {
        self.open_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn flush_one_tlb(&self, _addr: *mut u8) {}

    fn mode(&self) -> WriteProtectMode {
        WriteProtectMode::Bypass
    }

    fn needs_sort(&self) -> bool {
        false
    }
}

/// Non-temporal copy, cache-flush and fence primitives (spec.md §9
/// `MemoryOps`). The core depends only on this trait; an arch-specific
/// module supplies the real intrinsics.
pub trait MemoryOps: Send + Sync {
    fn copy(&self, dst: &mut [u8], src: &[u8], non_temporal: bool);
    fn cacheline_flush(&self, ptr: *const u8, len: usize);
    fn sfence(&self);
    fn mfence(&self);

    /// Copy only the cacheline-sized chunks that differ, returning the
    /// number of chunks actually written (spec.md §4.5 "subupdate").
    fn diff_copy(&self, dst: &mut [u8], src: &[u8]) -> usize {
        const LINE: usize = 64;
        let mut written = 0;
        for (d, s) in dst.chunks_mut(LINE).zip(src.chunks(LINE)) {
            if d != s {
                d.copy_from_slice(s);
                written += 1;
            }
        }
        written
    }
}

/// Default `MemoryOps`: real non-temporal stores/loads and clflush on
/// x86_64 when the target supports them, falling back to ordinary copies
/// and a full `mfence` everywhere else.
#[derive(Default)]
pub struct DefaultMemoryOps;

impl MemoryOps for DefaultMemoryOps {
    fn copy(&self, dst: &mut [u8], src: &[u8], non_temporal: bool) {
        debug_assert_eq!(dst.len(), src.len());
        #[cfg(target_arch = "x86_64")]
        {
            if non_temporal && is_x86_feature_detected!("sse2") {
                unsafe { nontemporal_copy_sse2(dst, src) };
                return;
            }
        }
        let _ = non_temporal;
        dst.copy_from_slice(src);
    }

    fn cacheline_flush(&self, ptr: *const u8, len: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("sse2") {
                unsafe { clflush_range(ptr, len) };
                return;
            }
        }
        let _ = (ptr, len);
    }

    fn sfence(&self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_sfence();
        }
    }

    fn mfence(&self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_mfence();
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn nontemporal_copy_sse2(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::{_mm_load_si128, _mm_stream_si128};
    let n = dst.len();
    let mut i = 0;
    while i + 16 <= n {
        let chunk = _mm_load_si128(src.as_ptr().add(i) as *const _);
        _mm_stream_si128(dst.as_mut_ptr().add(i) as *mut _, chunk);
        i += 16;
    }
    if i < n {
        dst[i..].copy_from_slice(&src[i..]);
    }
    std::arch::x86_64::_mm_sfence();
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn clflush_range(ptr: *const u8, len: usize) {
    const LINE: usize = 64;
    let mut off = 0;
    while off < len {
        std::arch::x86_64::_mm_clflush(ptr.add(off));
        off += LINE;
    }
}
