//! The buffer ring itself: `N` 4096-byte slots, per-slot metadata, and the
//! allocator (spec.md §3 "Buffer", §4.2 "Buffer Allocator").

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::device::DeviceCore;
use crate::error::Result;
use crate::pbi::PbiGuard;
use crate::sector::{Bbn, Pbn, PHYSICAL_BLOCK_SIZE};

use super::flush::{flush, FlushCaller};

/// Per-slot metadata (spec.md §3 `bbi[N]: {pbn, dirty}`).
#[derive(Debug, Clone, Copy)]
pub struct Bbi {
    pub pbn: Pbn,
    pub dirty: bool,
}

impl Default for Bbi {
    fn default() -> Self {
        Self {
            pbn: Pbn(0),
            dirty: false,
        }
    }
}

/// Control metadata guarded by `buffer_lock` (spec.md §3).
pub(super) struct BufferMeta {
    pub pos_dirty: u32,
    pub pos_clean: u32,
    pub num_dirty: u32,
    pub bbi: Vec<Bbi>,
}

/// One DRAM staging buffer: a ring of `n` slots belonging to a [`super::BufferGroup`].
///
/// Slot contents are stored behind per-slot mutexes. The invariant (spec.md
/// §3) is that slot content is only ever touched while the owning PBI lock
/// is held; the per-slot mutex here is therefore always uncontended in
/// practice and exists so the implementation stays within safe Rust rather
/// than relying purely on an external, unchecked discipline (see DESIGN.md).
pub struct Buffer {
    pub id: usize,
    pub n: usize,
    pub batch_size: usize,
    slots: Vec<Mutex<Box<[u8]>>>,
    pub(super) meta: Mutex<BufferMeta>,
    pub(super) flush_lock: Mutex<()>,
    pub(super) sort_scratch: Mutex<Vec<(Bbn, Pbn)>>,
}

impl Buffer {
    pub fn new(id: usize, n: usize, batch_size: usize) -> Self {
        let slots = (0..n)
            .map(|_| Mutex::new(vec![0u8; PHYSICAL_BLOCK_SIZE as usize].into_boxed_slice()))
            .collect();
        Self {
            id,
            n,
            batch_size,
            slots,
            meta: Mutex::new(BufferMeta {
                pos_dirty: 0,
                pos_clean: 0,
                num_dirty: 0,
                bbi: vec![Bbi::default(); n],
            }),
            flush_lock: Mutex::new(()),
            sort_scratch: Mutex::new(Vec::with_capacity(n)),
        }
    }

    pub fn num_dirty(&self) -> u32 {
        self.meta.lock().num_dirty
    }

    pub fn is_full(&self) -> bool {
        self.meta.lock().num_dirty as usize == self.n
    }

    /// `lookup(buffer, pbn)` (spec.md §4.1): caller already holds the PBI
    /// lock for `pbn`; this just reads the binding.
    pub fn lookup(&self, pbi: &PbiGuard<'_>) -> Option<Bbn> {
        let bbn = pbi.bbn();
        if bbn.is_none() {
            None
        } else {
            Some(bbn)
        }
    }

    /// Allocate a free slot for `pbn` (spec.md §4.2). Caller holds `pbi.lock()`.
    pub fn allocate(&self, pbi: &PbiGuard<'_>, core: &Arc<DeviceCore>) -> Result<Bbn> {
        let pbn = pbi.pbn();
        loop {
            {
                let mut meta = self.meta.lock();
                if (meta.num_dirty as usize) < self.n {
                    let pos = meta.pos_clean;
                    meta.pos_clean = (pos + 1) % self.n as u32;
                    meta.num_dirty += 1;
                    let slot_idx = pos as usize;
                    meta.bbi[slot_idx].dirty = true;
                    meta.bbi[slot_idx].pbn = pbn;
                    drop(meta);

                    let bbn = Bbn(pos);
                    pbi.set_bbn(bbn);
                    trace!(buffer = self.id, %pbn, %bbn, "allocated buffer slot");
                    return Ok(bbn);
                }
            }

            debug!(buffer = self.id, "buffer full, triggering foreground flush");
            flush(self, core, self.batch_size, FlushCaller::Allocator)?;
        }
    }

    /// Copy `data` into the slot at `bbn`, overwriting `[offset, offset+data.len())`
    /// within the 4096-byte slot.
    pub fn write_into(&self, bbn: Bbn, offset: usize, data: &[u8]) {
        let mut slot = self.slots[bbn.as_usize()].lock();
        slot[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy the full slot at `bbn` into `out` (must be exactly one PB long).
    pub fn read_from(&self, bbn: Bbn, out: &mut [u8]) {
        let slot = self.slots[bbn.as_usize()].lock();
        out.copy_from_slice(&slot);
    }

    /// Hydrate the slot at `bbn` with `full_pb` (used when a partial write
    /// allocates a fresh slot and must first read the untouched portion
    /// from PM, spec.md §4.5 `write_segment`).
    pub fn hydrate(&self, bbn: Bbn, full_pb: &[u8]) {
        let mut slot = self.slots[bbn.as_usize()].lock();
        slot.copy_from_slice(full_pb);
    }

    pub(super) fn slot_ref(&self, bbn: Bbn) -> &Mutex<Box<[u8]>> {
        &self.slots[bbn.as_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_is_empty() {
        let buf = Buffer::new(0, 8, 4);
        assert_eq!(buf.num_dirty(), 0);
        assert!(!buf.is_full());
    }

    #[test]
    fn write_into_and_read_from_round_trip() {
        let buf = Buffer::new(0, 4, 2);
        let data = vec![0x5Au8; PHYSICAL_BLOCK_SIZE as usize];
        buf.hydrate(Bbn(0), &data);
        let mut out = vec![0u8; PHYSICAL_BLOCK_SIZE as usize];
        buf.read_from(Bbn(0), &mut out);
        assert_eq!(out, data);
    }
}
