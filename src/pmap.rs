//! Private-mapping (`pmap`) resource pool (spec.md §9 design note).
//!
//! The original driver's `pmap` mode reserves one per-CPU virtual-address
//! slot and rewrites its PTE to redirect at the target physical page for the
//! duration of an access, with a local TLB flush, to avoid a permanent
//! mapping of the whole PM region. In this crate the PM region is already a
//! single mmap'd arena with ordinary pointers into it, so no such
//! slot-remapping is needed on the hot path (see DESIGN.md) — but the
//! resource-pool shape spec.md §9 describes is implemented here as a
//! stand-alone utility for configurations that request it, modeled as "a
//! per-CPU slot array with `map(pfn) -> addr`/`unmap(addr)`; `map` is
//! exclusive per CPU".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One exclusive per-CPU mapping slot.
struct Slot {
    in_use: AtomicBool,
    mapped_pbn: AtomicU64,
}

/// A fixed pool of per-CPU private-mapping slots.
pub struct PmapPool {
    slots: Vec<Slot>,
}

const NONE: u64 = u64::MAX;

impl PmapPool {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            slots: (0..num_cpus.max(1))
                .map(|_| Slot {
                    in_use: AtomicBool::new(false),
                    mapped_pbn: AtomicU64::new(NONE),
                })
                .collect(),
        }
    }

    /// Exclusively map `pbn` into the slot for `cpu_id`. Returns `None` if
    /// that CPU's slot is already in use (spec.md §9: "`map` is exclusive
    /// per CPU").
    pub fn map(&self, cpu_id: usize, pbn: u64) -> Option<PmapGuard<'_>> {
        let slot = &self.slots[cpu_id % self.slots.len()];
        if slot.in_use.swap(true, Ordering::AcqRel) {
            return None;
        }
        slot.mapped_pbn.store(pbn, Ordering::Release);
        Some(PmapGuard { slot, pbn })
    }
}

/// RAII handle released by `unmap` on drop.
pub struct PmapGuard<'a> {
    slot: &'a Slot,
    pbn: u64,
}

impl<'a> PmapGuard<'a> {
    pub fn pbn(&self) -> u64 {
        self.pbn
    }
}

impl<'a> Drop for PmapGuard<'a> {
    fn drop(&mut self) {
        self.slot.mapped_pbn.store(NONE, Ordering::Release);
        self.slot.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_exclusive_per_cpu() {
        let pool = PmapPool::new(2);
        let g1 = pool.map(0, 7).unwrap();
        assert!(pool.map(0, 8).is_none());
        assert!(pool.map(1, 8).is_some());
        drop(g1);
        assert!(pool.map(0, 9).is_some());
    }
}
