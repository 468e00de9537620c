//! The flush engine (spec.md §4.3): drains dirty slots back into PM,
//! coalescing permission-window changes across contiguous PBN runs.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace, warn};

use crate::device::DeviceCore;
use crate::emulate::Direction;
use crate::error::{PmbdError, Result};
use crate::sector::{Bbn, Pbn, PHYSICAL_BLOCK_SIZE};

use super::ring::Buffer;

/// Who invoked this flush — purely for tracing/stats, per spec.md §4.2/§4.3/§4.6/§4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCaller {
    Allocator,
    Syncer,
    Destroyer,
}

/// `flush(buffer, budget) -> cleaned_count` (spec.md §4.3).
pub fn flush(buffer: &Buffer, core: &Arc<DeviceCore>, budget: usize, caller: FlushCaller) -> Result<usize> {
    let _flush_guard = buffer.flush_lock.lock();

    let snapshot: Vec<(Bbn, Pbn)> = {
        let meta = buffer.meta.lock();
        let budget = budget.min(meta.num_dirty as usize);
        if meta.num_dirty == 0 || budget == 0 {
            return Ok(0);
        }
        let mut pairs = Vec::with_capacity(budget);
        let mut pos = meta.pos_dirty;
        for _ in 0..budget {
            let bbn = Bbn(pos);
            pairs.push((bbn, meta.bbi[pos as usize].pbn));
            pos = (pos + 1) % buffer.n as u32;
        }
        pairs
    };

    let mut sorted = snapshot;
    if core.protector.needs_sort() {
        sorted.sort_by_key(|(_, pbn)| pbn.0);
    }

    let mut cleaned = 0usize;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j].1 .0 == sorted[j - 1].1 .0 + 1 {
            j += 1;
        }
        let run = &sorted[i..j];
        cleaned += flush_range(buffer, core, run)?;
        i = j;
    }

    {
        let mut meta = buffer.meta.lock();
        meta.pos_dirty = (meta.pos_dirty + cleaned as u32) % buffer.n as u32;
        meta.num_dirty -= cleaned as u32;
    }

    trace!(buffer = buffer.id, ?caller, cleaned, "flush complete");
    Ok(cleaned)
}

/// `flush_range(buffer, first, last)` (spec.md §4.3): all PBNs in `run`
/// are currently buffered and owned by `buffer` (caller contract).
fn flush_range(buffer: &Buffer, core: &Arc<DeviceCore>, run: &[(Bbn, Pbn)]) -> Result<usize> {
    if run.is_empty() {
        return Ok(0);
    }
    let first_pbn = run[0].1;
    let last_pbn = run[run.len() - 1].1;
    let byte_range = first_pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize
        ..(last_pbn.byte_offset(PHYSICAL_BLOCK_SIZE) + PHYSICAL_BLOCK_SIZE) as usize;

    core.protector.protect_range_rw(&core.arena, byte_range.clone())?;

    // Pass 1: copy each dirty slot into PM, mark the slot clean. Hold each
    // PBI lock across both passes (spec.md §4.3 step 2b/4).
    //
    // `try_lock` rather than `lock`: this flush may have been triggered by
    // `Buffer::allocate` while the calling thread still holds the PBI guard
    // for the PBN it is allocating a slot for (spec.md §4.2). Once
    // `num_pbns` exceeds the stripe count (any device above 256 MiB, see
    // `pbi.rs`), that PBN can share a stripe with an entry in this run — a
    // blocking `lock` there would re-enter a non-reentrant mutex the thread
    // already holds and deadlock. Failing to acquire is treated exactly
    // like the pre-existing stale-binding race below: the slot stays dirty
    // and is retried on the next flush.
    let mut guards = Vec::with_capacity(run.len());
    for &(bbn, pbn) in run {
        match core.pbi.try_lock(pbn) {
            Some(guard) => {
                if guard.bbn() == bbn {
                    let slot = buffer.slot_ref(bbn).lock();
                    let offset = pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize;
                    let t0 = Instant::now();
                    unsafe {
                        let dst = core.arena.slice_mut(offset, PHYSICAL_BLOCK_SIZE as usize);
                        core.mem_ops.copy(dst, &slot, core.cfg.nts);
                    }
                    core.emulation.slowdown_pad(Direction::Write, t0.elapsed());
                    core.emulation.rdwr_pause(Direction::Write, PHYSICAL_BLOCK_SIZE as usize);
                    let mut meta = buffer.meta.lock();
                    meta.bbi[bbn.as_usize()].dirty = false;
                }
                guards.push(Some(guard));
            }
            None => {
                trace!(%pbn, %bbn, "flush_range: stripe busy (held by caller or a racing request), deferring");
                guards.push(None);
            }
        }
    }

    core.protector.protect_range_ro(&core.arena, byte_range)?;

    let mut cleaned = 0usize;
    for (guard, &(bbn, pbn)) in guards.iter().zip(run.iter()) {
        let Some(guard) = guard else { continue };
        if guard.bbn() != bbn {
            continue;
        }
        let offset = pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize;

        if core.cfg.wrverify {
            let data = unsafe { core.arena.slice(offset, PHYSICAL_BLOCK_SIZE as usize) };
            let slot = buffer.slot_ref(bbn).lock();
            if data != &slot[..] {
                let err = PmbdError::VerificationMismatch { pbn: pbn.0 };
                error!(%err, "aborting");
                panic!("pmbd: {err}");
            }
        }

        if let Some(checksum) = &core.checksum {
            let data = unsafe { core.arena.slice(offset, PHYSICAL_BLOCK_SIZE as usize) };
            checksum.recompute(pbn.0 as usize, data);
        }

        guard.clear_bbn();
        cleaned += 1;
    }

    if cleaned != run.len() {
        warn!(
            expected = run.len(),
            actual = cleaned,
            "flush_range cleaned fewer slots than expected (stale binding or busy stripe raced with flush)"
        );
    }

    Ok(cleaned)
}
