//! The device itself: request dispatch, the barrier protocol, and the
//! unbuffered (protected) write/read primitives (spec.md §3, §4.5, §4.8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::arena::Arena;
use crate::buffer::{flush, BufferGroup, FlushCaller};
use crate::checksum::ChecksumStore;
use crate::config::{CacheAttr, DeviceConfig, WriteBackFlush};
use crate::emulate::{Direction, EmulationEngine};
use crate::error::{PmbdError, Result};
use crate::pbi::PbiTable;
use crate::protect::{
    BypassProtector, DefaultMemoryOps, MemoryOps, MprotectProtector, PageProtector, WriteProtectMode,
};
use crate::sector::{Pbn, Sector, PHYSICAL_BLOCK_SIZE, SECTOR_SIZE, SECTORS_PER_PB};
use crate::stats::{DeviceStats, DeviceStatsSnapshot};

/// I/O direction of a request (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Flush capability advertised by the device (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCapability {
    None,
    Flush,
    FlushFua,
}

/// One scatter-gather request (spec.md §6 `make_request`).
pub struct Request<'a> {
    pub sector: u64,
    pub direction: IoDirection,
    pub flush: bool,
    pub fua: bool,
    pub sg_segments: Vec<&'a mut [u8]>,
}

impl<'a> Request<'a> {
    pub fn len_bytes(&self) -> usize {
        self.sg_segments.iter().map(|s| s.len()).sum()
    }
}

/// The block-device surface consumed by the host (spec.md §6).
pub trait BlockDevice {
    fn make_request(&self, req: Request<'_>) -> Result<()>;
    fn capacity_sectors(&self) -> u64;
    fn logical_block_size(&self) -> u32;
    fn physical_block_size(&self) -> u32;
    fn max_hw_sectors(&self) -> u32;
    fn flush_capability(&self) -> FlushCapability;

    /// Merge predicate (spec.md §6): given the size in bytes already
    /// accumulated in a request being built and the length of a candidate
    /// segment to append, return how many of those bytes may actually be
    /// merged in. When the device is "not mergeable", only an empty-size
    /// probe (`accumulated == 0`) may merge; otherwise the whole candidate
    /// is always accepted.
    fn merge_allowed(&self, accumulated: usize, candidate_len: usize) -> usize;
}

pub const LOGICAL_BLOCK_SIZE: u32 = SECTOR_SIZE as u32;
pub const MAX_HW_SECTORS: u32 = 1024;

/// Shared, exclusively-owned device state (spec.md §3 "Ownership"). Held
/// behind an `Arc` so the buffer group's syncer threads can reach it.
pub struct DeviceCore {
    pub index: usize,
    pub capacity_sectors: u64,
    pub arena: Arena,
    pub pbi: PbiTable,
    pub checksum: Option<ChecksumStore>,
    pub protector: Box<dyn PageProtector>,
    pub mem_ops: Box<dyn MemoryOps>,
    pub cfg: DeviceConfig,
    pub stats: DeviceStats,
    pub pending_writes: AtomicU64,
    pub barrier_lock: Mutex<()>,
    pub emulation: Arc<EmulationEngine>,
    start: Instant,
    last_access_ms: AtomicU64,
}

impl DeviceCore {
    pub fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_access_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_duration(&self) -> Duration {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_access_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    fn num_pbns(&self) -> u64 {
        self.capacity_sectors / SECTORS_PER_PB
    }
}

pub struct Device {
    core: Arc<DeviceCore>,
    buffers: BufferGroup,
}

impl Device {
    pub fn new(index: usize, cfg: DeviceConfig) -> Result<Self> {
        if cfg.capacity_sectors == 0 {
            return Err(PmbdError::ConfigInvalid("device capacity must be non-zero".into()));
        }

        let num_pbns = (cfg.capacity_sectors + SECTORS_PER_PB - 1) / SECTORS_PER_PB;
        let arena_len = (num_pbns * PHYSICAL_BLOCK_SIZE) as usize;
        let arena = Arena::new(arena_len)?;

        let protector: Box<dyn PageProtector> = match cfg.wp_mode {
            WriteProtectMode::Pte => Box::new(MprotectProtector::new()),
            WriteProtectMode::Bypass => Box::new(BypassProtector::new()),
        };

        if cfg.write_protect && protector.mode() == WriteProtectMode::Pte {
            protector.protect_range_ro(&arena, 0..arena.len())?;
        }

        let checksum = if cfg.checksum {
            Some(ChecksumStore::new(num_pbns as usize))
        } else {
            None
        };

        let emulation = EmulationEngine::new(
            cfg.read_mode,
            cfg.write_mode,
            cfg.rd_pause_cycles,
            cfg.wr_pause_cycles,
        );

        let core = Arc::new(DeviceCore {
            index,
            capacity_sectors: cfg.capacity_sectors,
            arena,
            pbi: PbiTable::new(num_pbns as usize),
            checksum,
            protector,
            mem_ops: Box::new(DefaultMemoryOps),
            cfg,
            stats: DeviceStats::default(),
            pending_writes: AtomicU64::new(0),
            barrier_lock: Mutex::new(()),
            emulation,
            start: Instant::now(),
            last_access_ms: AtomicU64::new(0),
        });

        let slots_per_buffer = ((core.cfg.buf_size_mib * 1024 * 1024) / PHYSICAL_BLOCK_SIZE) as usize;
        let buffers = BufferGroup::new(
            core.cfg.buf_num.max(1),
            slots_per_buffer.max(1),
            core.cfg.buf_stride,
            core.cfg.batch,
        );
        buffers.start_syncers(core.clone());

        debug!(
            index,
            capacity_sectors = core.capacity_sectors,
            buffers = buffers.len(),
            "pmbd device created"
        );

        Ok(Self { core, buffers })
    }

    fn buffering_enabled(&self) -> bool {
        self.core.cfg.buf_num > 0 && !self.buffers.is_empty()
    }

    fn check_capacity(&self, sector: u64, len_bytes: usize) -> Result<()> {
        let sectors = len_bytes as u64 / SECTOR_SIZE;
        let end = sector + sectors;
        if end > self.core.capacity_sectors {
            return Err(PmbdError::CapacityExceeded {
                start: sector,
                end,
                capacity: self.core.capacity_sectors,
            });
        }
        Ok(())
    }

    /// Barrier protocol (spec.md §4.8).
    fn barrier(&self) -> Result<()> {
        let _barrier_guard = self.core.barrier_lock.lock();

        while self.core.pending_writes.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }

        for buf in self.buffers.buffers() {
            flush(buf, &self.core, buf.n, FlushCaller::Destroyer)?;
        }

        apply_fence_policy(&self.core);

        self.core.stats.barriers.fetch_add(1, Ordering::Relaxed);
        trace!(index = self.core.index, "barrier complete");
        Ok(())
    }

    /// `write_segment` (spec.md §4.5).
    fn write_segment(&self, pbn: Pbn, range: std::ops::Range<u64>, data: &[u8], fua: bool) -> Result<()> {
        let offset_in_pb = (range.start * SECTOR_SIZE) as usize;
        let full_pb = range.start == 0 && range.end == SECTORS_PER_PB;

        if self.buffering_enabled() {
            let buffer = self.buffers.buffer_for(pbn);
            let guard = self.core.pbi.lock(pbn);

            let bbn = match buffer.lookup(&guard) {
                Some(bbn) => bbn,
                None => {
                    let bbn = buffer.allocate(&guard, &self.core)?;
                    if !full_pb {
                        let mut full = vec![0u8; PHYSICAL_BLOCK_SIZE as usize];
                        self.read_pb_from_pm(pbn, &mut full);
                        buffer.hydrate(bbn, &full);
                    }
                    bbn
                }
            };
            let t0 = Instant::now();
            buffer.write_into(bbn, offset_in_pb, data);
            self.core.emulation.slowdown_pad(Direction::Write, t0.elapsed());
            drop(guard);
        } else {
            let guard = self.core.pbi.lock(pbn);
            self.unbuffered_write(pbn, offset_in_pb, data)?;
            drop(guard);
            return Ok(());
        }

        if fua {
            // Double-write straight to PM so the data is durable before completion returns.
            self.unbuffered_write(pbn, offset_in_pb, data)?;
        }
        Ok(())
    }

    /// `read_segment` (spec.md §4.5).
    fn read_segment(&self, pbn: Pbn, range: std::ops::Range<u64>, out: &mut [u8]) -> Result<()> {
        let offset_in_pb = (range.start * SECTOR_SIZE) as usize;
        let guard = self.core.pbi.lock(pbn);

        let buffered = if self.buffering_enabled() {
            let buffer = self.buffers.buffer_for(pbn);
            buffer.lookup(&guard).map(|bbn| (buffer, bbn))
        } else {
            None
        };

        if let Some((buffer, bbn)) = buffered {
            let t0 = Instant::now();
            let mut full = vec![0u8; PHYSICAL_BLOCK_SIZE as usize];
            buffer.read_from(bbn, &mut full);
            out.copy_from_slice(&full[offset_in_pb..offset_in_pb + out.len()]);
            self.core.emulation.slowdown_pad(Direction::Read, t0.elapsed());
        } else {
            if let Some(checksum) = &self.core.checksum {
                let full = unsafe {
                    self.core
                        .arena
                        .slice(pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize, PHYSICAL_BLOCK_SIZE as usize)
                };
                if !checksum.verify(pbn.0 as usize, full) {
                    self.core.stats.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
                    warn!(%pbn, "checksum mismatch on read");
                }
            }
            self.read_pb_range_from_pm(pbn, offset_in_pb, out);
        }
        drop(guard);
        Ok(())
    }

    fn read_pb_from_pm(&self, pbn: Pbn, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PHYSICAL_BLOCK_SIZE as usize);
        let offset = pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize;
        let t0 = Instant::now();
        let src = unsafe { self.core.arena.slice(offset, PHYSICAL_BLOCK_SIZE as usize) };
        self.core.mem_ops.copy(out, src, self.core.cfg.ntl);
        self.core.emulation.slowdown_pad(Direction::Read, t0.elapsed());
        self.core.emulation.rdwr_pause(Direction::Read, out.len());
    }

    fn read_pb_range_from_pm(&self, pbn: Pbn, offset_in_pb: usize, out: &mut [u8]) {
        let offset = pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize + offset_in_pb;
        let t0 = Instant::now();
        let src = unsafe { self.core.arena.slice(offset, out.len()) };
        self.core.mem_ops.copy(out, src, self.core.cfg.ntl);
        self.core.emulation.slowdown_pad(Direction::Read, t0.elapsed());
        self.core.emulation.rdwr_pause(Direction::Read, out.len());
    }

    /// Unbuffered (protected) write straight to PM (spec.md §4.5 "Unbuffered write").
    fn unbuffered_write(&self, pbn: Pbn, offset_in_pb: usize, data: &[u8]) -> Result<()> {
        let byte_offset = pbn.byte_offset(PHYSICAL_BLOCK_SIZE) as usize;
        let range = byte_offset..byte_offset + PHYSICAL_BLOCK_SIZE as usize;

        self.core.protector.protect_range_rw(&self.core.arena, range.clone())?;

        let t0 = Instant::now();
        unsafe {
            let dst = self
                .core
                .arena
                .slice_mut(byte_offset + offset_in_pb, data.len());
            if self.core.cfg.subupdate {
                self.core.mem_ops.diff_copy(dst, data);
            } else {
                self.core.mem_ops.copy(dst, data, self.core.cfg.nts);
            }
        }
        self.core
            .emulation
            .slowdown_pad(Direction::Write, t0.elapsed());
        self.core.emulation.rdwr_pause(Direction::Write, data.len());

        self.core.protector.protect_range_ro(&self.core.arena, range)?;

        if self.core.cfg.wrverify {
            let check = unsafe { self.core.arena.slice(byte_offset + offset_in_pb, data.len()) };
            if check != data {
                let err = PmbdError::VerificationMismatch { pbn: pbn.0 };
                tracing::error!(%err, "aborting");
                panic!("pmbd: {err}");
            }
        }

        if let Some(checksum) = &self.core.checksum {
            let full = unsafe { self.core.arena.slice(byte_offset, PHYSICAL_BLOCK_SIZE as usize) };
            checksum.recompute(pbn.0 as usize, full);
        }

        Ok(())
    }

    /// Drain every buffer and restore page permissions (spec.md §3 "Lifecycle").
    pub fn shutdown(&self) -> Result<()> {
        self.buffers.drain_all(&self.core)?;
        self.buffers.stop_syncers();
        if self.core.cfg.write_protect && self.core.protector.mode() == WriteProtectMode::Pte {
            self.core
                .protector
                .protect_range_ro(&self.core.arena, 0..self.core.arena.len())?;
        }
        Ok(())
    }

    pub fn stats_snapshot(&self) -> DeviceStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Total dirty slots currently held across every buffer, for diagnostics
    /// and tests (spec.md §6 introspection surface).
    pub fn buffered_dirty_count(&self) -> usize {
        self.buffers.buffers().iter().map(|b| b.num_dirty() as usize).sum()
    }

    /// Read one physical block straight out of the PM window, bypassing the
    /// staging buffer entirely (spec.md §6 introspection surface — used to
    /// confirm durability independent of what the buffer currently holds).
    pub fn read_pm_direct(&self, pbn: u64) -> Result<Vec<u8>> {
        let pbn = Pbn(pbn);
        if pbn.0 >= self.core.num_pbns() {
            return Err(PmbdError::CapacityExceeded {
                start: pbn.first_sector().0,
                end: pbn.first_sector().0 + SECTORS_PER_PB,
                capacity: self.core.capacity_sectors,
            });
        }
        let mut out = vec![0u8; PHYSICAL_BLOCK_SIZE as usize];
        self.read_pb_from_pm(pbn, &mut out);
        Ok(out)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.core.cfg
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(index = self.core.index, error = %e, "error during device teardown");
        }
    }
}

fn apply_fence_policy(core: &DeviceCore) {
    // spec.md §4.8 step 4: every combination besides plain write-back is a
    // no-op because the relevant fence was already issued inline per copy.
    match (core.cfg.cache, core.cfg.write_back_flush) {
        (CacheAttr::WriteBack, WriteBackFlush::Neither) => {
            core.mem_ops.mfence();
            trace!("barrier: write-back without nts/clflush, issuing full fence");
        }
        _ => {
            trace!("barrier: fence already implied by per-copy nts/clflush/cache mode");
        }
    }
}

impl BlockDevice for Device {
    fn make_request(&self, req: Request<'_>) -> Result<()> {
        if req.flush {
            self.barrier()?;
        }

        if matches!(req.direction, IoDirection::Write) {
            drop(self.core.barrier_lock.lock());
            self.core.pending_writes.fetch_add(1, Ordering::AcqRel);
        }

        let direction = match req.direction {
            IoDirection::Read => Direction::Read,
            IoDirection::Write => Direction::Write,
        };
        let t0 = self.core.emulation.begin();

        let len_bytes = req.len_bytes();
        let result = (|| -> Result<()> {
            self.check_capacity(req.sector, len_bytes)?;

            if len_bytes == 0 {
                return Ok(()); // spec.md §7 EmptyBatch: flush-only probe succeeds.
            }

            self.core.touch();

            let mut sector = req.sector;
            for segment in req.sg_segments {
                let sectors = segment.len() as u64 / SECTOR_SIZE;
                self.dispatch_segment(sector, segment, req.direction, req.fua)?;
                sector += sectors;
            }
            Ok(())
        })();

        let sector_count = len_bytes as u64 / SECTOR_SIZE;
        self.core.emulation.end(direction, t0, sector_count.max(1));

        if matches!(req.direction, IoDirection::Write) {
            self.core.pending_writes.fetch_sub(1, Ordering::AcqRel);
            self.core.stats.writes.record(sector_count);
            if req.fua {
                self.core.stats.fuas.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.core.stats.reads.record(sector_count);
        }

        result
    }

    fn capacity_sectors(&self) -> u64 {
        self.core.capacity_sectors
    }

    fn logical_block_size(&self) -> u32 {
        LOGICAL_BLOCK_SIZE
    }

    fn physical_block_size(&self) -> u32 {
        PHYSICAL_BLOCK_SIZE as u32
    }

    fn max_hw_sectors(&self) -> u32 {
        MAX_HW_SECTORS
    }

    fn flush_capability(&self) -> FlushCapability {
        match (self.core.cfg.honor_flush, self.core.cfg.honor_fua) {
            (true, true) => FlushCapability::FlushFua,
            (true, false) => FlushCapability::Flush,
            (false, _) => FlushCapability::None,
        }
    }

    fn merge_allowed(&self, accumulated: usize, candidate_len: usize) -> usize {
        if self.core.cfg.mergeable || accumulated == 0 {
            candidate_len
        } else {
            0
        }
    }
}

impl Device {
    fn dispatch_segment(
        &self,
        start_sector: u64,
        segment: &mut [u8],
        direction: IoDirection,
        fua: bool,
    ) -> Result<()> {
        let byte_len = segment.len();
        let start = Sector(start_sector);
        let end_sector = start_sector + byte_len as u64 / SECTOR_SIZE;

        let mut pbn = start.to_pbn();
        let mut consumed = 0usize;

        while consumed < byte_len {
            let pb_first_sector = pbn.first_sector().0;
            let range_start = if consumed == 0 {
                start_sector - pb_first_sector
            } else {
                0
            };
            let remaining_sectors_in_request = (end_sector - (pb_first_sector + range_start)).min(SECTORS_PER_PB - range_start);
            let range_end = range_start + remaining_sectors_in_request;
            let chunk_len = (remaining_sectors_in_request * SECTOR_SIZE) as usize;

            let chunk = &mut segment[consumed..consumed + chunk_len];
            match direction {
                IoDirection::Write => self.write_segment(pbn, range_start..range_end, chunk, fua)?,
                IoDirection::Read => self.read_segment(pbn, range_start..range_end, chunk)?,
            }

            consumed += chunk_len;
            pbn = Pbn(pbn.0 + 1);
        }

        Ok(())
    }
}
