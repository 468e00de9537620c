//! Statistics/introspection surface (spec.md §6). Out of scope as a
//! diagnostic subsystem in its own right (spec.md §1), but carried as the
//! ambient observability every device exposes.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct DirectionStats {
    pub requests: AtomicU64,
    pub sectors: AtomicU64,
}

impl DirectionStats {
    pub fn record(&self, sectors: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.sectors.fetch_add(sectors, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DirectionStatsSnapshot {
        DirectionStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            sectors: self.sectors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DirectionStatsSnapshot {
    pub requests: u64,
    pub sectors: u64,
}

#[derive(Default)]
pub struct DeviceStats {
    pub reads: DirectionStats,
    pub writes: DirectionStats,
    pub barriers: AtomicU64,
    pub fuas: AtomicU64,
    pub checksum_mismatches: AtomicU64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceStatsSnapshot {
    pub reads: DirectionStatsSnapshot,
    pub writes: DirectionStatsSnapshot,
    pub barriers: u64,
    pub fuas: u64,
    pub checksum_mismatches: u64,
}

impl DeviceStats {
    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            reads: self.reads.snapshot(),
            writes: self.writes.snapshot(),
            barriers: self.barriers.load(Ordering::Relaxed),
            fuas: self.fuas.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
        }
    }
}
