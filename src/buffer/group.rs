//! Buffer group: partitions PBNs across `K` independent buffers (spec.md §3).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::DeviceCore;
use crate::error::Result;
use crate::sector::Pbn;

use super::flush::{flush, FlushCaller};
use super::ring::Buffer;
use super::syncer::Syncer;

pub struct BufferGroup {
    buffers: Vec<Arc<Buffer>>,
    syncers: Mutex<Vec<Syncer>>,
    stride: u64,
}

impl BufferGroup {
    /// `k` buffers, each `slots_per_buffer` deep, partitioning PBNs by
    /// `(pbn / stride) mod k` (spec.md §3).
    pub fn new(k: usize, slots_per_buffer: usize, stride: u64, batch_size: usize) -> Self {
        let buffers: Vec<Arc<Buffer>> = (0..k)
            .map(|i| Arc::new(Buffer::new(i, slots_per_buffer, batch_size)))
            .collect();
        Self {
            buffers,
            syncers: Mutex::new(Vec::new()),
            stride: stride.max(1),
        }
    }

    #[inline]
    pub fn buffer_index(&self, pbn: Pbn) -> usize {
        ((pbn.0 / self.stride) as usize) % self.buffers.len()
    }

    #[inline]
    pub fn buffer_for(&self, pbn: Pbn) -> &Arc<Buffer> {
        &self.buffers[self.buffer_index(pbn)]
    }

    pub fn buffers(&self) -> &[Arc<Buffer>] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Start one syncer task per buffer (spec.md §4.6). `core` must already
    /// be fully constructed (syncers dereference it from a background
    /// thread).
    pub fn start_syncers(&self, core: Arc<DeviceCore>) {
        let new_syncers = self
            .buffers
            .iter()
            .cloned()
            .map(|buf| Syncer::start(buf, core.clone()))
            .collect();
        *self.syncers.lock() = new_syncers;
    }

    /// Stop every syncer (cooperative, per spec.md §4.6 "Cancellation").
    pub fn stop_syncers(&self) {
        for s in self.syncers.lock().drain(..) {
            s.stop_and_join();
        }
    }

    /// Drain every buffer synchronously (spec.md §4.8 step 3, and device
    /// teardown per spec.md §3 "Lifecycle").
    pub fn drain_all(&self, core: &Arc<DeviceCore>) -> Result<usize> {
        let mut total = 0;
        for buf in &self.buffers {
            total += flush(buf, core, buf.n, FlushCaller::Destroyer)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_by_stride() {
        let group = BufferGroup::new(4, 8, 1024, 4);
        assert_eq!(group.buffer_index(Pbn(0)), 0);
        assert_eq!(group.buffer_index(Pbn(1023)), 0);
        assert_eq!(group.buffer_index(Pbn(1024)), 1);
        assert_eq!(group.buffer_index(Pbn(1024 * 4)), 0);
    }
}
