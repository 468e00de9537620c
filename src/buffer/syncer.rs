//! The syncer task (spec.md §4.6): one cooperative background thread per
//! buffer, draining dirty slots by watermark or idle policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::DeviceCore;

use super::flush::{flush, FlushCaller};
use super::ring::Buffer;

/// High watermark: flush starts once `num_dirty >= HIGH_WATERMARK * n`.
pub const HIGH_WATERMARK: f64 = 0.7;
/// Low watermark: once flushing starts, it continues until `num_dirty < LOW_WATERMARK * n`.
pub const LOW_WATERMARK: f64 = 0.1;
/// Idle threshold: device must have been quiet this long before a
/// low-watermark-triggered flush fires.
pub const IDLE_THRESHOLD: Duration = Duration::from_millis(2);
/// One scheduling tick for the syncer loop — the userspace analogue of a jiffy.
const JIFFY: Duration = Duration::from_millis(4);

pub struct Syncer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Syncer {
    pub fn start(buffer: Arc<Buffer>, core: Arc<DeviceCore>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let handle = std::thread::Builder::new()
            .name(format!("pmbd-syncer-{}-{}", core.index, buffer.id))
            .spawn(move || syncer_loop(buffer, core, stop_clone))
            .expect("failed to spawn syncer thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop_and_join(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn syncer_loop(buffer: Arc<Buffer>, core: Arc<DeviceCore>, stop: Arc<AtomicBool>) {
    let high_mark = (buffer.n as f64 * HIGH_WATERMARK) as u32;
    let low_mark = (buffer.n as f64 * LOW_WATERMARK) as u32;

    while !stop.load(Ordering::Acquire) {
        let num_dirty = buffer.num_dirty();
        let idle = core.idle_duration();

        let mut do_flush = num_dirty >= high_mark || (idle > IDLE_THRESHOLD && num_dirty >= low_mark);

        while do_flush && buffer.num_dirty() >= low_mark {
            match flush(&buffer, &core, buffer.batch_size, FlushCaller::Syncer) {
                Ok(0) => {
                    do_flush = false;
                }
                Ok(n) => {
                    debug!(buffer = buffer.id, cleaned = n, "syncer flushed");
                }
                Err(e) => {
                    warn!(buffer = buffer.id, error = %e, "syncer flush failed");
                    do_flush = false;
                }
            }
            if stop.load(Ordering::Acquire) {
                return;
            }
        }

        std::thread::sleep(JIFFY);
    }
}
