//! pmbd — a Persistent Memory Block Device emulator.
//!
//! Presents reserved memory as one or more block devices simulating a
//! Persistent Memory tier: a protected write-back staging buffer batches
//! and coalesces writes in front of the PM window, and an emulation engine
//! pads access time and throttles bandwidth to match a slower target
//! medium. See `SPEC_FULL.md` for the full design.

pub mod arena;
pub mod buffer;
pub mod checksum;
pub mod config;
pub mod device;
pub mod emulate;
pub mod error;
pub mod logging;
pub mod pbi;
pub mod pmap;
pub mod protect;
pub mod registry;
pub mod sector;
pub mod stats;

pub use device::{BlockDevice, Device, FlushCapability, IoDirection, Request};
pub use error::{PmbdError, Result};
