//! DRAM staging buffer: the core of the protected write path (spec.md §4.1–§4.3).

mod flush;
mod group;
mod ring;
mod syncer;

pub use flush::{flush, FlushCaller};
pub use group::BufferGroup;
pub use ring::{Bbi, Buffer};
pub use syncer::Syncer;
