//! Block-number types.
//!
//! Physical block numbers and buffer block numbers are distinct newtypes
//! rather than bare integer aliases of the sector type, so a `Pbn` and a
//! `Bbn` can never be added, compared, or indexed into the wrong array by
//! accident.

use std::fmt;

/// Sector size in bytes. Fixed per spec (non-goal: arbitrary sector sizes).
pub const SECTOR_SIZE: u64 = 512;

/// Physical block size in bytes. Fixed per spec.
pub const PHYSICAL_BLOCK_SIZE: u64 = 4096;

/// Number of sectors per physical block.
pub const SECTORS_PER_PB: u64 = PHYSICAL_BLOCK_SIZE / SECTOR_SIZE;

/// Sentinel `Bbn` meaning "this PBN is not currently buffered".
pub const BBN_NONE: u32 = u32::MAX;

/// A sector index (512-byte granularity), as addressed by the block layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u64);

/// A Physical Block Number: `sector / SECTORS_PER_PB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pbn(pub u64);

/// A Buffer Block Number: an index into a buffer's slot ring, or `BBN_NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bbn(pub u32);

impl Sector {
    #[inline]
    pub fn to_pbn(self) -> Pbn {
        Pbn(self.0 / SECTORS_PER_PB)
    }

    /// Offset of this sector within its physical block, in sectors.
    #[inline]
    pub fn offset_in_pb(self) -> u64 {
        self.0 % SECTORS_PER_PB
    }
}

impl Pbn {
    #[inline]
    pub fn first_sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_PB)
    }

    #[inline]
    pub fn byte_offset(self, physical_block_size: u64) -> u64 {
        self.0 * physical_block_size
    }
}

impl Bbn {
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == BBN_NONE
    }

    #[inline]
    pub fn none() -> Self {
        Bbn(BBN_NONE)
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pbn#{}", self.0)
    }
}

impl fmt::Display for Bbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "bbn#none")
        } else {
            write!(f, "bbn#{}", self.0)
        }
    }
}
