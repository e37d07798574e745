//! Tile ownership oracles

use crate::error::{Error, Result};
use std::fmt::Debug;

/// Maps a tile to the process and accelerator that own it
pub trait Distribution: Debug + Send + Sync {
    /// Rank owning tile `(i, j)`
    fn tile_rank(&self, i: usize, j: usize) -> usize;

    /// Accelerator index of tile `(i, j)` on its owning rank
    fn tile_device(&self, i: usize, j: usize) -> usize;

    /// Number of ranks in the process grid
    fn num_ranks(&self) -> usize;

    /// Accelerators per rank (zero when none are attached)
    fn num_devices(&self) -> usize;
}

/// 2-D block-cyclic distribution over a `p x q` column-major process grid
///
/// Devices are dealt out cyclically over the local tile rows, so consecutive
/// block-rows of one rank land on different accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCyclic {
    p: usize,
    q: usize,
    num_devices: usize,
}

impl BlockCyclic {
    /// Grid of `p x q` ranks, no accelerators
    pub fn new(p: usize, q: usize) -> Result<Self> {
        if p == 0 || q == 0 {
            return Err(Error::InvalidParameter(format!(
                "process grid must be non-empty, got {p}x{q}"
            )));
        }
        Ok(Self {
            p,
            q,
            num_devices: 0,
        })
    }

    /// Single process owning every tile
    pub fn single() -> Self {
        Self {
            p: 1,
            q: 1,
            num_devices: 0,
        }
    }

    /// Attach `num_devices` accelerators per rank
    pub fn with_devices(mut self, num_devices: usize) -> Self {
        self.num_devices = num_devices;
        self
    }

    pub fn grid(&self) -> (usize, usize) {
        (self.p, self.q)
    }
}

impl Distribution for BlockCyclic {
    #[inline]
    fn tile_rank(&self, i: usize, j: usize) -> usize {
        (i % self.p) + (j % self.q) * self.p
    }

    #[inline]
    fn tile_device(&self, i: usize, _j: usize) -> usize {
        if self.num_devices == 0 {
            0
        } else {
            (i / self.p) % self.num_devices
        }
    }

    fn num_ranks(&self) -> usize {
        self.p * self.q
    }

    fn num_devices(&self) -> usize {
        self.num_devices
    }
}
