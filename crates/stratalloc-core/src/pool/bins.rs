//! Per-thread pool bins.
//!
//! One bin per power-of-two chunk class plus one bin for shard pools. Each
//! bin keeps two intrusive lists: pools with free capacity and pools with
//! none, so the allocation path never scans exhausted pools.

use crate::list::ListEntry;
use crate::util::pow2;

/// Free/full list pair.
pub struct PoolBin {
    pub free: ListEntry,
    pub full: ListEntry,
}

impl PoolBin {
    fn new() -> Self {
        Self {
            free: ListEntry::new(),
            full: ListEntry::new(),
        }
    }

    fn init(&self) {
        self.free.init_head();
        self.full.init_head();
    }
}

/// All pool bins of one thread allocator.
pub struct PoolBins {
    /// One bin per chunk class, `min_chunk_pow2`-based.
    chunk_bins: Box<[PoolBin]>,
    /// Shard pools (they all share one geometry).
    shard_pools: Box<PoolBin>,
    min_chunk_pow2: u32,
    max_chunk_pow2: u32,
}

impl PoolBins {
    pub fn new(min_chunk_pow2: u32, max_chunk_pow2: u32) -> Self {
        assert!(min_chunk_pow2 <= max_chunk_pow2);
        let num_classes = (max_chunk_pow2 - min_chunk_pow2 + 1) as usize;
        let chunk_bins: Box<[PoolBin]> = (0..num_classes).map(|_| PoolBin::new()).collect();
        let shard_pools = Box::new(PoolBin::new());
        // Heads self-link, so they are initialized at their final (boxed)
        // address.
        for bin in chunk_bins.iter() {
            bin.init();
        }
        shard_pools.init();
        Self {
            chunk_bins,
            shard_pools,
            min_chunk_pow2,
            max_chunk_pow2,
        }
    }

    /// Chunk class serving `size` bytes at `align`, or `None` when the
    /// request exceeds the largest class.
    pub fn class_of(&self, size: u64, align: u64) -> Option<usize> {
        let needed = size.max(align).max(1);
        let pow = ceil_log2(needed).max(self.min_chunk_pow2);
        if pow > self.max_chunk_pow2 {
            return None;
        }
        Some((pow - self.min_chunk_pow2) as usize)
    }

    pub fn num_classes(&self) -> usize {
        self.chunk_bins.len()
    }

    /// Chunk byte size of `class`.
    pub fn chunk_size_of(&self, class: usize) -> u64 {
        pow2(self.min_chunk_pow2 + class as u32)
    }

    pub fn chunk_bin(&self, class: usize) -> &PoolBin {
        &self.chunk_bins[class]
    }

    pub fn shard_pool_bin(&self) -> &PoolBin {
        &self.shard_pools
    }
}

fn ceil_log2(value: u64) -> u32 {
    value.next_power_of_two().trailing_zeros()
}
