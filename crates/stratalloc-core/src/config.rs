//! Allocator configuration and its validation.
//!
//! All geometry is fixed at construction: the region layout, contention
//! sharding, fast-arena bin table shape and pool size classes. Invalid
//! combinations are rejected with [`ConfigError`]; nothing is clamped
//! silently.

use crate::error::ConfigError;
use crate::util::{is_alignment, pow2};

/// Hard cap on the number of regions.
pub const MAX_REGIONS: usize = 8;
/// Hard cap on contention shards per region pool.
pub const MAX_CONTENTION_SPLIT: usize = 16;
/// Hard cap on graveyard direct slots.
pub const MAX_GRAVEYARD_SLOTS: usize = 64;
/// Hard cap on fast-arena alignment classes (bin table rows).
pub const MAX_ARENA_ALIGNMENTS: usize = 8;
/// Hard cap on fast-arena step classes (including the zero step).
pub const MAX_ARENA_STEPS: usize = 8;
/// Hard cap on splits per step.
pub const MAX_ARENA_SPLITS: usize = 128;
/// Hard cap on chunk-pool size classes.
pub const MAX_CHUNK_CLASSES: usize = 16;

/// Allocator-wide configuration. `Default` mirrors the original build
/// defaults: six 64 GiB regions with 2 to 64 MiB chunks over a single
/// reserved range.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Padding/alignment target for contended fields.
    pub cacheline_size: u64,
    /// Size of each fixed metadata control block (region-chunk handle,
    /// shard handle). Power of two, at least `2 * cacheline_size`.
    pub control_block_size: u64,
    /// Log2 byte size of each region.
    pub region_sizes_log2: Vec<u32>,
    /// Log2 chunk size per region; unique and ascending.
    pub region_chunk_sizes_log2: Vec<u32>,
    /// Contention shards per region pool (power of two, ≤16).
    pub contention_split: u32,
    /// Floor on any allocation size.
    pub min_alloc_size: u64,
    /// Floor on any allocation alignment.
    pub min_alloc_alignment: u64,
    /// Number of direct graveyard slots.
    pub graveyard_slot_count: u32,
    /// Fast-arena bin table geometry.
    pub fast_arena_min_alignment_log2: u32,
    pub fast_arena_max_alignment_log2: u32,
    pub fast_arena_min_step_size_log2: u32,
    pub fast_arena_max_step_size_log2: u32,
    pub fast_arena_num_splits_log2: u32,
    /// Pool allocator geometry.
    pub pool_shard_size_log2: u32,
    pub min_chunk_pow2: u32,
    pub max_chunk_pow2: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            cacheline_size: 64,
            control_block_size: 128,
            region_sizes_log2: vec![36, 36, 36, 36, 36, 36],
            region_chunk_sizes_log2: vec![21, 22, 23, 24, 25, 26],
            contention_split: 2,
            min_alloc_size: 16,
            min_alloc_alignment: 16,
            graveyard_slot_count: 16,
            fast_arena_min_alignment_log2: 4,
            fast_arena_max_alignment_log2: 11,
            fast_arena_min_step_size_log2: 9,
            fast_arena_max_step_size_log2: 15,
            fast_arena_num_splits_log2: 5,
            pool_shard_size_log2: 18,
            min_chunk_pow2: 12,
            max_chunk_pow2: 18,
        }
    }
}

impl AllocatorConfig {
    /// Log2 of the smallest region chunk size (the chunk sizes are
    /// ascending, so this is the first entry).
    pub fn min_region_chunk_log2(&self) -> u32 {
        self.region_chunk_sizes_log2[0]
    }

    /// Largest allocation the fast-arena path serves.
    pub fn fast_arena_max_alloc_size(&self) -> u64 {
        pow2(self.fast_arena_max_step_size_log2 + 1)
    }

    /// Smallest allocation the fast-arena bin math can place.
    pub fn fast_arena_min_alloc_size(&self) -> u64 {
        pow2(self.fast_arena_min_step_size_log2 - self.fast_arena_num_splits_log2)
    }

    /// Largest alignment the fast-arena path serves.
    pub fn fast_arena_max_alignment(&self) -> u64 {
        pow2(self.fast_arena_max_alignment_log2)
    }

    /// Number of chunk-pool size classes.
    pub fn num_chunk_classes(&self) -> usize {
        (self.max_chunk_pow2 - self.min_chunk_pow2 + 1) as usize
    }

    /// Validates every geometry invariant. Called once by the allocator
    /// constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let num_regions = self.region_sizes_log2.len();
        if num_regions == 0 || num_regions > MAX_REGIONS {
            return Err(ConfigError::InvalidRegionCount(num_regions));
        }
        if self.region_chunk_sizes_log2.len() != num_regions {
            return Err(ConfigError::RegionChunkCountMismatch {
                regions: num_regions,
                chunks: self.region_chunk_sizes_log2.len(),
            });
        }
        for &size in &self.region_sizes_log2 {
            if size > 40 {
                return Err(ConfigError::RegionSizeTooLarge(size));
            }
        }
        for window in self.region_chunk_sizes_log2.windows(2) {
            if window[0] >= window[1] {
                return Err(ConfigError::ChunkSizesNotAscending);
            }
        }
        for (&chunk, &region) in self
            .region_chunk_sizes_log2
            .iter()
            .zip(&self.region_sizes_log2)
        {
            if chunk > region {
                return Err(ConfigError::ChunkLargerThanRegion { chunk, region });
            }
        }
        if !self.contention_split.is_power_of_two()
            || self.contention_split as usize > MAX_CONTENTION_SPLIT
        {
            return Err(ConfigError::InvalidContentionSplit(self.contention_split));
        }
        if !is_alignment(self.cacheline_size) || self.cacheline_size < 32 {
            return Err(ConfigError::InvalidCacheline(self.cacheline_size));
        }
        if !is_alignment(self.control_block_size)
            || self.control_block_size < 2 * self.cacheline_size
        {
            return Err(ConfigError::InvalidControlBlock(self.control_block_size));
        }
        if !is_alignment(self.min_alloc_size)
            || self.min_alloc_size < 16
            || !is_alignment(self.min_alloc_alignment)
            || self.min_alloc_alignment < 16
        {
            return Err(ConfigError::InvalidMinAlloc);
        }
        if !self.graveyard_slot_count.is_power_of_two()
            || self.graveyard_slot_count as usize > MAX_GRAVEYARD_SLOTS
        {
            return Err(ConfigError::InvalidGraveyardSlots(self.graveyard_slot_count));
        }

        // Fast-arena bin table geometry.
        if self.fast_arena_min_alignment_log2 > self.fast_arena_max_alignment_log2 {
            return Err(ConfigError::InvalidArenaGeometry(
                "min alignment exceeds max alignment",
            ));
        }
        let num_alignments =
            self.fast_arena_max_alignment_log2 - self.fast_arena_min_alignment_log2 + 1;
        if num_alignments as usize > MAX_ARENA_ALIGNMENTS {
            return Err(ConfigError::InvalidArenaGeometry("too many alignment classes"));
        }
        if self.fast_arena_max_alignment_log2 > self.min_region_chunk_log2() {
            return Err(ConfigError::InvalidArenaGeometry(
                "max alignment exceeds the smallest region chunk",
            ));
        }
        if self.fast_arena_min_step_size_log2 > self.fast_arena_max_step_size_log2 {
            return Err(ConfigError::InvalidArenaGeometry("min step exceeds max step"));
        }
        let num_steps =
            self.fast_arena_max_step_size_log2 - self.fast_arena_min_step_size_log2 + 2;
        if num_steps as usize > MAX_ARENA_STEPS {
            return Err(ConfigError::InvalidArenaGeometry("too many step classes"));
        }
        if self.fast_arena_num_splits_log2 as usize > MAX_ARENA_SPLITS.trailing_zeros() as usize {
            return Err(ConfigError::InvalidArenaGeometry("too many splits"));
        }
        if self.fast_arena_num_splits_log2 > self.fast_arena_min_step_size_log2 {
            return Err(ConfigError::InvalidArenaGeometry(
                "splits outnumber the bytes of the smallest step",
            ));
        }
        if self.fast_arena_max_step_size_log2 + 1 > self.min_region_chunk_log2() {
            return Err(ConfigError::InvalidArenaGeometry(
                "max arena allocation exceeds the smallest region chunk",
            ));
        }

        // Pool geometry.
        if self.min_chunk_pow2 > self.max_chunk_pow2 {
            return Err(ConfigError::InvalidPoolGeometry("min chunk exceeds max chunk"));
        }
        if self.min_chunk_pow2 < 4 {
            return Err(ConfigError::InvalidPoolGeometry("chunk smaller than 16 bytes"));
        }
        if self.max_chunk_pow2 > self.pool_shard_size_log2 {
            return Err(ConfigError::InvalidPoolGeometry("max chunk exceeds the shard"));
        }
        // Strictly smaller: the leading shard of a pool's chunk is
        // reserved for the shard-handle array, so at least one more shard
        // must fit.
        if self.pool_shard_size_log2 >= self.min_region_chunk_log2() {
            return Err(ConfigError::InvalidPoolGeometry(
                "shard must be smaller than the smallest region chunk",
            ));
        }
        if self.num_chunk_classes() > MAX_CHUNK_CLASSES {
            return Err(ConfigError::InvalidPoolGeometry("too many chunk classes"));
        }
        if pow2(self.pool_shard_size_log2) < self.control_block_size {
            return Err(ConfigError::InvalidPoolGeometry("shard below a control block"));
        }
        Ok(())
    }
}
