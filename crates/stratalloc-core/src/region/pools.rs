//! Contention-sharded region-chunk pools.
//!
//! Each region's handle-index space is partitioned evenly across up to 16
//! shards; every shard owns a disjoint sub-range with its own versioned
//! free list and bump stack. The per-shard entries are cache-line padded
//! (they are the hottest contended words in the allocator) while the
//! reverse handle→shard sentinels live in a separate read-only array so
//! lookups never touch a contended line.

use crossbeam_utils::CachePadded;

use crate::sync::free_list::{BumpStack, VersionedHead};

use super::specs::RegionSpecs;

/// One shard: versioned free-list head plus the bump stack over the
/// shard's not-yet-issued handle range.
pub struct PoolEntry {
    pub free_list: VersionedHead,
    pub stack: BumpStack,
}

/// All shards of all regions, row-major `[region][split]`.
pub struct RegionPools {
    entries: Vec<CachePadded<PoolEntry>>,
    /// Exclusive last-handle sentinels, same shape as `entries`; read-only.
    split_search_sentinels: Vec<u32>,
    contention_split: u32,
}

impl RegionPools {
    pub fn new(specs: &RegionSpecs, contention_split: u32) -> Self {
        assert!(contention_split.is_power_of_two());
        let split = contention_split as usize;
        let mut entries = Vec::with_capacity(specs.num_regions() * split);
        let mut sentinels = Vec::with_capacity(specs.num_regions() * split);

        for region in 0..specs.num_regions() as u32 {
            let spec = specs.region(region);
            let per_split = spec.num_handles.div_ceil(contention_split);
            for shard in 0..contention_split {
                let first = spec.handle_offset + (per_split * shard).min(spec.num_handles);
                let last = spec.handle_offset + (per_split * (shard + 1)).min(spec.num_handles);
                entries.push(CachePadded::new(PoolEntry {
                    free_list: VersionedHead::new(),
                    stack: BumpStack::new(first, last),
                }));
                sentinels.push(last);
            }
        }
        Self {
            entries,
            split_search_sentinels: sentinels,
            contention_split,
        }
    }

    pub fn contention_split(&self) -> u32 {
        self.contention_split
    }

    pub fn entry(&self, region: u32, split: u32) -> &PoolEntry {
        &self.entries[(region * self.contention_split + split) as usize]
    }

    /// Advances `split` by `step` (odd, so every shard is visited) modulo
    /// the shard count.
    pub fn next_split(&self, split: u32, step: u32) -> u32 {
        debug_assert!(step == 0 || step % 2 == 1, "step must be odd");
        (split + step) & (self.contention_split - 1)
    }

    /// Reverse lookup: the shard owning `handle` within `region`.
    pub fn search_pool_split(&self, region: u32, handle: u32) -> Option<u32> {
        let base = (region * self.contention_split) as usize;
        (0..self.contention_split)
            .find(|&split| handle < self.split_search_sentinels[base + split as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::free_list::NULL_LINK;

    fn specs() -> RegionSpecs {
        // Two 1 MiB regions with 64 KiB chunks: 16 handles each.
        RegionSpecs::new(&[20, 20], &[16, 16], 128)
    }

    #[test]
    fn test_shards_partition_handle_space() {
        let specs = specs();
        let pools = RegionPools::new(&specs, 4);
        for region in 0..2u32 {
            let spec = specs.region(region);
            let mut covered = 0;
            for split in 0..4u32 {
                let entry = pools.entry(region, split);
                let first = entry.stack.top();
                let limit = entry.stack.limit();
                assert!(first >= spec.handle_offset);
                assert!(limit <= spec.handle_offset + spec.num_handles);
                covered += limit - first;
                assert_eq!(entry.free_list.link(), NULL_LINK);
            }
            assert_eq!(covered, spec.num_handles);
        }
    }

    #[test]
    fn test_search_pool_split_matches_ranges() {
        let specs = specs();
        let pools = RegionPools::new(&specs, 4);
        for region in 0..2u32 {
            let spec = specs.region(region);
            let per_split = spec.num_handles.div_ceil(4);
            for handle in spec.handle_offset..spec.handle_offset + spec.num_handles {
                let split = pools.search_pool_split(region, handle).unwrap();
                assert_eq!(split, (handle - spec.handle_offset) / per_split);
            }
        }
    }

    #[test]
    fn test_next_split_wraps_and_covers() {
        let specs = specs();
        let pools = RegionPools::new(&specs, 4);
        let mut seen = [false; 4];
        let mut split = pools.next_split(1, 0);
        for _ in 0..4 {
            seen[split as usize] = true;
            split = pools.next_split(split, 1);
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_single_shard() {
        let specs = specs();
        let pools = RegionPools::new(&specs, 1);
        let entry = pools.entry(1, 0);
        let spec = specs.region(1);
        assert_eq!(entry.stack.top(), spec.handle_offset);
        assert_eq!(entry.stack.limit(), spec.handle_offset + spec.num_handles);
        assert_eq!(pools.search_pool_split(1, spec.handle_offset), Some(0));
    }
}
