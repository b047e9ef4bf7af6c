//! Read-only region layout map.
//!
//! Built once at startup and never mutated: the per-region table, the two
//! sentinel arrays backing the linear-scan searches, and the totals. When
//! every region has the same byte size the decode collapses to a shift;
//! otherwise it is a ≤8-comparison sentinel scan.

use crate::config::MAX_REGIONS;
use crate::util::{align_up, pow2};

/// Layout of one region.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionSpec {
    /// Byte offset of the region start within the regions area.
    pub region_offset: u64,
    /// Byte size of the region.
    pub region_size: u64,
    /// Log2 of the region's chunk size.
    pub chunk_size_log2: u32,
    /// Index of the region's first handle.
    pub handle_offset: u32,
    /// Number of handles (chunks) in the region.
    pub num_handles: u32,
}

/// Decoded chunk coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Region number.
    pub region: u32,
    /// Chunk index within the region.
    pub chunk: u32,
    /// Global handle index.
    pub handle: u32,
}

/// The full layout map. Read-only after construction.
pub struct RegionSpecs {
    region_specs: [RegionSpec; MAX_REGIONS],
    /// `chunk_size_search_sentinels[i]` = chunk byte size of region `i`;
    /// ascending, so the first `size <= sentinel` hit is the smallest
    /// suitable region.
    chunk_size_search_sentinels: [u64; MAX_REGIONS],
    /// `region_search_sentinels[i]` = exclusive end offset of region `i`.
    region_search_sentinels: [u64; MAX_REGIONS],
    total_regions_size: u64,
    /// Region byte size when all regions are equal-sized, else 0.
    region_size: u64,
    region_size_log2: u32,
    num_regions: usize,
    handle_size: u64,
    handle_size_log2: u32,
    total_handles_size: u64,
    num_handles: u32,
}

impl RegionSpecs {
    /// Builds the map from validated configuration.
    ///
    /// Region offsets are aligned up to the region's own chunk size, so a
    /// chunk pointer is always aligned to its chunk size provided the
    /// regions base carries the largest chunk alignment.
    pub fn new(region_sizes_log2: &[u32], chunk_sizes_log2: &[u32], handle_size: u64) -> Self {
        assert!(!region_sizes_log2.is_empty() && region_sizes_log2.len() <= MAX_REGIONS);
        assert_eq!(region_sizes_log2.len(), chunk_sizes_log2.len());
        assert!(handle_size.is_power_of_two());

        let all_equal = region_sizes_log2.windows(2).all(|w| w[0] == w[1]);

        let mut specs = Self {
            region_specs: [RegionSpec::default(); MAX_REGIONS],
            chunk_size_search_sentinels: [0; MAX_REGIONS],
            region_search_sentinels: [0; MAX_REGIONS],
            total_regions_size: 0,
            region_size: if all_equal {
                pow2(region_sizes_log2[0])
            } else {
                0
            },
            region_size_log2: if all_equal { region_sizes_log2[0] } else { 0 },
            num_regions: region_sizes_log2.len(),
            handle_size,
            handle_size_log2: handle_size.trailing_zeros(),
            total_handles_size: 0,
            num_handles: 0,
        };

        let mut handle_offset: u32 = 0;
        let mut region_offset: u64 = 0;
        for (i, (&size_log2, &chunk_log2)) in
            region_sizes_log2.iter().zip(chunk_sizes_log2).enumerate()
        {
            let region_size = pow2(size_log2);
            region_offset = align_up(region_offset, pow2(chunk_log2));
            let num_handles = (region_size >> chunk_log2) as u32;

            specs.region_specs[i] = RegionSpec {
                region_offset,
                region_size,
                chunk_size_log2: chunk_log2,
                handle_offset,
                num_handles,
            };
            specs.chunk_size_search_sentinels[i] = pow2(chunk_log2);
            specs.region_search_sentinels[i] = region_offset + region_size;

            handle_offset += num_handles;
            region_offset += region_size;
        }

        specs.total_regions_size = region_offset;
        specs.num_handles = handle_offset;
        specs.total_handles_size = align_up(
            (handle_offset as u64) << specs.handle_size_log2,
            specs.handle_size,
        );
        specs
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    pub fn num_handles(&self) -> u32 {
        self.num_handles
    }

    pub fn total_regions_size(&self) -> u64 {
        self.total_regions_size
    }

    pub fn total_handles_size(&self) -> u64 {
        self.total_handles_size
    }

    pub fn handle_size_log2(&self) -> u32 {
        self.handle_size_log2
    }

    pub fn handle_size(&self) -> u64 {
        self.handle_size
    }

    pub fn region(&self, region: u32) -> &RegionSpec {
        &self.region_specs[region as usize]
    }

    /// True when the shift fast path applies.
    pub fn all_regions_equal_size(&self) -> bool {
        self.region_size != 0
    }

    /// Largest chunk alignment the regions base must carry.
    pub fn max_chunk_alignment(&self) -> u64 {
        self.region_specs[..self.num_regions]
            .iter()
            .map(|spec| pow2(spec.chunk_size_log2))
            .max()
            .unwrap_or(1)
    }

    /// Smallest region whose chunk size fits `size`, if any.
    pub fn search_suitable_region(&self, size: u64) -> Option<u32> {
        (0..self.num_regions)
            .find(|&i| size <= self.chunk_size_search_sentinels[i])
            .map(|i| i as u32)
    }

    /// Region containing the relative offset `relptr`, if any.
    pub fn search_hosting_region(&self, relptr: u64) -> Option<u32> {
        (0..self.num_regions)
            .find(|&i| relptr < self.region_search_sentinels[i])
            .map(|i| i as u32)
    }

    /// Decodes a relative offset into `(region, chunk, handle)`. Returns
    /// `None` for offsets past the regions area or inside an alignment gap
    /// between regions.
    pub fn locate_chunk(&self, relptr: u64) -> Option<ChunkLocation> {
        if relptr >= self.total_regions_size {
            return None;
        }
        let region = if self.all_regions_equal_size() {
            let region = (relptr >> self.region_size_log2) as u32;
            if region as usize >= self.num_regions {
                return None;
            }
            region
        } else {
            self.search_hosting_region(relptr)?
        };
        self.locate_chunk_in_region(relptr, region)
    }

    fn locate_chunk_in_region(&self, relptr: u64, region: u32) -> Option<ChunkLocation> {
        let spec = &self.region_specs[region as usize];
        if spec.num_handles == 0 || relptr < spec.region_offset {
            return None;
        }
        let rel_to_region = relptr - spec.region_offset;
        let chunk = (rel_to_region >> spec.chunk_size_log2) as u32;
        if chunk >= spec.num_handles {
            return None;
        }
        Some(ChunkLocation {
            region,
            chunk,
            handle: spec.handle_offset + chunk,
        })
    }
}
