//! Region-chunk allocation over the shared substrate.
//!
//! Chunks circulate through the per-shard versioned free lists; handles
//! that have never been issued come off the shard's bump stack. A chunk
//! freshly issued by the bump stack has never been committed, so the
//! allocator commits it before handing it out (recirculated chunks stay
//! committed; nothing is ever decommitted).

#![allow(unsafe_code)]

use crate::backoff::ExpBackoff;
use crate::handle::HandleHeader;
use crate::sync::free_list::{LinkOps, NULL_LINK, OP_FAILED};
use crate::vmem;

use super::pools::RegionPools;
use super::specs::RegionSpecs;

/// Shard-walk and retry parameters for [`RegionAllocator::allocate_chunk`].
#[derive(Debug, Clone, Copy)]
pub struct AllocParams {
    /// Outer retry rounds; negative means retry forever.
    pub rounds: i32,
    /// Bounded attempts per free-list operation; negative means unbounded.
    pub attempts: i32,
    /// First shard to try (callers derive this from a per-thread seed so
    /// threads spread across shards).
    pub split_start: u32,
    /// Shard step; must be odd so the walk covers every shard.
    pub split_step: u32,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            rounds: 4,
            attempts: 2,
            split_start: 0,
            split_step: 1,
        }
    }
}

/// A chunk handed out by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAllocation {
    pub region: u32,
    /// Chunk index within the region.
    pub chunk: u32,
    /// Global handle index.
    pub handle: u32,
    /// Shard the chunk came from (and returns to).
    pub split: u32,
}

enum ShardWalk {
    Allocated(ChunkAllocation),
    /// Every shard was empty.
    Exhausted,
    /// At least one shard failed on contention; worth retrying.
    Contended,
}

/// The substrate allocator: layout map + sharded pools + the two raw bases.
///
/// Shared by every thread; all mutable state is reached through atomics
/// (free-list heads, bump stacks, handle header words).
pub struct RegionAllocator {
    specs: RegionSpecs,
    pools: RegionPools,
    regions: *mut u8,
    handles: *mut u8,
    /// Commit fresh chunks on first issue (false when the backing memory
    /// is already committed, e.g. in tests over heap memory).
    commit_fresh: bool,
}

// SAFETY: `regions`/`handles` point into mappings owned by the enclosing
// allocator for the substrate's whole lifetime; every shared mutation goes
// through atomic words (pool heads, bump tops, handle headers).
unsafe impl Send for RegionAllocator {}
unsafe impl Sync for RegionAllocator {}

/// Free-list link adapter over the handle headers.
struct HandleLinkOps<'a> {
    alloc: &'a RegionAllocator,
}

impl LinkOps for HandleLinkOps<'_> {
    fn set_next(&self, node: u32, next: u32) {
        debug_assert!(node < self.alloc.specs.num_handles());
        self.alloc.handle_header(node).set_next_link(next);
    }

    fn get_next(&self, node: u32) -> u32 {
        debug_assert!(node < self.alloc.specs.num_handles());
        self.alloc.handle_header(node).next_link()
    }
}

impl RegionAllocator {
    /// # Safety
    /// `regions` must cover `specs.total_regions_size()` reserved bytes and
    /// `handles` must cover `specs.total_handles_size()` committed, zeroed
    /// bytes; both must outlive the allocator.
    pub unsafe fn new(
        specs: RegionSpecs,
        pools: RegionPools,
        regions: *mut u8,
        handles: *mut u8,
        commit_fresh: bool,
    ) -> Self {
        Self {
            specs,
            pools,
            regions,
            handles,
            commit_fresh,
        }
    }

    pub fn specs(&self) -> &RegionSpecs {
        &self.specs
    }

    pub fn pools(&self) -> &RegionPools {
        &self.pools
    }

    pub fn regions_base(&self) -> *mut u8 {
        self.regions
    }

    /// The handle's header word.
    pub fn handle_header(&self, handle: u32) -> &HandleHeader {
        debug_assert!(handle < self.specs.num_handles());
        // SAFETY: the handles area is committed and zero-initialized; a
        // zeroed HandleHeader is a valid (free) header.
        unsafe { &*(self.handle_ptr(handle) as *const HandleHeader) }
    }

    /// Raw pointer to the handle's control block.
    pub fn handle_ptr(&self, handle: u32) -> *mut u8 {
        debug_assert!(handle < self.specs.num_handles());
        // SAFETY: in-bounds offset within the handles area.
        unsafe {
            self.handles
                .add((handle as usize) << self.specs.handle_size_log2())
        }
    }

    /// Global handle index of a handle control-block pointer, if it lies
    /// in the handle area and is properly aligned.
    pub fn index_from_handle(&self, handle: *const u8) -> Option<u32> {
        let base = self.handles as usize;
        let addr = handle as usize;
        if addr < base || addr >= base + self.specs.total_handles_size() as usize {
            return None;
        }
        let offset = addr - base;
        if offset & (self.specs.handle_size() as usize - 1) != 0 {
            return None;
        }
        Some((offset >> self.specs.handle_size_log2()) as u32)
    }

    /// Raw pointer to a chunk's memory.
    pub fn chunk_ptr(&self, region: u32, chunk: u32) -> *mut u8 {
        let spec = self.specs.region(region);
        debug_assert!(chunk < spec.num_handles);
        // SAFETY: in-bounds offset within the regions area.
        unsafe {
            self.regions
                .add(spec.region_offset as usize + ((chunk as usize) << spec.chunk_size_log2))
        }
    }

    pub fn chunk_size(&self, region: u32) -> u64 {
        1u64 << self.specs.region(region).chunk_size_log2
    }

    /// True when `ptr` lies inside the regions area.
    pub fn belongs(&self, ptr: *const u8) -> bool {
        let base = self.regions as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.specs.total_regions_size() as usize
    }

    /// Decodes an arbitrary pointer into its chunk allocation, shard
    /// included. Returns `None` for pointers that are not ours.
    pub fn ptr_to_allocation(&self, ptr: *const u8) -> Option<ChunkAllocation> {
        if !self.belongs(ptr) {
            return None;
        }
        let relptr = ptr as u64 - self.regions as u64;
        let location = self.specs.locate_chunk(relptr)?;
        let split = self
            .pools
            .search_pool_split(location.region, location.handle)
            .expect("handle outside every shard range");
        Some(ChunkAllocation {
            region: location.region,
            chunk: location.chunk,
            handle: location.handle,
            split,
        })
    }

    /// Smallest region whose chunks fit `size`.
    pub fn search_suitable_region(&self, size: u64) -> Option<u32> {
        self.specs.search_suitable_region(size)
    }

    fn handle_to_chunk(&self, region: u32, handle: u32) -> u32 {
        let spec = self.specs.region(region);
        debug_assert!(
            handle >= spec.handle_offset && handle < spec.handle_offset + spec.num_handles,
            "handle does not belong to the region"
        );
        handle - spec.handle_offset
    }

    /// One pass over the region's shards: pop the free list, fall back to
    /// the bump stack, treat `OP_FAILED` as "try the next shard".
    fn walk_shards(&self, region: u32, params: &AllocParams) -> ShardWalk {
        let ops = HandleLinkOps { alloc: self };
        let mut contended = false;
        let mut split = self.pools.next_split(params.split_start, 0);
        for _ in 0..self.pools.contention_split() {
            let entry = self.pools.entry(region, split);

            let handle = entry.free_list.pop(params.attempts, &ops);
            if handle < OP_FAILED {
                return ShardWalk::Allocated(self.finish_allocation(region, handle, split, false));
            }
            if handle == OP_FAILED {
                contended = true;
            } else {
                // Free list empty: issue a never-circulated handle.
                let handle = entry.stack.bump();
                if handle < OP_FAILED {
                    return ShardWalk::Allocated(
                        self.finish_allocation(region, handle, split, true),
                    );
                }
            }
            split = self.pools.next_split(split, params.split_step);
        }
        if contended {
            ShardWalk::Contended
        } else {
            ShardWalk::Exhausted
        }
    }

    fn finish_allocation(&self, region: u32, handle: u32, split: u32, fresh: bool) -> ChunkAllocation {
        let chunk = self.handle_to_chunk(region, handle);
        if fresh && self.commit_fresh {
            let committed = vmem::commit(self.chunk_ptr(region, chunk), self.chunk_size(region) as usize);
            if !committed {
                log::warn!(
                    "chunk commit failed for region {region} chunk {chunk} (os error {})",
                    vmem::last_error()
                );
            }
        }
        ChunkAllocation {
            region,
            chunk,
            handle,
            split,
        }
    }

    /// Allocates one chunk from `region`, retrying `params.rounds` times
    /// with exponential backoff. `None` means the region is exhausted (or
    /// contention never resolved within the retry rounds).
    pub fn allocate_chunk(&self, region: u32, params: AllocParams) -> Option<ChunkAllocation> {
        if region as usize >= self.specs.num_regions() {
            return None;
        }
        let mut backoff = ExpBackoff::default();
        let mut rounds = params.rounds;
        while rounds != 0 {
            match self.walk_shards(region, &params) {
                ShardWalk::Allocated(allocation) => return Some(allocation),
                ShardWalk::Exhausted => {
                    if rounds > 0 {
                        rounds -= 1;
                    }
                }
                ShardWalk::Contended => {}
            }
            backoff.spin();
        }
        None
    }

    /// Returns a chunk to its shard's free list. The caller must be the
    /// single releasing owner of the chunk.
    pub fn deallocate_chunk(&self, allocation: ChunkAllocation) {
        debug_assert!((allocation.region as usize) < self.specs.num_regions());
        debug_assert!(allocation.split < self.pools.contention_split());
        let ops = HandleLinkOps { alloc: self };
        let entry = self.pools.entry(allocation.region, allocation.split);
        entry.free_list.push(allocation.handle, -1, &ops);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ChunkKind;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::HashSet;

    /// Substrate over plain heap memory: two 256 KiB regions of 64 KiB
    /// chunks, four handles per region.
    struct TestSubstrate {
        alloc: RegionAllocator,
        regions_layout: Layout,
        handles_layout: Layout,
        regions: *mut u8,
        handles: *mut u8,
    }

    impl TestSubstrate {
        fn new(contention_split: u32) -> Self {
            let specs = RegionSpecs::new(&[18, 18], &[16, 16], 128);
            let pools = RegionPools::new(&specs, contention_split);
            let regions_layout =
                Layout::from_size_align(specs.total_regions_size() as usize, 1 << 16).unwrap();
            let handles_layout =
                Layout::from_size_align(specs.total_handles_size() as usize, 128).unwrap();
            // SAFETY: both layouts are non-zero.
            let (regions, handles) =
                unsafe { (alloc_zeroed(regions_layout), alloc_zeroed(handles_layout)) };
            assert!(!regions.is_null() && !handles.is_null());
            // SAFETY: freshly allocated zeroed backing of the right sizes.
            let alloc = unsafe { RegionAllocator::new(specs, pools, regions, handles, false) };
            Self {
                alloc,
                regions_layout,
                handles_layout,
                regions,
                handles,
            }
        }
    }

    impl Drop for TestSubstrate {
        fn drop(&mut self) {
            // SAFETY: same layouts the memory was allocated with.
            unsafe {
                dealloc(self.regions, self.regions_layout);
                dealloc(self.handles, self.handles_layout);
            }
        }
    }

    #[test]
    fn test_allocate_drains_region_exactly() {
        let substrate = TestSubstrate::new(2);
        let alloc = &substrate.alloc;

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let allocation = alloc.allocate_chunk(0, AllocParams::default()).unwrap();
            assert_eq!(allocation.region, 0);
            assert!(seen.insert(allocation.handle), "handle issued twice");
        }
        assert!(alloc.allocate_chunk(0, AllocParams::default()).is_none());
        // Region 1 is untouched.
        assert!(alloc.allocate_chunk(1, AllocParams::default()).is_some());
    }

    #[test]
    fn test_deallocate_recirculates() {
        let substrate = TestSubstrate::new(1);
        let alloc = &substrate.alloc;

        let first = alloc.allocate_chunk(0, AllocParams::default()).unwrap();
        let rest: Vec<_> = (0..3)
            .map(|_| alloc.allocate_chunk(0, AllocParams::default()).unwrap())
            .collect();
        assert!(alloc.allocate_chunk(0, AllocParams::default()).is_none());

        alloc.deallocate_chunk(first);
        let again = alloc.allocate_chunk(0, AllocParams::default()).unwrap();
        assert_eq!(again.handle, first.handle);
        assert_eq!(again.split, first.split);
        drop(rest);
    }

    #[test]
    fn test_ptr_decode_roundtrip() {
        let substrate = TestSubstrate::new(2);
        let alloc = &substrate.alloc;

        let allocation = alloc.allocate_chunk(1, AllocParams::default()).unwrap();
        let chunk = alloc.chunk_ptr(allocation.region, allocation.chunk);
        // SAFETY: chunk points into the substrate's heap backing.
        let interior = unsafe { chunk.add(1000) };
        assert_eq!(alloc.ptr_to_allocation(chunk), Some(allocation));
        assert_eq!(alloc.ptr_to_allocation(interior), Some(allocation));
        assert!(alloc.ptr_to_allocation(std::ptr::null()).is_none());
        let outside = substrate.handles as *const u8;
        assert!(alloc.ptr_to_allocation(outside).is_none());
    }

    #[test]
    fn test_owner_install_and_clear() {
        let substrate = TestSubstrate::new(1);
        let alloc = &substrate.alloc;

        let allocation = alloc.allocate_chunk(0, AllocParams::default()).unwrap();
        let owner = 0x1000usize as *const ();
        alloc
            .handle_header(allocation.handle)
            .start_chunk_lifetime(owner, ChunkKind::Raw);
        let (seen, kind) = alloc.handle_header(allocation.handle).owner();
        assert_eq!(seen, owner);
        assert_eq!(kind, ChunkKind::Raw);

        // Returning the chunk overwrites the header with a link again.
        alloc.deallocate_chunk(allocation);
        let (_, kind) = alloc.handle_header(allocation.handle).owner();
        assert_eq!(kind, ChunkKind::Free);
    }

    #[test]
    fn test_split_start_spreads_shards() {
        let substrate = TestSubstrate::new(2);
        let alloc = &substrate.alloc;
        let a = alloc
            .allocate_chunk(
                0,
                AllocParams {
                    split_start: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        let b = alloc
            .allocate_chunk(
                0,
                AllocParams {
                    split_start: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(a.split, 0);
        assert_eq!(b.split, 1);
    }

    #[test]
    fn test_index_from_handle() {
        let substrate = TestSubstrate::new(1);
        let alloc = &substrate.alloc;
        let ptr = alloc.handle_ptr(3);
        assert_eq!(alloc.index_from_handle(ptr), Some(3));
        // Misaligned interior pointer is rejected.
        // SAFETY: in-bounds offset.
        let interior = unsafe { ptr.add(1) };
        assert_eq!(alloc.index_from_handle(interior), None);
    }
}
