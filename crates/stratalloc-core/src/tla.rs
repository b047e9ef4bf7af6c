//! Thread-local allocator: the per-thread structure routing every
//! allocation and free through the fast-arena and pool allocators over the
//! shared substrate.
//!
//! Field protocol. The structure is reached from three directions:
//!
//! - the owning thread (or the current adopter) goes through `inner`, the
//!   exclusively-owned bin tables and stashes;
//! - non-owning threads freeing memory touch only the retire roots and the
//!   atomic words inside control blocks;
//! - the graveyard protocol hands the whole structure between threads
//!   through its slot exchange, which serializes ownership.
//!
//! The structure is not relocatable: control blocks store its address in
//! their handle headers, so it is heap-allocated once and stays put until
//! torn down. The 4 KiB alignment keeps the address compatible with the
//! handle header's 12 tag bits.

#![allow(unsafe_code)]

use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use crate::arena::{ArenaAcquire, FastArena, FastArenaBins, RetiredArenas};
use crate::config::{AllocatorConfig, MAX_REGIONS};
use crate::handle::ChunkKind;
use crate::list::{list_erase, list_pop_head, list_push_head, ListEntry};
use crate::pool::{ChunkPool, PoolBins, PoolShard, RetiredPools, ShardPool};
use crate::region::{AllocParams, ChunkAllocation};
use crate::substrate::Substrate;
use crate::sync::free_list::NULL_LINK;
use crate::sync::retire::{RetireHead, GRAVEYARD, OWNER_ALIVE, ROOT};
use crate::sync::snatch_list::SnatchOps;
use crate::util::{align_up, pow2};

/// Recycled chunks stashed per region before going back to the shared
/// pools.
const RECYCLED_CAP: u32 = 4;

/// Graveyard linkage embedded in the allocator.
pub(crate) struct GraveyardEntry {
    next: Cell<*mut ()>,
    tail: Cell<*mut ()>,
}

/// Node ops the graveyard uses over parked thread allocators.
pub(crate) struct TlaGraveOps;

unsafe impl SnatchOps for TlaGraveOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ()) {
        (*(node as *mut ThreadLocalAllocator))
            .graveyard_entry
            .next
            .set(next);
    }

    unsafe fn get_next(&self, node: *mut ()) -> *mut () {
        (*(node as *mut ThreadLocalAllocator))
            .graveyard_entry
            .next
            .get()
    }

    unsafe fn set_tail(&self, batch: *mut (), tail: *mut ()) {
        (*(batch as *mut ThreadLocalAllocator))
            .graveyard_entry
            .tail
            .set(tail);
    }

    unsafe fn get_tail(&self, batch: *mut ()) -> *mut () {
        (*(batch as *mut ThreadLocalAllocator))
            .graveyard_entry
            .tail
            .get()
    }
}

/// Geometry snapshot the hot paths read without touching the config.
#[derive(Clone, Copy)]
struct TlaGeometry {
    min_alloc_size: u64,
    min_alloc_alignment: u64,
    fast_arena_max_alloc: u64,
    fast_arena_max_alignment: u64,
    min_arena_alignment: u64,
    /// Region whose chunks back fast arenas (and shard pools).
    arena_region: u32,
    arena_memory_size: u64,
    pool_region: u32,
    shard_size_log2: u32,
    control_block_log2: u32,
}

/// Owner-exclusive state.
struct TlaInner {
    arena_bins: FastArenaBins,
    pool_bins: PoolBins,
    recycled_heads: [u32; MAX_REGIONS],
    recycled_counts: [u32; MAX_REGIONS],
}

/// The per-thread allocator.
#[repr(align(4096))]
pub struct ThreadLocalAllocator {
    graveyard_entry: GraveyardEntry,
    /// Ownership-transition flags (`ROOT` | `OWNER_ALIVE` | `GRAVEYARD`);
    /// the payload stays null.
    status: RetireHead,
    retired_arenas: RetiredArenas,
    retired_pools: RetiredPools,
    inner: UnsafeCell<TlaInner>,
    substrate: Arc<Substrate>,
    geo: TlaGeometry,
}

// SAFETY: see the module-level field protocol; cross-thread access is
// limited to the retire roots, the status word and the graveyard entry,
// each guarded by its own protocol.
unsafe impl Send for ThreadLocalAllocator {}
unsafe impl Sync for ThreadLocalAllocator {}

impl ThreadLocalAllocator {
    pub(crate) fn new(substrate: Arc<Substrate>, config: &AllocatorConfig) -> Box<Self> {
        let arena_region = substrate
            .specs()
            .search_suitable_region(config.fast_arena_max_alloc_size())
            .expect("validated geometry always has a fitting region");
        let pool_region = substrate
            .specs()
            .search_suitable_region(pow2(config.pool_shard_size_log2))
            .expect("validated geometry always has a fitting region");
        let geo = TlaGeometry {
            min_alloc_size: config.min_alloc_size,
            min_alloc_alignment: config.min_alloc_alignment,
            fast_arena_max_alloc: config.fast_arena_max_alloc_size(),
            fast_arena_max_alignment: config.fast_arena_max_alignment(),
            min_arena_alignment: pow2(config.fast_arena_min_alignment_log2),
            arena_region,
            arena_memory_size: substrate.chunk_size(arena_region),
            pool_region,
            shard_size_log2: config.pool_shard_size_log2,
            control_block_log2: config.control_block_size.trailing_zeros(),
        };
        Box::new(Self {
            graveyard_entry: GraveyardEntry {
                next: Cell::new(std::ptr::null_mut()),
                tail: Cell::new(std::ptr::null_mut()),
            },
            status: RetireHead::new(ROOT | OWNER_ALIVE),
            retired_arenas: RetiredArenas::new(),
            retired_pools: RetiredPools::new(),
            inner: UnsafeCell::new(TlaInner {
                arena_bins: FastArenaBins::new(
                    config.fast_arena_min_alignment_log2,
                    config.fast_arena_max_alignment_log2,
                    config.fast_arena_min_step_size_log2,
                    config.fast_arena_max_step_size_log2,
                    config.fast_arena_num_splits_log2,
                ),
                pool_bins: PoolBins::new(config.min_chunk_pow2, config.max_chunk_pow2),
                recycled_heads: [NULL_LINK; MAX_REGIONS],
                recycled_counts: [0; MAX_REGIONS],
            }),
            substrate,
            geo,
        })
    }

    fn self_owner(&self) -> *const () {
        self as *const Self as *const ()
    }

    fn split_seed(&self) -> u32 {
        (self as *const Self as usize >> 12) as u32
    }

    fn alloc_params(&self) -> AllocParams {
        AllocParams {
            split_start: self.split_seed(),
            ..AllocParams::default()
        }
    }

    pub(crate) fn mark_parked(&self) {
        self.status.reset_flags(OWNER_ALIVE);
        self.status.set_flags(GRAVEYARD);
    }

    pub(crate) fn mark_adopted(&self) {
        self.status.reset_flags(GRAVEYARD);
        self.status.set_flags(OWNER_ALIVE);
    }

    /// # Safety
    /// Only the owning thread (or the exclusive adopter) may call this.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut TlaInner {
        &mut *self.inner.get()
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocates `size` bytes at `align`. Null means out of memory.
    ///
    /// # Safety
    /// Owner thread only (enforced by the public handle being `!Send`).
    pub(crate) unsafe fn allocate(&self, size: u64, align: u64) -> *mut u8 {
        let align = align.max(self.geo.min_alloc_alignment);
        if !align.is_power_of_two() {
            log::warn!("allocation alignment {align} is not a power of two");
            return std::ptr::null_mut();
        }
        let size = size.max(self.geo.min_alloc_size);
        let inner = self.inner();

        if align <= self.geo.fast_arena_max_alignment
            && align_up(size, align) <= self.geo.fast_arena_max_alloc
        {
            let ptr = self.arena_allocate(inner, size, align);
            if !ptr.is_null() {
                return ptr;
            }
            // Arena path dried up; the pool/raw paths may still have
            // backing in other regions.
        }
        if let Some(class) = inner.pool_bins.class_of(size, align) {
            let ptr = self.pool_allocate(inner, class);
            if !ptr.is_null() {
                return ptr;
            }
        }
        self.raw_allocate(inner, size, align)
    }

    unsafe fn arena_allocate(&self, inner: &mut TlaInner, size: u64, align: u64) -> *mut u8 {
        match inner.arena_bins.acquire_arena(size, align) {
            ArenaAcquire::Acquired(arena) => return inner.arena_bins.allocate(arena, size),
            ArenaAcquire::Unsupported => return std::ptr::null_mut(),
            ArenaAcquire::NoResource => {}
        }

        // Slow path: drain cross-thread frees first, an arena may have
        // reopened.
        self.reclaim_retired_arenas(inner);
        if let ArenaAcquire::Acquired(arena) = inner.arena_bins.acquire_arena(size, align) {
            return inner.arena_bins.allocate(arena, size);
        }

        let Some(chunk) = self.fresh_chunk(inner, self.geo.arena_region) else {
            log::debug!("fast-arena region exhausted");
            return std::ptr::null_mut();
        };
        let arena = FastArena::create(
            self.substrate.handle_ptr(chunk.handle),
            self.self_owner(),
            self.substrate.chunk_ptr(chunk.region, chunk.chunk),
            self.geo.arena_memory_size,
            align.max(self.geo.min_arena_alignment),
        );
        inner.arena_bins.allocate(arena, size)
    }

    unsafe fn pool_allocate(&self, inner: &mut TlaInner, class: usize) -> *mut u8 {
        let pool = match self.first_free_pool(inner, class) {
            Some(pool) => pool,
            None => {
                // Cross-thread frees may have reopened a pool.
                self.reclaim_retired_pools(inner);
                match self.first_free_pool(inner, class) {
                    Some(pool) => pool,
                    None => match self.new_chunk_pool(inner, class) {
                        Some(pool) => pool,
                        None => return std::ptr::null_mut(),
                    },
                }
            }
        };

        let chunk = (*pool).acquire();
        debug_assert!(!chunk.is_null(), "pool on the free list had no capacity");
        if (*pool).full() {
            let entry = &(*pool).list_entry as *const ListEntry as *mut ListEntry;
            list_erase(entry);
            let full_head =
                &inner.pool_bins.chunk_bin(class).full as *const ListEntry as *mut ListEntry;
            list_push_head(full_head, entry);
        }
        chunk
    }

    unsafe fn first_free_pool(&self, inner: &mut TlaInner, class: usize) -> Option<*mut ChunkPool> {
        let head = &inner.pool_bins.chunk_bin(class).free as *const ListEntry as *mut ListEntry;
        let entry = (*head).next_entry();
        if entry == head {
            return None;
        }
        Some(ChunkPool::from_list_entry(entry))
    }

    unsafe fn new_chunk_pool(&self, inner: &mut TlaInner, class: usize) -> Option<*mut ChunkPool> {
        let (shard_pool, shard) = self.acquire_shard(inner)?;
        let chunk_size = inner.pool_bins.chunk_size_of(class) as u32;
        let pool = ChunkPool::create(
            shard.handle,
            shard.memory,
            pow2(self.geo.shard_size_log2) as u32,
            chunk_size,
            chunk_size,
            shard_pool,
        );
        let free_head =
            &inner.pool_bins.chunk_bin(class).free as *const ListEntry as *mut ListEntry;
        list_push_head(free_head, &(*pool).list_entry as *const ListEntry as *mut ListEntry);
        Some(pool)
    }

    unsafe fn acquire_shard(
        &self,
        inner: &mut TlaInner,
    ) -> Option<(*mut ShardPool, PoolShard)> {
        let free_head =
            &inner.pool_bins.shard_pool_bin().free as *const ListEntry as *mut ListEntry;
        let entry = (*free_head).next_entry();
        let shard_pool = if entry != free_head {
            ShardPool::from_list_entry(entry)
        } else {
            let chunk = self.fresh_chunk(inner, self.geo.pool_region)?;
            let pool = ShardPool::create(
                self.substrate.handle_ptr(chunk.handle),
                self.self_owner(),
                self.substrate.chunk_ptr(chunk.region, chunk.chunk),
                self.substrate.chunk_size(chunk.region),
                self.geo.shard_size_log2,
                self.geo.control_block_log2,
            );
            list_push_head(
                free_head,
                &(*pool).list_entry as *const ListEntry as *mut ListEntry,
            );
            pool
        };

        let shard = (*shard_pool)
            .acquire()
            .expect("shard pool on the free list had no capacity");
        if (*shard_pool).full() {
            let entry = &(*shard_pool).list_entry as *const ListEntry as *mut ListEntry;
            list_erase(entry);
            let full_head =
                &inner.pool_bins.shard_pool_bin().full as *const ListEntry as *mut ListEntry;
            list_push_head(full_head, entry);
        }
        Some((shard_pool, shard))
    }

    unsafe fn raw_allocate(&self, inner: &mut TlaInner, size: u64, align: u64) -> *mut u8 {
        let needed = size.max(align);
        let Some(first_region) = self.substrate.search_suitable_region(needed) else {
            log::debug!("allocation of {size} bytes exceeds every region chunk");
            return std::ptr::null_mut();
        };
        for region in first_region..self.substrate.specs().num_regions() as u32 {
            if let Some(chunk) = self.fresh_chunk(inner, region) {
                self.substrate
                    .handle_header(chunk.handle)
                    .start_chunk_lifetime(self.self_owner(), ChunkKind::Raw);
                return self.substrate.chunk_ptr(chunk.region, chunk.chunk);
            }
        }
        log::debug!("all regions exhausted for a {size}-byte allocation");
        std::ptr::null_mut()
    }

    // -----------------------------------------------------------------
    // Deallocation
    // -----------------------------------------------------------------

    /// Frees `ptr` (an allocation of `size` bytes). Tolerates foreign and
    /// already-free pointers with a warning.
    ///
    /// # Safety
    /// Calling-thread rules as for [`Self::allocate`]; `ptr` must come
    /// from this allocator family.
    pub(crate) unsafe fn deallocate(&self, ptr: *mut u8, size: u64) {
        if ptr.is_null() {
            return;
        }
        if size == 0 {
            log::warn!("deallocation of zero size at {ptr:p} ignored");
            return;
        }
        let Some(allocation) = self.substrate.ptr_to_allocation(ptr) else {
            log::warn!("pointer {ptr:p} does not belong to any region");
            return;
        };
        let header = self.substrate.handle_header(allocation.handle);
        let (owner, kind) = header.owner();
        if kind == ChunkKind::Free {
            log::warn!("pointer {ptr:p} freed while its chunk is not allocated");
            return;
        }
        if owner == self.self_owner() {
            self.local_free(self.inner(), allocation, kind, ptr, size);
        } else {
            self.remote_free(owner, allocation, kind, ptr, size);
        }
    }

    unsafe fn local_free(
        &self,
        inner: &mut TlaInner,
        allocation: ChunkAllocation,
        kind: ChunkKind,
        ptr: *mut u8,
        size: u64,
    ) {
        match kind {
            ChunkKind::FastArena => {
                let arena = self.substrate.handle_ptr(allocation.handle) as *mut FastArena;
                if inner.arena_bins.deallocate(arena, ptr, size).is_some() {
                    self.recycle_chunk(inner, allocation);
                }
            }
            ChunkKind::ShardPool => {
                let shard_pool =
                    ShardPool::from_handle(self.substrate.handle_ptr(allocation.handle));
                let Some(pool) = (*shard_pool).pool_for_ptr(ptr) else {
                    log::warn!("pointer {ptr:p} lies in a shard pool's reserved area");
                    return;
                };
                self.pool_free(inner, shard_pool, pool, ptr, true);
            }
            ChunkKind::Raw => {
                self.substrate.deallocate_chunk(allocation);
            }
            ChunkKind::Free => unreachable!("checked by the caller"),
        }
    }

    unsafe fn remote_free(
        &self,
        owner: *const (),
        allocation: ChunkAllocation,
        kind: ChunkKind,
        ptr: *mut u8,
        size: u64,
    ) {
        // The owner allocator outlives every allocation it served, parked
        // or not.
        let owner_tla = &*(owner as *const ThreadLocalAllocator);
        match kind {
            ChunkKind::FastArena => {
                let arena = self.substrate.handle_ptr(allocation.handle) as *mut FastArena;
                owner_tla.retired_arenas.retire(arena, ptr, size);
            }
            ChunkKind::ShardPool => {
                let shard_pool =
                    ShardPool::from_handle(self.substrate.handle_ptr(allocation.handle));
                let Some(pool) = (*shard_pool).pool_for_ptr(ptr) else {
                    log::warn!("pointer {ptr:p} lies in a shard pool's reserved area");
                    return;
                };
                owner_tla.retired_pools.retire_chunk(pool, ptr);
            }
            ChunkKind::Raw => {
                // A dead raw chunk has a single releaser: this thread. The
                // push itself is lock-free, so no hand-off is needed.
                self.substrate.deallocate_chunk(allocation);
            }
            ChunkKind::Free => unreachable!("checked by the caller"),
        }
    }

    /// Releases one chunk back to a pool and maintains the pool's list
    /// membership. `cascade` lets an empty pool release its shard (and
    /// possibly its shard pool); the reclaim drain passes `false` and
    /// handles shard pools itself.
    unsafe fn pool_free(
        &self,
        inner: &mut TlaInner,
        shard_pool: *mut ShardPool,
        pool: *mut ChunkPool,
        ptr: *mut u8,
        cascade: bool,
    ) {
        if !(*pool).owns_chunk(ptr) {
            log::warn!("pointer {ptr:p} is not a chunk boundary of its pool");
            return;
        }
        let was_full = (*pool).full();
        (*pool).release(ptr);
        let class = inner
            .pool_bins
            .class_of((*pool).chunk_size() as u64, 1)
            .expect("live pool with an out-of-range chunk size");
        if was_full {
            let entry = &(*pool).list_entry as *const ListEntry as *mut ListEntry;
            list_erase(entry);
            let free_head =
                &inner.pool_bins.chunk_bin(class).free as *const ListEntry as *mut ListEntry;
            list_push_head(free_head, entry);
        }
        if (*pool).empty() {
            self.maybe_release_pool(inner, shard_pool, pool, class, cascade);
        }
    }

    /// Releases an empty pool's shard unless the pool is the only one with
    /// free capacity in its class (kept as hysteresis against thrash).
    unsafe fn maybe_release_pool(
        &self,
        inner: &mut TlaInner,
        shard_pool: *mut ShardPool,
        pool: *mut ChunkPool,
        class: usize,
        cascade: bool,
    ) {
        let free_head =
            &inner.pool_bins.chunk_bin(class).free as *const ListEntry as *mut ListEntry;
        if !has_second_entry(free_head) {
            return;
        }
        list_erase(&(*pool).list_entry as *const ListEntry as *mut ListEntry);
        let shard = (*shard_pool)
            .shard_for_ptr((*pool).memory())
            .expect("pool memory outside its shard pool");
        let was_full = (*shard_pool).full();
        (*shard_pool).release(shard);
        if was_full {
            let entry = &(*shard_pool).list_entry as *const ListEntry as *mut ListEntry;
            list_erase(entry);
            let free_head =
                &inner.pool_bins.shard_pool_bin().free as *const ListEntry as *mut ListEntry;
            list_push_head(free_head, entry);
        }
        if cascade && (*shard_pool).empty() {
            self.maybe_release_shard_pool(inner, shard_pool);
        }
    }

    /// Returns an empty shard pool's region chunk unless it is the only
    /// shard pool with free shards.
    unsafe fn maybe_release_shard_pool(&self, inner: &mut TlaInner, shard_pool: *mut ShardPool) {
        let free_head =
            &inner.pool_bins.shard_pool_bin().free as *const ListEntry as *mut ListEntry;
        if !has_second_entry(free_head) {
            return;
        }
        list_erase(&(*shard_pool).list_entry as *const ListEntry as *mut ListEntry);
        let allocation = self
            .substrate
            .ptr_to_allocation((*shard_pool).memory())
            .expect("shard pool memory outside every region");
        self.recycle_chunk(inner, allocation);
    }

    // -----------------------------------------------------------------
    // Retire/reclaim drains
    // -----------------------------------------------------------------

    /// Drains everything other threads have retired to this allocator.
    ///
    /// # Safety
    /// Owner thread (or exclusive adopter) only.
    pub(crate) unsafe fn reclaim_retired(&self) {
        let inner = self.inner();
        self.reclaim_retired_arenas(inner);
        self.reclaim_retired_pools(inner);
    }

    unsafe fn reclaim_retired_arenas(&self, inner: &mut TlaInner) {
        loop {
            let mut list = self.retired_arenas.reclaim();
            if list.is_empty() {
                return;
            }
            while let Some(arena) = list.pop() {
                (*arena).reclaim_allocations();
                if inner.arena_bins.take_if_resettable(arena).is_some() {
                    let allocation = self
                        .substrate
                        .ptr_to_allocation((*arena).base())
                        .expect("arena memory outside every region");
                    self.recycle_chunk(inner, allocation);
                }
            }
        }
    }

    unsafe fn reclaim_retired_pools(&self, inner: &mut TlaInner) {
        loop {
            let mut list = self.retired_pools.reclaim();
            if list.is_empty() {
                return;
            }
            while let Some(shard_pool) = list.pop() {
                loop {
                    let mut pool = (*shard_pool).reclaim_pools();
                    while !pool.is_null() {
                        let next =
                            (*pool).retire.next.replace(std::ptr::null_mut()) as *mut ChunkPool;
                        self.drain_pool(inner, shard_pool, pool);
                        pool = next;
                    }
                    if (*shard_pool).release_drained() {
                        break;
                    }
                }
                if (*shard_pool).empty() {
                    self.maybe_release_shard_pool(inner, shard_pool);
                }
            }
        }
    }

    /// Applies a retired pool's queued chunks and fixes its list
    /// membership. The shard pool is handled by the caller.
    unsafe fn drain_pool(
        &self,
        inner: &mut TlaInner,
        shard_pool: *mut ShardPool,
        pool: *mut ChunkPool,
    ) {
        let was_full = (*pool).full();
        (*pool).reclaim_chunks();
        let class = inner
            .pool_bins
            .class_of((*pool).chunk_size() as u64, 1)
            .expect("live pool with an out-of-range chunk size");
        if was_full && !(*pool).full() {
            let entry = &(*pool).list_entry as *const ListEntry as *mut ListEntry;
            list_erase(entry);
            let free_head =
                &inner.pool_bins.chunk_bin(class).free as *const ListEntry as *mut ListEntry;
            list_push_head(free_head, entry);
        }
        if (*pool).empty() {
            self.maybe_release_pool(inner, shard_pool, pool, class, false);
        }
    }

    // -----------------------------------------------------------------
    // Backing chunks
    // -----------------------------------------------------------------

    unsafe fn fresh_chunk(&self, inner: &mut TlaInner, region: u32) -> Option<ChunkAllocation> {
        let r = region as usize;
        let head = inner.recycled_heads[r];
        if head != NULL_LINK {
            let header = self.substrate.handle_header(head);
            inner.recycled_heads[r] = header.next_link();
            inner.recycled_counts[r] -= 1;
            let spec = *self.substrate.specs().region(region);
            let split = self
                .substrate
                .pools()
                .search_pool_split(region, head)
                .expect("stashed handle outside every shard");
            return Some(ChunkAllocation {
                region,
                chunk: head - spec.handle_offset,
                handle: head,
                split,
            });
        }
        self.substrate.allocate_chunk(region, self.alloc_params())
    }

    unsafe fn recycle_chunk(&self, inner: &mut TlaInner, allocation: ChunkAllocation) {
        let r = allocation.region as usize;
        if inner.recycled_counts[r] < RECYCLED_CAP {
            self.substrate
                .handle_header(allocation.handle)
                .set_next_link(inner.recycled_heads[r]);
            inner.recycled_heads[r] = allocation.handle;
            inner.recycled_counts[r] += 1;
        } else {
            self.substrate.deallocate_chunk(allocation);
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// True when no live allocation and no pending retired work remains
    /// anywhere in this allocator.
    ///
    /// # Safety
    /// Owner thread (or exclusive adopter) only.
    pub(crate) unsafe fn is_idle(&self) -> bool {
        if self.retired_arenas.has_pending() || self.retired_pools.has_pending() {
            return false;
        }
        let inner = self.inner();
        let mut live = false;
        inner.arena_bins.for_each_arena(|arena| {
            // SAFETY: arenas in the table are live.
            live |= unsafe { !(*arena).resettable() };
        });
        if live {
            return false;
        }
        for class in 0..inner.pool_bins.num_classes() {
            let bin = inner.pool_bins.chunk_bin(class);
            for head in [&bin.free, &bin.full] {
                let head_ptr = head as *const ListEntry as *mut ListEntry;
                let mut cursor = (*head_ptr).next_entry();
                while cursor != head_ptr {
                    if (*ChunkPool::from_list_entry(cursor)).count() > 0 {
                        return false;
                    }
                    cursor = (*cursor).next_entry();
                }
            }
        }
        true
    }

    /// Returns every chunk held by this allocator to the substrate. Must
    /// only run on an idle allocator.
    ///
    /// # Safety
    /// Exclusive access required; nothing may use the allocator after.
    pub(crate) unsafe fn teardown(&self) {
        debug_assert!(self.is_idle());
        let inner = self.inner();

        let substrate = &self.substrate;
        inner.arena_bins.drain_arenas(|arena| {
            // SAFETY: drained arenas are live until their chunk returns.
            unsafe {
                debug_assert!((*arena).resettable());
                let allocation = substrate
                    .ptr_to_allocation((*arena).base())
                    .expect("arena memory outside every region");
                substrate.deallocate_chunk(allocation);
            }
        });

        // Chunk pools first (their shards go back to the shard pools),
        // then the shard pools' region chunks.
        for class in 0..inner.pool_bins.num_classes() {
            let bin = inner.pool_bins.chunk_bin(class);
            for head in [&bin.free, &bin.full] {
                let head_ptr = head as *const ListEntry as *mut ListEntry;
                loop {
                    let entry = list_pop_head(head_ptr);
                    if entry.is_null() {
                        break;
                    }
                    let pool = ChunkPool::from_list_entry(entry);
                    debug_assert!((*pool).empty());
                    let shard_pool = (*pool).shard_pool();
                    let shard = (*shard_pool)
                        .shard_for_ptr((*pool).memory())
                        .expect("pool memory outside its shard pool");
                    (*shard_pool).release(shard);
                }
            }
        }
        let shard_bin = inner.pool_bins.shard_pool_bin();
        for head in [&shard_bin.free, &shard_bin.full] {
            let head_ptr = head as *const ListEntry as *mut ListEntry;
            loop {
                let entry = list_pop_head(head_ptr);
                if entry.is_null() {
                    break;
                }
                let shard_pool = ShardPool::from_list_entry(entry);
                debug_assert!((*shard_pool).empty());
                let allocation = substrate
                    .ptr_to_allocation((*shard_pool).memory())
                    .expect("shard pool memory outside every region");
                substrate.deallocate_chunk(allocation);
            }
        }

        for region in 0..MAX_REGIONS {
            let mut head = inner.recycled_heads[region];
            while head != NULL_LINK {
                let next = substrate.handle_header(head).next_link();
                let spec = *substrate.specs().region(region as u32);
                let split = substrate
                    .pools()
                    .search_pool_split(region as u32, head)
                    .expect("stashed handle outside every shard");
                substrate.deallocate_chunk(ChunkAllocation {
                    region: region as u32,
                    chunk: head - spec.handle_offset,
                    handle: head,
                    split,
                });
                head = next;
            }
            inner.recycled_heads[region] = NULL_LINK;
            inner.recycled_counts[region] = 0;
        }
    }
}

/// True when the list holds at least two entries.
unsafe fn has_second_entry(head: *mut ListEntry) -> bool {
    let first = (*head).next_entry();
    first != head && (*first).next_entry() != head
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AllocatorConfig {
        AllocatorConfig {
            // Two 8 MiB regions with 1 and 2 MiB chunks: small enough for
            // tests, large enough for every sub-allocator geometry.
            region_sizes_log2: vec![23, 23],
            region_chunk_sizes_log2: vec![20, 21],
            ..AllocatorConfig::default()
        }
    }

    fn make_tla() -> (Arc<Substrate>, Box<ThreadLocalAllocator>) {
        let config = test_config();
        config.validate().unwrap();
        let substrate = Arc::new(Substrate::reserve(&config).unwrap());
        let tla = ThreadLocalAllocator::new(substrate.clone(), &config);
        (substrate, tla)
    }

    #[test]
    fn test_small_alloc_free_roundtrip() {
        let (_substrate, tla) = make_tla();
        unsafe {
            let ptr = tla.allocate(100, 16);
            assert!(!ptr.is_null());
            ptr.write_bytes(0x11, 100);
            tla.deallocate(ptr, 100);
        }
    }

    #[test]
    fn test_alignment_honored_across_paths() {
        let (_substrate, tla) = make_tla();
        unsafe {
            for (size, align) in [
                (24u64, 16u64),
                (100, 64),
                (4096, 1024),
                (100, 4096),     // beyond arena alignment -> pool path
                (300_000, 64),   // beyond pool classes -> raw path
            ] {
                let ptr = tla.allocate(size, align);
                assert!(!ptr.is_null(), "allocate({size}, {align}) failed");
                assert_eq!(ptr as u64 % align, 0, "({size}, {align}) misaligned");
                ptr.write_bytes(0x22, size as usize);
                tla.deallocate(ptr, size);
            }
        }
    }

    #[test]
    fn test_arena_reuse_same_chunk() {
        let (_substrate, tla) = make_tla();
        unsafe {
            let a = tla.allocate(64, 16);
            let b = tla.allocate(64, 16);
            // Consecutive small allocations come from the same arena.
            assert_eq!(
                (a as u64) & !((1 << 20) - 1),
                (b as u64) & !((1 << 20) - 1)
            );
            tla.deallocate(a, 64);
            tla.deallocate(b, 64);
        }
    }

    #[test]
    fn test_pool_path_recycles_chunks() {
        let (_substrate, tla) = make_tla();
        unsafe {
            // 32 KiB with a 32 KiB alignment forces the pool path (the
            // arena path caps at 2 KiB alignment).
            let first = tla.allocate(32768, 32768);
            assert!(!first.is_null());
            let second = tla.allocate(32768, 32768);
            assert!(!second.is_null());
            assert_ne!(first, second);
            tla.deallocate(first, 32768);
            let third = tla.allocate(32768, 32768);
            assert_eq!(third, first, "freed pool chunk must recirculate");
            tla.deallocate(second, 32768);
            tla.deallocate(third, 32768);
        }
    }

    #[test]
    fn test_raw_path_uses_region_chunks() {
        let (substrate, tla) = make_tla();
        unsafe {
            let size = 600_000u64; // above max chunk class (256 KiB)
            let ptr = tla.allocate(size, 64);
            assert!(!ptr.is_null());
            let allocation = substrate.ptr_to_allocation(ptr).unwrap();
            assert_eq!(
                substrate.handle_header(allocation.handle).owner().1,
                ChunkKind::Raw
            );
            tla.deallocate(ptr, size);
            // The chunk is free (or stashed) again.
            let (_, kind) = substrate.handle_header(allocation.handle).owner();
            assert_eq!(kind, ChunkKind::Free);
        }
    }

    #[test]
    fn test_foreign_and_double_free_tolerated() {
        let (_substrate, tla) = make_tla();
        unsafe {
            let mut local = [0u8; 64];
            tla.deallocate(local.as_mut_ptr(), 64); // not ours: ignored
            tla.deallocate(std::ptr::null_mut(), 64); // null: ignored

            let ptr = tla.allocate(300_000, 16); // raw path
            tla.deallocate(ptr, 300_000);
            tla.deallocate(ptr, 300_000); // double free: warned, ignored
        }
    }

    #[test]
    fn test_idle_and_teardown() {
        let (_substrate, tla) = make_tla();
        unsafe {
            let a = tla.allocate(128, 16);
            let b = tla.allocate(40_000, 64);
            assert!(!tla.is_idle());
            tla.deallocate(a, 128);
            tla.deallocate(b, 40_000);
            assert!(tla.is_idle());
            tla.teardown();
        }
    }

    #[test]
    fn test_allocation_churn_deterministic_trace() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let (_substrate, tla) = make_tla();
        let mut live: Vec<(*mut u8, u64)> = Vec::new();
        let mut rng = 0x5EED_5EED_5EED_5EEDu64;

        unsafe {
            for _ in 0..4000 {
                let r = lcg(&mut rng);
                if r % 3 != 0 || live.is_empty() {
                    let size = (r >> 8) % 2000 + 1;
                    let align = 1u64 << (r >> 40) % 7; // 1..=64, clamped up by min
                    let ptr = tla.allocate(size, align);
                    assert!(!ptr.is_null());
                    // Touch first and last byte.
                    ptr.write(1);
                    ptr.add(size as usize - 1).write(2);
                    live.push((ptr, size));
                } else {
                    let idx = (r as usize) % live.len();
                    let (ptr, size) = live.swap_remove(idx);
                    tla.deallocate(ptr, size);
                }
            }
            for (ptr, size) in live.drain(..) {
                tla.deallocate(ptr, size);
            }
            assert!(tla.is_idle());
            tla.teardown();
        }
    }
}
