//! Per-thread fast-arena bin table.
//!
//! A 2-D structure: one row per supported alignment class, and per row a
//! flattened step×split axis of intrusive arena lists ordered by remaining
//! capacity. Steps are logarithmic from `min_step` to `max_step` plus a
//! zero step for sub-step remainders; each step is divided into
//! `2^num_splits_log2` linear splits. A split index saturates at
//! `num_splits`, which makes a completely full step coincide with the next
//! step's first split, so the flattened index is simply
//! `step * num_splits + split`.
//!
//! Two lookups exist on purpose:
//!
//! - the *arena* variant floors, placing an arena in the bin whose range
//!   contains its remaining capacity;
//! - the *size* variant first rounds the request up by one split width of
//!   its step, so every arena found in the returned bin **or later** is
//!   guaranteed to satisfy the request (at an exact bin boundary this is
//!   conservative by one bin).
//!
//! Arenas whose remaining capacity exceeds the last regular bin live on a
//! separate per-row big list. Bin 0 of each row holds arenas too small to
//! serve the row's minimum allocation; they are kept for recycling.
//!
//! A per-row bitmap mirrors which bins are non-empty, and each row keeps a
//! direct-hit `cached_arena` with a miss counter promoting a better arena
//! every fourth near-miss (or immediately at ≥2× the cached remainder).

#![allow(unsafe_code)]

use std::cell::Cell;

use crate::bitmap::Bitmap;
use crate::config::{MAX_ARENA_SPLITS, MAX_ARENA_STEPS};
use crate::list::{list_erase, list_pop_head, list_push_head, ListEntry};
use crate::util::{align_up, floor_log2, pow2};

use super::fast_arena::FastArena;

/// Flattened step×split capacity: `MAX_ARENA_STEPS - 1` full steps of
/// `MAX_ARENA_SPLITS` splits, plus the single terminal bin shared with the
/// max step's first split.
const STEP_SPLIT_CAPACITY: usize = (MAX_ARENA_STEPS - 1) * MAX_ARENA_SPLITS + 1;
const BITMAP_WORDS: usize = (STEP_SPLIT_CAPACITY + 63) / 64;

struct AlignmentRow {
    bins: [ListEntry; STEP_SPLIT_CAPACITY],
    present: Bitmap<BITMAP_WORDS>,
    /// Arenas with more remaining than the last regular bin covers.
    big: ListEntry,
    cached: Cell<*mut FastArena>,
    cache_misses: Cell<u64>,
}

/// Outcome of [`FastArenaBins::acquire_arena`].
pub enum ArenaAcquire {
    /// Arena detached from the table; caller must put it back via
    /// [`FastArenaBins::release_arena`] (or [`FastArenaBins::allocate`]).
    Acquired(*mut FastArena),
    /// Geometry can serve this request but no arena is available.
    NoResource,
    /// Size or alignment outside the table's geometry.
    Unsupported,
}

pub struct FastArenaBins {
    rows: Box<[AlignmentRow]>,
    num_splits_log2: u32,
    num_splits: u64,
    min_step_log2: u32,
    max_step_log2: u32,
    min_alignment_log2: u32,
    max_alignment_log2: u32,
    /// Number of regular (non-big) bins per row.
    num_step_splits: usize,
    min_alloc_size: u64,
    max_alloc_size: u64,
}

impl FastArenaBins {
    pub fn new(
        min_alignment_log2: u32,
        max_alignment_log2: u32,
        min_step_log2: u32,
        max_step_log2: u32,
        num_splits_log2: u32,
    ) -> Self {
        assert!(min_alignment_log2 <= max_alignment_log2);
        assert!(min_step_log2 <= max_step_log2);
        assert!(num_splits_log2 <= min_step_log2);
        let num_alignments = (max_alignment_log2 - min_alignment_log2 + 1) as usize;
        let num_steps = (max_step_log2 - min_step_log2 + 2) as usize; // + zero step
        assert!(num_steps <= MAX_ARENA_STEPS);
        let num_splits = pow2(num_splits_log2);
        assert!(num_splits as usize <= MAX_ARENA_SPLITS);
        let num_step_splits = (num_steps - 1) * num_splits as usize + 1;

        let rows: Vec<AlignmentRow> = (0..num_alignments)
            .map(|_| AlignmentRow {
                bins: std::array::from_fn(|_| ListEntry::new()),
                present: Bitmap::new(num_step_splits),
                big: ListEntry::new(),
                cached: Cell::new(std::ptr::null_mut()),
                cache_misses: Cell::new(0),
            })
            .collect();
        let rows = rows.into_boxed_slice();
        // Heads self-link, so they are initialized at their final address.
        for row in rows.iter() {
            for bin in row.bins.iter() {
                bin.init_head();
            }
            row.big.init_head();
        }

        Self {
            rows,
            num_splits_log2,
            num_splits,
            min_step_log2,
            max_step_log2,
            min_alignment_log2,
            max_alignment_log2,
            num_step_splits,
            min_alloc_size: pow2(min_step_log2 - num_splits_log2),
            max_alloc_size: pow2(max_step_log2 + 1),
        }
    }

    pub fn min_alloc_size(&self) -> u64 {
        self.min_alloc_size
    }

    pub fn max_alloc_size(&self) -> u64 {
        self.max_alloc_size
    }

    pub fn num_step_splits(&self) -> usize {
        self.num_step_splits
    }

    /// Row index for `alignment`; `None` when the alignment is beyond the
    /// table. Alignments below the minimum share row 0.
    pub fn locate_alignment(&self, alignment: u64) -> Option<usize> {
        debug_assert!(alignment.is_power_of_two());
        let alignment_log2 = floor_log2(alignment);
        if alignment_log2 > self.max_alignment_log2 {
            return None;
        }
        Some((alignment_log2.max(self.min_alignment_log2) - self.min_alignment_log2) as usize)
    }

    /// `(step_id, step_base, step_size_log2)` of `value`.
    fn step_of(&self, value: u64) -> (u64, u64, u32) {
        let size_log2 = floor_log2(value).min(self.max_step_log2);
        if size_log2 < self.min_step_log2 {
            (0, 0, self.min_step_log2)
        } else {
            (
                (size_log2 - self.min_step_log2 + 1) as u64,
                pow2(size_log2),
                size_log2,
            )
        }
    }

    /// Placement variant: the bin whose range contains `remaining`.
    /// May return `num_step_splits` or more, meaning the big list.
    pub fn locate_step_split_arena(&self, remaining: u64) -> usize {
        let (step, base, step_log2) = self.step_of(remaining);
        let split = (((remaining - base) << self.num_splits_log2) >> step_log2)
            .min(self.num_splits);
        (step * self.num_splits + split) as usize
    }

    /// Search variant: rounds the request up by one split width of its
    /// step so every arena in the returned bin or later can satisfy it.
    pub fn locate_step_split_size(&self, size: u64) -> usize {
        let (_, _, step_log2) = self.step_of(size);
        let split_width = pow2(step_log2 - self.num_splits_log2);
        self.locate_step_split_arena(size + split_width)
    }

    pub fn can_allocate(&self, size: u64) -> bool {
        size >= self.min_alloc_size && size <= self.max_alloc_size
    }

    fn row(&mut self, alignment_id: usize) -> &mut AlignmentRow {
        &mut self.rows[alignment_id]
    }

    fn acquire_cached(&mut self, size: u64, alignment_id: usize) -> *mut FastArena {
        let row = self.row(alignment_id);
        let cached = row.cached.get();
        if cached.is_null() {
            return std::ptr::null_mut();
        }
        // SAFETY: cached arenas are live control blocks owned by this table.
        if unsafe { (*cached).can_allocate(size) } {
            row.cached.set(std::ptr::null_mut());
            return cached;
        }
        std::ptr::null_mut()
    }

    fn acquire_from_bins(&mut self, size: u64, alignment_id: usize) -> *mut FastArena {
        let step_split = self.locate_step_split_size(size);
        if step_split >= self.num_step_splits {
            return std::ptr::null_mut(); // only a big arena can serve this
        }
        let row = self.row(alignment_id);
        let Some(bin_id) = row.present.get_first_set(step_split) else {
            return std::ptr::null_mut();
        };
        let head = &row.bins[bin_id] as *const ListEntry as *mut ListEntry;
        // SAFETY: bins only hold live arenas owned by this table; the
        // presence bit guarantees the list is non-empty.
        unsafe {
            let entry = list_pop_head(head);
            debug_assert!(!entry.is_null(), "presence bit set on an empty bin");
            if (*head).is_empty_head() {
                row.present.unset(bin_id);
            }
            let arena = FastArena::from_list_entry(entry);
            debug_assert!((*arena).can_allocate(size), "arena landed in a lesser bin");
            arena
        }
    }

    fn acquire_big(&mut self, size: u64, alignment_id: usize) -> *mut FastArena {
        let row = self.row(alignment_id);
        let head = &row.big as *const ListEntry as *mut ListEntry;
        // SAFETY: big list holds live arenas owned by this table.
        unsafe {
            let entry = list_pop_head(head);
            if entry.is_null() {
                return std::ptr::null_mut();
            }
            let arena = FastArena::from_list_entry(entry);
            // Big arenas exceed the last regular bin but not necessarily
            // the largest request; verify before handing it out.
            if (*arena).can_allocate(size) {
                arena
            } else {
                list_push_head(head, entry);
                std::ptr::null_mut()
            }
        }
    }

    /// Finds an arena able to serve `size` bytes at `alignment` and
    /// detaches it from the table.
    pub fn acquire_arena(&mut self, size: u64, alignment: u64) -> ArenaAcquire {
        let Some(alignment_id) = self.locate_alignment(alignment) else {
            return ArenaAcquire::Unsupported;
        };
        let size_aligned = align_up(size.max(self.min_alloc_size), alignment);
        if size_aligned > self.max_alloc_size {
            return ArenaAcquire::Unsupported;
        }

        let arena = self.acquire_cached(size_aligned, alignment_id);
        if !arena.is_null() {
            return ArenaAcquire::Acquired(arena);
        }
        let arena = self.acquire_from_bins(size_aligned, alignment_id);
        if !arena.is_null() {
            return ArenaAcquire::Acquired(arena);
        }
        let arena = self.acquire_big(size_aligned, alignment_id);
        if !arena.is_null() {
            return ArenaAcquire::Acquired(arena);
        }
        ArenaAcquire::NoResource
    }

    /// Cache admission: install when empty, promote at ≥2× remaining,
    /// force-promote every fourth near-miss. Returns the arena that still
    /// needs a bin (null when the new arena became the cache).
    fn try_update_cached(&mut self, arena: *mut FastArena, alignment_id: usize) -> *mut FastArena {
        let row = self.row(alignment_id);
        let cached = row.cached.get();
        if cached.is_null() {
            row.cached.set(arena);
            return std::ptr::null_mut();
        }
        // SAFETY: both arenas are live control blocks owned by this table.
        let (cached_remaining, new_remaining) =
            unsafe { ((*cached).remaining(), (*arena).remaining()) };
        if new_remaining >= 2 * cached_remaining {
            row.cache_misses.set(0);
            row.cached.set(arena);
            return cached;
        }
        if new_remaining > cached_remaining {
            let misses = row.cache_misses.get() + 1;
            if misses == 4 {
                row.cache_misses.set(0);
                row.cached.set(arena);
                return cached;
            }
            row.cache_misses.set(misses);
        }
        arena
    }

    fn put_into_bins(&mut self, arena: *mut FastArena, alignment_id: usize) {
        // SAFETY: arena is a live, detached control block.
        let remaining = unsafe { (*arena).remaining() };
        let step_split = self.locate_step_split_arena(remaining);
        let num_step_splits = self.num_step_splits;
        let row = self.row(alignment_id);
        unsafe {
            let entry = &(*arena).list_entry as *const ListEntry as *mut ListEntry;
            if step_split < num_step_splits {
                let head = &row.bins[step_split] as *const ListEntry as *mut ListEntry;
                list_push_head(head, entry);
                row.present.set(step_split);
            } else {
                let head = &row.big as *const ListEntry as *mut ListEntry;
                list_push_head(head, entry);
            }
        }
    }

    /// Returns a detached arena to the table (cache or bin).
    ///
    /// # Safety
    /// `arena` must be a live control block owned by this table's thread,
    /// not currently cached or on any list.
    pub unsafe fn release_arena(&mut self, arena: *mut FastArena) {
        debug_assert!(!arena.is_null());
        debug_assert!((*arena).list_entry.is_detached());
        let alignment_id = self
            .locate_alignment((*arena).alignment())
            .expect("arena alignment outside the table");
        let arena = self.try_update_cached(arena, alignment_id);
        if !arena.is_null() {
            self.put_into_bins(arena, alignment_id);
        }
    }

    /// Bump-allocates from a detached arena and puts it back.
    ///
    /// # Safety
    /// Same contract as [`Self::release_arena`]; the arena must have room
    /// for `size` (callers come from [`Self::acquire_arena`]).
    pub unsafe fn allocate(&mut self, arena: *mut FastArena, size: u64) -> *mut u8 {
        debug_assert!(size > 0);
        let allocated = (*arena).acquire(size);
        debug_assert!(!allocated.is_null(), "acquired arena had no room");
        self.release_arena(arena);
        allocated
    }

    /// Local free: accounts the bytes; when the arena becomes resettable
    /// it is detached from the table, reset, and returned so the caller
    /// can recycle its chunk.
    ///
    /// # Safety
    /// `arena` must be live and currently in the table (cached or binned);
    /// `ptr`/`size` must describe an allocation previously served by it.
    pub unsafe fn deallocate(
        &mut self,
        arena: *mut FastArena,
        ptr: *const u8,
        size: u64,
    ) -> Option<*mut FastArena> {
        debug_assert!(!arena.is_null());
        debug_assert!(size > 0);
        (*arena).release(ptr, size);
        self.take_if_resettable(arena)
    }

    /// Detaches and resets `arena` when all its bytes came back. Used by
    /// the local free path and by the reclaim drain.
    ///
    /// # Safety
    /// `arena` must be live and currently in the table (cached or binned).
    pub unsafe fn take_if_resettable(&mut self, arena: *mut FastArena) -> Option<*mut FastArena> {
        if !(*arena).resettable() {
            return None;
        }
        let alignment_id = self
            .locate_alignment((*arena).alignment())
            .expect("arena alignment outside the table");
        // `remaining` is untouched by frees, so the arena still sits in
        // the bin this recomputes.
        let remaining = (*arena).remaining();
        let step_split = self.locate_step_split_arena(remaining);
        let num_step_splits = self.num_step_splits;
        let row = self.row(alignment_id);
        if row.cached.get() == arena {
            row.cached.set(std::ptr::null_mut());
        } else {
            let entry = &(*arena).list_entry as *const ListEntry as *mut ListEntry;
            list_erase(entry);
            if step_split < num_step_splits && row.bins[step_split].is_empty_head() {
                row.present.unset(step_split);
            }
        }
        (*arena).reset();
        Some(arena)
    }

    /// Visits every arena in the table without detaching it.
    ///
    /// # Safety
    /// All arenas in the table must be live; `f` must not mutate the
    /// table.
    pub unsafe fn for_each_arena(&self, mut f: impl FnMut(*mut FastArena)) {
        for row in self.rows.iter() {
            let cached = row.cached.get();
            if !cached.is_null() {
                f(cached);
            }
            for head in row.bins.iter().chain(std::iter::once(&row.big)) {
                let head_ptr = head as *const ListEntry as *mut ListEntry;
                let mut cursor = (*head_ptr).next_entry();
                while cursor != head_ptr {
                    f(FastArena::from_list_entry(cursor));
                    cursor = (*cursor).next_entry();
                }
            }
        }
    }

    /// Detaches every arena from the table and hands it to `f`.
    ///
    /// # Safety
    /// All arenas in the table must be live; the table is empty after.
    pub unsafe fn drain_arenas(&mut self, mut f: impl FnMut(*mut FastArena)) {
        for row in self.rows.iter_mut() {
            let cached = row.cached.replace(std::ptr::null_mut());
            if !cached.is_null() {
                f(cached);
            }
            row.cache_misses.set(0);
            for head in row.bins.iter().chain(std::iter::once(&row.big)) {
                let head_ptr = head as *const ListEntry as *mut ListEntry;
                loop {
                    let entry = list_pop_head(head_ptr);
                    if entry.is_null() {
                        break;
                    }
                    f(FastArena::from_list_entry(entry));
                }
            }
            row.present.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing for a batch of standalone arenas.
    struct ArenaFarm {
        blocks: Vec<Box<[u8]>>,
        memories: Vec<Vec<u8>>,
    }

    impl ArenaFarm {
        fn new() -> Self {
            Self {
                blocks: Vec::new(),
                memories: Vec::new(),
            }
        }

        fn arena(&mut self, memory_size: u64, alignment: u64) -> *mut FastArena {
            let mut block = vec![0u8; 128].into_boxed_slice();
            let mut memory = vec![0u8; memory_size as usize + alignment as usize];
            let base = crate::util::align_up(memory.as_mut_ptr() as u64, alignment) as *mut u8;
            // SAFETY: block/memory are kept alive by the farm.
            let arena = unsafe {
                FastArena::create(
                    block.as_mut_ptr(),
                    0x8000usize as *const (),
                    base,
                    memory_size,
                    alignment,
                )
            };
            self.blocks.push(block);
            self.memories.push(memory);
            arena
        }
    }

    /// The geometry of scenario S2: splits 2^7, steps 2^9..2^15.
    fn s2_bins() -> FastArenaBins {
        FastArenaBins::new(6, 6, 9, 15, 7)
    }

    #[test]
    fn test_bin_placement_literals() {
        let bins = s2_bins();
        let num_step_splits = bins.num_step_splits();
        assert_eq!(num_step_splits, 7 * 128 + 1);

        // Max-step remaining lands in the last regular bin.
        assert_eq!(bins.locate_step_split_arena(1 << 15), num_step_splits - 1);
        // Half a split below lands one bin earlier.
        let half_split_below = (1 << 15) - (1 << 15) / 128 / 2;
        assert_eq!(
            bins.locate_step_split_arena(half_split_below),
            num_step_splits - 2
        );
        // The size variant rounds up past the boundary.
        assert_eq!(
            bins.locate_step_split_size(half_split_below),
            num_step_splits - 1
        );
    }

    #[test]
    fn test_zero_step_and_overflow() {
        let bins = s2_bins();
        // Sub-step remainders spread over the zero step's splits.
        assert_eq!(bins.locate_step_split_arena(0), 0);
        assert!(bins.locate_step_split_arena(100) < 128);
        // Remainders beyond the last regular bin signal the big list.
        assert!(bins.locate_step_split_arena((1 << 15) + 4096) >= bins.num_step_splits());
    }

    #[test]
    fn test_size_lookup_guarantees_fit() {
        let bins = s2_bins();
        // Every remainder that lands in the size-variant bin or later must
        // be able to serve the size.
        for size in [16u64, 100, 511, 512, 513, 1010, 4000, 32000] {
            let search_bin = bins.locate_step_split_size(size);
            if search_bin >= bins.num_step_splits() {
                continue;
            }
            let low = size.saturating_sub(4096);
            for remaining in low..size + 4096 {
                if bins.locate_step_split_arena(remaining) >= search_bin {
                    assert!(
                        remaining >= size,
                        "arena with {remaining} reachable from bin {search_bin} cannot serve {size}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_acquire_release_cycle() {
        let mut farm = ArenaFarm::new();
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);

        let arena = farm.arena(8192, 64);
        unsafe {
            bins.release_arena(arena);
            // First release lands in the cache, so acquire hits it.
            match bins.acquire_arena(128, 64) {
                ArenaAcquire::Acquired(found) => assert_eq!(found, arena),
                _ => panic!("expected the cached arena"),
            }
            // The cache is now empty and bins too.
            assert!(matches!(
                bins.acquire_arena(128, 64),
                ArenaAcquire::NoResource
            ));
            bins.release_arena(arena);
        }
    }

    #[test]
    fn test_unsupported_geometry() {
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);
        assert!(matches!(
            bins.acquire_arena(64, 1 << 12),
            ArenaAcquire::Unsupported
        ));
        assert!(matches!(
            bins.acquire_arena(1 << 17, 64),
            ArenaAcquire::Unsupported
        ));
    }

    #[test]
    fn test_cache_promotion_rules() {
        let mut farm = ArenaFarm::new();
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);

        let small = farm.arena(1024, 64);
        let double = farm.arena(4096, 64);
        unsafe {
            bins.release_arena(small);
            assert_eq!(bins.rows[2].cached.get(), small);
            // 4× the remaining promotes immediately; the old cache drops
            // into a bin.
            bins.release_arena(double);
            assert_eq!(bins.rows[2].cached.get(), double);
            assert!(bins.rows[2].present.count() > 0);
        }
    }

    #[test]
    fn test_cache_miss_counter_promotes_fourth() {
        let mut farm = ArenaFarm::new();
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);

        let base = farm.arena(2048, 64);
        unsafe {
            bins.release_arena(base);
            // Slightly larger arenas: misses 1..=3 go to bins, the fourth
            // promotes.
            let mut last = std::ptr::null_mut();
            for _ in 0..4 {
                let bigger = farm.arena(2048 + 1024, 64);
                bins.release_arena(bigger);
                last = bigger;
            }
            assert_eq!(bins.rows[2].cached.get(), last);
        }
    }

    #[test]
    fn test_deallocate_returns_resettable_arena() {
        let mut farm = ArenaFarm::new();
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);

        let arena = farm.arena(8192, 64);
        unsafe {
            bins.release_arena(arena);
            let ArenaAcquire::Acquired(found) = bins.acquire_arena(256, 64) else {
                panic!("no arena");
            };
            let ptr = bins.allocate(found, 256);
            assert!(!ptr.is_null());

            let recycled = bins.deallocate(found, ptr, 256);
            assert_eq!(recycled, Some(found));
            assert!((*found).empty());
            // The arena left the table entirely.
            assert!(matches!(
                bins.acquire_arena(256, 64),
                ArenaAcquire::NoResource
            ));
        }
    }

    #[test]
    fn test_deallocate_partial_keeps_arena_binned() {
        let mut farm = ArenaFarm::new();
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);

        let arena = farm.arena(8192, 64);
        unsafe {
            bins.release_arena(arena);
            let ArenaAcquire::Acquired(found) = bins.acquire_arena(256, 64) else {
                panic!("no arena");
            };
            let first = bins.allocate(found, 256);
            let ArenaAcquire::Acquired(found) = bins.acquire_arena(256, 64) else {
                panic!("no arena");
            };
            let second = bins.allocate(found, 256);

            assert!(bins.deallocate(arena, first, 256).is_none());
            assert_eq!(bins.deallocate(arena, second, 256), Some(arena));
        }
    }

    #[test]
    fn test_present_bitmap_tracks_lists() {
        let mut farm = ArenaFarm::new();
        let mut bins = FastArenaBins::new(4, 8, 9, 15, 5);

        // Two arenas in the same row: one cached, one binned.
        let a = farm.arena(4096, 64);
        let b = farm.arena(2048, 64);
        unsafe {
            bins.release_arena(a);
            bins.release_arena(b);
        }
        let row = &bins.rows[2];
        assert_eq!(row.cached.get(), a);
        let bin = bins.locate_step_split_arena(2048);
        assert!(bins.rows[2].present.get(bin));

        unsafe {
            // Request just under the bin boundary so the search bin sits
            // at or before b's bin. The cache (4096 remaining) serves it
            // first, then the binned arena.
            let ArenaAcquire::Acquired(found) = bins.acquire_arena(1984, 64) else {
                panic!("no arena");
            };
            assert_eq!(found, a);
            let ArenaAcquire::Acquired(found) = bins.acquire_arena(1984, 64) else {
                panic!("no arena");
            };
            assert_eq!(found, b);
        }
        assert!(!bins.rows[2].present.get(bin));
    }
}
