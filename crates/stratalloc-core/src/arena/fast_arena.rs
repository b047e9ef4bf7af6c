//! The fast-arena control block.
//!
//! An arena is a bump pointer over one region-chunk. The control block
//! lives in the chunk's handle slot; its first word is the handle header,
//! so the owner pointer and kind tag are visible to the pointer decode.
//!
//! Only aligned allocations are made: sizes are rounded up to the arena
//! alignment on both the acquire and the release side, so `freed == top`
//! (*resettable*) holds exactly when every byte handed out came back.
//! `top` only moves forward; reclaiming space is always a whole-arena
//! reset.

#![allow(unsafe_code)]

use std::cell::Cell;

use crate::handle::{ChunkKind, HandleHeader};
use crate::list::ListEntry;
use crate::sync::retire::{RetireReclaimEntry, RetireWord};
use crate::util::{align_up, is_aligned, is_ptr_aligned};

/// Arena control block. Fits in one 128-byte handle slot.
///
/// Field protocol: `handle_header` and `retire.head` are atomics shared
/// with other threads; `retire.next` is written by whichever retirer
/// exclusively owns the queued arena; everything else is touched only by
/// the owning thread.
#[repr(C)]
pub struct FastArena {
    handle_header: HandleHeader,
    pub(crate) list_entry: ListEntry,
    freed: Cell<u64>,
    top: Cell<u64>,
    memory_size: u64,
    alignment: u64,
    memory: *mut u8,
    pub(crate) retire: RetireReclaimEntry,
}

const _: () = assert!(std::mem::size_of::<FastArena>() <= 128);

// SAFETY: see the field protocol above; cross-thread access is limited to
// the atomic words, everything else is serialized by arena ownership.
unsafe impl Send for FastArena {}
unsafe impl Sync for FastArena {}

impl FastArena {
    /// Constructs an arena in place in `handle` (a region-chunk handle
    /// slot) over `memory`.
    ///
    /// # Safety
    /// `handle` must point at a writable control block of at least
    /// `size_of::<FastArena>()` bytes; `memory` must cover `memory_size`
    /// committed bytes aligned to `alignment`; both stay valid for the
    /// arena's lifetime.
    pub unsafe fn create(
        handle: *mut u8,
        owner: *const (),
        memory: *mut u8,
        memory_size: u64,
        alignment: u64,
    ) -> *mut FastArena {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(is_aligned(memory_size, alignment));
        debug_assert!(is_ptr_aligned(memory, alignment));

        let arena = handle as *mut FastArena;
        arena.write(FastArena {
            handle_header: HandleHeader::new(),
            list_entry: ListEntry::new(),
            freed: Cell::new(0),
            top: Cell::new(0),
            memory_size,
            alignment,
            memory,
            retire: RetireReclaimEntry::new(0),
        });
        (*arena)
            .handle_header
            .start_chunk_lifetime(owner, ChunkKind::FastArena);
        arena
    }

    /// Recovers the arena from its embedded list entry.
    ///
    /// # Safety
    /// `entry` must be the `list_entry` field of a live `FastArena`.
    pub unsafe fn from_list_entry(entry: *mut ListEntry) -> *mut FastArena {
        let offset = std::mem::offset_of!(FastArena, list_entry);
        (entry as *mut u8).sub(offset) as *mut FastArena
    }

    /// Bump-allocates `size` bytes (rounded up to the arena alignment).
    /// Returns null when the remainder is too small.
    pub fn acquire(&self, size: u64) -> *mut u8 {
        debug_assert!(self.top.get() <= self.memory_size);
        let required = align_up(size, self.alignment);
        if self.remaining() < required {
            return std::ptr::null_mut();
        }
        let old_top = self.top.get();
        self.top.set(old_top + required);
        // SAFETY: old_top + required <= memory_size.
        unsafe { self.memory.add(old_top as usize) }
    }

    /// Returns `size` bytes (rounded up to the arena alignment) freed at
    /// `ptr`. Freeing more than was allocated is internal corruption.
    pub fn release(&self, ptr: *const u8, size: u64) {
        debug_assert!(self.has_memory_range(ptr, size), "pointer outside arena");
        self.release_unchecked(align_up(size, self.alignment));
    }

    /// Accounts `aligned_size` freed bytes without a range check (used by
    /// the reclaim path, which applies an accumulated counter).
    pub fn release_unchecked(&self, aligned_size: u64) {
        let new_freed = self.freed.get() + aligned_size;
        assert!(
            new_freed <= self.memory_size,
            "freed more than the arena ever allocated"
        );
        self.freed.set(new_freed);
    }

    /// Clears the arena back to empty. Caller must have checked
    /// [`Self::resettable`].
    pub fn reset(&self) {
        debug_assert!(self.resettable());
        self.top.set(0);
        self.freed.set(0);
    }

    pub fn has_memory_range(&self, ptr: *const u8, size: u64) -> bool {
        let addr = ptr as u64;
        let start = self.memory as u64;
        addr >= start && addr + size <= start + self.memory_size
    }

    /// Every allocated byte has been freed; the arena may be cleared.
    pub fn resettable(&self) -> bool {
        self.freed.get() == self.top.get()
    }

    pub fn empty(&self) -> bool {
        self.top.get() == 0
    }

    pub fn full(&self) -> bool {
        self.top.get() == self.memory_size
    }

    pub fn can_allocate(&self, size: u64) -> bool {
        self.remaining() >= align_up(size, self.alignment)
    }

    pub fn remaining(&self) -> u64 {
        debug_assert!(self.top.get() <= self.memory_size);
        self.memory_size - self.top.get()
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn base(&self) -> *mut u8 {
        self.memory
    }

    pub fn freed(&self) -> u64 {
        self.freed.get()
    }

    /// Non-owner side of a cross-thread free: accumulates the aligned size
    /// on the arena's retire counter. Returns the previously observed
    /// status flags; `RETIRED` set means someone is already ahead and the
    /// caller must not chain this arena up again.
    pub fn retire_allocation(&self, ptr: *const u8, size: u64) -> u64 {
        debug_assert!(self.has_memory_range(ptr, size), "pointer outside arena");
        self.retire.head.retire_data(align_up(size, self.alignment))
    }

    /// Owner side: drains the accumulated freed-byte counter, then clears
    /// the retired flag. Loops because a retirement racing the drain must
    /// not strand bytes behind a stale flag (a retirer that saw `RETIRED`
    /// set did not re-queue the arena on the root list).
    pub fn reclaim_allocations(&self) {
        use crate::sync::retire::RETIRED;
        loop {
            let word: RetireWord = self.retire.head.reclaim();
            if word.value() > 0 {
                self.release_unchecked(word.value());
            }
            if self.retire.head.try_reset_flags(RETIRED) {
                return;
            }
        }
    }

    pub(crate) fn handle_header(&self) -> &HandleHeader {
        &self.handle_header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Owned backing for a standalone arena (control block + memory).
    struct TestArena {
        _block: Box<[u8]>,
        _memory: Vec<u8>,
        arena: *mut FastArena,
    }

    impl TestArena {
        fn new(memory_size: u64, alignment: u64) -> Self {
            let mut block = vec![0u8; 128].into_boxed_slice();
            let mut memory = vec![0u8; memory_size as usize + alignment as usize];
            let base = {
                let raw = memory.as_mut_ptr() as u64;
                crate::util::align_up(raw, alignment) as *mut u8
            };
            // SAFETY: block and memory outlive the arena; base is aligned.
            let arena = unsafe {
                FastArena::create(
                    block.as_mut_ptr(),
                    0x4000usize as *const (),
                    base,
                    memory_size,
                    alignment,
                )
            };
            Self {
                _block: block,
                _memory: memory,
                arena,
            }
        }

        fn arena(&self) -> &FastArena {
            // SAFETY: points into _block, alive for self's lifetime.
            unsafe { &*self.arena }
        }
    }

    #[test]
    fn test_full_exhaustion_round_trip() {
        // Scenario: alignment 64, 64 KiB arena, 1024 allocations of 64.
        let backing = TestArena::new(65536, 64);
        let arena = backing.arena();

        let mut ptrs = Vec::new();
        loop {
            let ptr = arena.acquire(64);
            if ptr.is_null() {
                break;
            }
            ptrs.push(ptr);
        }
        assert_eq!(ptrs.len(), 1024);
        for (i, &ptr) in ptrs.iter().enumerate() {
            assert_eq!(ptr as usize, arena.base() as usize + i * 64);
        }
        assert!(arena.full());
        assert!(!arena.resettable());

        for &ptr in &ptrs {
            arena.release(ptr, 64);
        }
        assert!(arena.resettable());
        arena.reset();
        assert!(arena.empty());
    }

    #[test]
    fn test_sizes_round_up_to_alignment() {
        let backing = TestArena::new(4096, 64);
        let arena = backing.arena();

        let a = arena.acquire(1);
        let b = arena.acquire(65);
        assert_eq!(b as u64 - a as u64, 64);
        assert_eq!(arena.remaining(), 4096 - 64 - 128);

        arena.release(a, 1);
        arena.release(b, 65);
        assert_eq!(arena.freed(), 192);
        assert!(arena.resettable());
    }

    #[test]
    fn test_accounting_matches_aligned_sum() {
        let backing = TestArena::new(8192, 32);
        let arena = backing.arena();
        let sizes = [1u64, 31, 32, 33, 100, 128];

        let ptrs: Vec<_> = sizes.iter().map(|&s| arena.acquire(s)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        for (&ptr, &size) in ptrs.iter().zip(&sizes) {
            arena.release(ptr, size);
        }
        let expected: u64 = sizes.iter().map(|&s| align_up(s, 32)).sum();
        assert_eq!(arena.freed(), expected);
        assert!(arena.resettable());
    }

    #[test]
    fn test_retire_then_reclaim() {
        let backing = TestArena::new(4096, 64);
        let arena = backing.arena();

        let ptr = arena.acquire(128);
        assert!(!ptr.is_null());
        let flags = arena.retire_allocation(ptr, 128);
        assert_eq!(flags & crate::sync::retire::RETIRED, 0);
        // Counter is pending, not yet applied.
        assert_eq!(arena.freed(), 0);

        arena.reclaim_allocations();
        assert_eq!(arena.freed(), 128);
        assert!(arena.resettable());
        assert_eq!(arena.retire.head.flags(), 0);
    }

    #[test]
    #[should_panic(expected = "freed more than")]
    fn test_over_free_is_fatal() {
        let backing = TestArena::new(4096, 64);
        let arena = backing.arena();
        arena.release_unchecked(8192);
    }

    #[test]
    fn test_header_kind_installed() {
        let backing = TestArena::new(4096, 64);
        let arena = backing.arena();
        let (owner, kind) = arena.handle_header().owner();
        assert_eq!(owner, 0x4000usize as *const ());
        assert_eq!(kind, ChunkKind::FastArena);
    }
}
