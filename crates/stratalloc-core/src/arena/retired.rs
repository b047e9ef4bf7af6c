//! Retired-arena root: the per-thread-allocator head that collects arenas
//! with pending cross-thread frees.
//!
//! A non-owning thread first accumulates the freed bytes on the arena's
//! own retire counter; only the retirer that finds the arena's `RETIRED`
//! flag clear chains the arena onto this root. The owner drains the root
//! (or its postponed stash) and applies each arena's counter.

#![allow(unsafe_code)]

use crate::sync::retire::{RetireNodeOps, RetireReclaimEntry, RETIRED, ROOT};

use super::fast_arena::FastArena;

struct ArenaRetireOps;

unsafe impl RetireNodeOps for ArenaRetireOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ()) {
        (*(node as *mut FastArena)).retire.next.set(next);
    }
}

/// Snatched list of retired arenas, linked through their retire entries.
pub struct ArenaReclaimList {
    head: *mut FastArena,
}

impl ArenaReclaimList {
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn head(&self) -> *mut FastArena {
        self.head
    }

    /// Pops the next arena off the list.
    ///
    /// # Safety
    /// Every node on the list must be a live arena; the list must have
    /// been produced by [`RetiredArenas::reclaim`].
    pub unsafe fn pop(&mut self) -> Option<*mut FastArena> {
        if self.head.is_null() {
            return None;
        }
        let arena = self.head;
        self.head = (*arena).retire.next.replace(std::ptr::null_mut()) as *mut FastArena;
        Some(arena)
    }
}

/// The root retire entry of a thread allocator's fast-arena side.
pub struct RetiredArenas {
    entry: RetireReclaimEntry,
}

unsafe impl Send for RetiredArenas {}
unsafe impl Sync for RetiredArenas {}

impl RetiredArenas {
    pub fn new() -> Self {
        Self {
            entry: RetireReclaimEntry::new(ROOT),
        }
    }

    /// Non-owner path: accounts the free on the arena and chains the arena
    /// here unless somebody already did. Returns the root flags observed
    /// when chaining (callers at a higher level would stop on `RETIRED`).
    ///
    /// # Safety
    /// `arena` must be live and `ptr`/`size` an allocation it served.
    pub unsafe fn retire(&self, arena: *mut FastArena, ptr: *const u8, size: u64) -> u64 {
        debug_assert!(!arena.is_null());
        debug_assert!(size > 0);
        let arena_flags = (*arena).retire_allocation(ptr, size);
        if arena_flags & RETIRED != 0 {
            // Another retirer queued the arena (or the owner is draining);
            // the reclaim path alone will apply our counter update.
            return arena_flags;
        }
        self.entry.head.retire_ptr(arena as *mut (), &ArenaRetireOps)
    }

    /// Owner path: returns the postponed stash if present, else exchanges
    /// the retired list.
    pub fn reclaim(&self) -> ArenaReclaimList {
        let postponed = self.entry.next_postponed.replace(std::ptr::null_mut());
        if !postponed.is_null() {
            return ArenaReclaimList {
                head: postponed as *mut FastArena,
            };
        }
        let word = self.entry.head.reclaim();
        let list = ArenaReclaimList {
            head: word.ptr() as *mut FastArena,
        };
        if list.is_empty() {
            self.entry.head.try_reset_flags(RETIRED);
        }
        list
    }

    /// Stashes a partially drained list for the next reclaim call.
    /// Postponing over a non-empty stash is a bug.
    pub fn postpone(&self, list: ArenaReclaimList) {
        assert!(
            self.entry.next_postponed.get().is_null(),
            "postponed list already occupied"
        );
        if !list.is_empty() {
            self.entry.next_postponed.set(list.head() as *mut ());
        }
    }

    /// Releases the root's retired flag once the drain left nothing
    /// behind; no-op (false) when new work raced in.
    pub fn release_drained(&self) -> bool {
        self.entry.head.try_reset_flags(RETIRED)
    }

    pub fn has_pending(&self) -> bool {
        !self.entry.head.load().is_empty() || !self.entry.next_postponed.get().is_null()
    }
}

impl Default for RetiredArenas {
    fn default() -> Self {
        Self::new()
    }
}
