//! Thread graveyard: parking for terminated per-thread allocators until
//! another thread adopts them.
//!
//! A fixed array of cache-line-aligned slots, each a single atomic word
//! packing a thread-allocator pointer with an `acquired` bit, plus an
//! auxiliary push/snatch list for overflow. Valid slot states are
//! `{null, 0}` (empty), `{ptr, 0}` (parked) and `{null, 1}` (acquired);
//! `{ptr, 1}` is forbidden and checked fatally.
//!
//! At most one thread can hold a slot acquired: the only transition out of
//! the parked state is the acquirer's exchange, and the losing exchanger
//! observes the `acquired` bit and backs off.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::ExpBackoff;
use crate::sync::snatch_list::{PushSnatchList, SnatchOps};

const ACQUIRED: u64 = 1;
const PTR_MASK: u64 = !ACQUIRED;

enum SlotAcquire {
    /// Slot held no thread.
    Empty,
    /// Another acquirer beat us to it.
    Contended,
    /// We now own the slot and the thread it held.
    Thread(*mut ()),
}

/// One grave slot: thread pointer | acquired bit.
struct GraveSlot {
    word: AtomicU64,
}

impl GraveSlot {
    const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    fn check_valid(word: u64) {
        assert!(
            word & PTR_MASK == 0 || word & ACQUIRED == 0,
            "grave slot holds a thread while acquired"
        );
    }

    fn try_acquire(&self) -> SlotAcquire {
        let old = self.word.load(Ordering::Relaxed);
        Self::check_valid(old);
        if old & PTR_MASK == 0 {
            return SlotAcquire::Empty;
        }
        let prev = self.word.swap(ACQUIRED, Ordering::AcqRel);
        Self::check_valid(prev);
        if prev & ACQUIRED != 0 {
            return SlotAcquire::Contended;
        }
        if prev & PTR_MASK == 0 {
            // The parked thread vanished between load and swap; the slot
            // is ours but empty, release it as such.
            self.release(0);
            return SlotAcquire::Empty;
        }
        SlotAcquire::Thread((prev & PTR_MASK) as *mut ())
    }

    /// Parks `thread` if the slot is empty.
    fn try_put(&self, thread: *mut ()) -> bool {
        debug_assert!(!thread.is_null());
        debug_assert!(thread as u64 & ACQUIRED == 0, "thread under-aligned");
        self.word
            .compare_exchange(0, thread as u64, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Writes a non-acquired state; the caller must hold the slot
    /// acquired.
    fn release(&self, new_word: u64) {
        debug_assert!(new_word & ACQUIRED == 0);
        let prev = self.word.swap(new_word, Ordering::AcqRel);
        assert!(prev & ACQUIRED != 0, "released a slot that was not acquired");
    }
}

/// Where an acquired thread came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraveData {
    /// Slot index, or `slot_count` when the thread came off the aux list.
    pub slot: u32,
    pub thread: *mut (),
}

/// Scan parameters for [`ThreadGraveyard::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct GraveAcquireParams {
    /// Full-scan retries before falling back to the aux list.
    pub rounds: i32,
    /// First slot to probe (derive from a per-thread seed).
    pub start: u32,
    /// Probe step; must be odd.
    pub step: u32,
}

impl Default for GraveAcquireParams {
    fn default() -> Self {
        Self {
            rounds: 1,
            start: 0,
            step: 1,
        }
    }
}

enum Scan {
    Hit(u32, *mut ()),
    Contended,
    AllEmpty,
}

/// The process-wide graveyard.
pub struct ThreadGraveyard {
    slots: Box<[CachePadded<GraveSlot>]>,
    aux: PushSnatchList,
    slot_count: u32,
}

impl ThreadGraveyard {
    pub fn new(slot_count: u32) -> Self {
        assert!(slot_count.is_power_of_two());
        Self {
            slots: (0..slot_count)
                .map(|_| CachePadded::new(GraveSlot::new()))
                .collect(),
            aux: PushSnatchList::new(),
            slot_count,
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    fn scan(&self, params: &GraveAcquireParams) -> Scan {
        let mask = self.slot_count - 1;
        let mut contended = false;
        let mut slot = params.start & mask;
        for _ in 0..self.slot_count {
            match self.slots[slot as usize].try_acquire() {
                SlotAcquire::Thread(thread) => return Scan::Hit(slot, thread),
                SlotAcquire::Contended => contended = true,
                SlotAcquire::Empty => {}
            }
            slot = (slot + params.step) & mask;
        }
        if contended {
            Scan::Contended
        } else {
            Scan::AllEmpty
        }
    }

    /// Parks as many threads of `list` into empty slots as fit; returns
    /// the undistributed remainder.
    unsafe fn distribute(&self, list: *mut (), ops: &impl SnatchOps) -> *mut () {
        let mut cursor = list;
        for slot in self.slots.iter() {
            if cursor.is_null() {
                break;
            }
            let next = ops.get_next(cursor);
            ops.set_next(cursor, std::ptr::null_mut());
            ops.set_tail(cursor, cursor);
            if slot.try_put(cursor) {
                cursor = next;
            } else {
                // Slot occupied; restore the chain and try the next slot.
                ops.set_next(cursor, next);
            }
        }
        cursor
    }

    /// Acquires one parked thread: scans the slots (retrying contention up
    /// to `params.rounds` full rounds), then falls back to snatching the
    /// aux list, keeping its head and redistributing the rest.
    ///
    /// Returns `None` when no parked thread exists anywhere.
    ///
    /// # Safety
    /// `ops` must match the node type of every parked thread.
    pub unsafe fn acquire(
        &self,
        params: GraveAcquireParams,
        ops: &impl SnatchOps,
    ) -> Option<GraveData> {
        let mut backoff = ExpBackoff::default();
        let mut rounds = params.rounds;
        while rounds != 0 {
            match self.scan(&params) {
                Scan::Hit(slot, thread) => return Some(GraveData { slot, thread }),
                Scan::AllEmpty => {
                    if rounds > 0 {
                        rounds -= 1;
                    }
                }
                Scan::Contended => {}
            }
            backoff.spin();
        }

        let snatched = self.aux.snatch();
        if snatched.is_null() {
            return None;
        }
        let rest = ops.get_next(snatched);
        ops.set_next(snatched, std::ptr::null_mut());
        ops.set_tail(snatched, snatched);
        if !rest.is_null() {
            let leftover = self.distribute(rest, ops);
            if !leftover.is_null() {
                self.push_chain(leftover, ops);
            }
        }
        Some(GraveData {
            slot: self.slot_count,
            thread: snatched,
        })
    }

    /// Pushes a next-linked chain to the aux list, fixing up its tail hop.
    unsafe fn push_chain(&self, chain: *mut (), ops: &impl SnatchOps) {
        let mut tail = chain;
        loop {
            let next = ops.get_next(tail);
            if next.is_null() {
                break;
            }
            tail = next;
        }
        ops.set_tail(chain, tail);
        self.aux.push(chain, ops);
    }

    /// Parks a dying thread's allocator: an empty slot if one exists,
    /// the aux list otherwise.
    ///
    /// # Safety
    /// `thread` must be a live parked-allocator node matching `ops`; the
    /// caller relinquishes it.
    pub unsafe fn put_thread_to_rest(&self, thread: *mut (), ops: &impl SnatchOps) {
        assert!(!thread.is_null(), "parking a null thread");
        ops.set_next(thread, std::ptr::null_mut());
        ops.set_tail(thread, thread);
        let leftover = self.distribute(thread, ops);
        if !leftover.is_null() {
            self.aux.push(leftover, ops);
        }
    }

    /// Releases an acquired slot back to empty (the adopter kept the
    /// thread). No-op for aux-list acquisitions.
    pub fn release_thread(&self, data: GraveData) {
        if data.slot < self.slot_count {
            self.slots[data.slot as usize].release(0);
        }
    }

    /// Puts the thread back where it came from: the acquired slot, or the
    /// aux list for aux acquisitions.
    ///
    /// # Safety
    /// Same contract as [`Self::put_thread_to_rest`].
    pub unsafe fn put_thread_back(&self, data: GraveData, ops: &impl SnatchOps) {
        assert!(!data.thread.is_null());
        if data.slot < self.slot_count {
            self.slots[data.slot as usize].release(data.thread as u64);
        } else {
            ops.set_next(data.thread, std::ptr::null_mut());
            ops.set_tail(data.thread, data.thread);
            self.aux.push(data.thread, ops);
        }
    }
}
