//! Lock-free push/snatch list for one-shot bulk hand-offs.
//!
//! The head is a plain atomic pointer. Nodes carry `next` plus a `tail` hop
//! pointer valid for the batch being pushed, so a multi-node batch is
//! pushed with a single CAS. `snatch` exchanges the head with null and
//! hands the entire list to the caller.
//!
//! Used to park overflow thread allocators behind the graveyard slots and
//! to move batches of work between threads.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::backoff::SpinBackoff;

/// Node link access for a concrete node type. `set_next`/`get_next` touch
/// the node's `next` link; `set_tail`/`get_tail` touch the batch-tail hop
/// stored on the batch head.
///
/// # Safety
/// Implementations dereference raw node pointers; the caller of the list
/// operations guarantees every node passed in is alive.
pub unsafe trait SnatchOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ());
    unsafe fn get_next(&self, node: *mut ()) -> *mut ();
    unsafe fn set_tail(&self, batch: *mut (), tail: *mut ());
    unsafe fn get_tail(&self, batch: *mut ()) -> *mut ();
}

/// Intrusive lock-free push/snatch list.
pub struct PushSnatchList {
    head: AtomicPtr<()>,
}

impl PushSnatchList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Pushes a non-null batch (its `tail` hop must point at its last
    /// node; a single node is its own tail).
    ///
    /// # Safety
    /// `batch` and every node reachable from it must be alive and owned by
    /// the caller until the push completes.
    pub unsafe fn push(&self, batch: *mut (), ops: &impl SnatchOps) {
        debug_assert!(!batch.is_null(), "pushing a null batch");
        let tail = ops.get_tail(batch);
        debug_assert!(!tail.is_null(), "batch has no tail hop");

        let mut backoff = SpinBackoff;
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            ops.set_next(tail, old);
            match self
                .head
                .compare_exchange_weak(old, batch, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => old = current,
            }
            backoff.spin();
        }
    }

    /// Takes the whole list; ownership of every node passes to the caller.
    pub fn snatch(&self) -> *mut () {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Snatches the list, keeps the first `n` nodes, and pushes the
    /// remainder back. Returns the kept prefix (with its tail hop set), or
    /// null when the list was empty.
    ///
    /// # Safety
    /// Same contract as [`Self::push`].
    pub unsafe fn snatch_part(&self, n: usize, ops: &impl SnatchOps) -> *mut () {
        debug_assert!(n > 0, "snatching a zero-length prefix");
        let head = self.snatch();
        if head.is_null() {
            return head;
        }

        // Find the cut point: the n-th node or the end, whichever first.
        let mut cut = head;
        for _ in 1..n {
            let next = ops.get_next(cut);
            if next.is_null() {
                break;
            }
            cut = next;
        }

        let rest = ops.get_next(cut);
        ops.set_next(cut, ptr::null_mut());
        ops.set_tail(head, cut);

        if !rest.is_null() {
            let mut rest_tail = rest;
            loop {
                let next = ops.get_next(rest_tail);
                if next.is_null() {
                    break;
                }
                rest_tail = next;
            }
            ops.set_tail(rest, rest_tail);
            self.push(rest, ops);
        }
        head
    }
}

impl Default for PushSnatchList {
    fn default() -> Self {
        Self::new()
    }
}
