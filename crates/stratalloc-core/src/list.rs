//! Intrusive doubly-linked list used by the per-thread bin tables.
//!
//! Heads are terminator nodes that link to themselves when the list is
//! empty, so the algorithms carry no null checks. A detached entry has null
//! `prev`/`next`; the bin tables rely on that as the "is this arena/pool on
//! a list" predicate, so `erase` and `pop_head` always null the links of
//! the entry they remove.
//!
//! Entries live inside control blocks that are reached through raw
//! pointers, so all link-following operations are `unsafe`; the caller
//! guarantees every linked entry is alive and owned by the current thread.

#![allow(unsafe_code)]

use std::cell::Cell;

/// Embedded list links. `#[repr(C)]` so control blocks that embed it have a
/// stable layout.
#[repr(C)]
pub struct ListEntry {
    prev: Cell<*mut ListEntry>,
    next: Cell<*mut ListEntry>,
}

impl ListEntry {
    /// A detached entry (null links).
    pub const fn new() -> Self {
        Self {
            prev: Cell::new(std::ptr::null_mut()),
            next: Cell::new(std::ptr::null_mut()),
        }
    }

    /// Initializes `self` as an empty list head (self-linked terminator).
    pub fn init_head(&self) {
        let this = self as *const ListEntry as *mut ListEntry;
        self.prev.set(this);
        self.next.set(this);
    }

    /// True when this entry is not linked into any list.
    pub fn is_detached(&self) -> bool {
        self.next.get().is_null()
    }

    /// True when this head's list is empty (head links to itself).
    pub fn is_empty_head(&self) -> bool {
        self.next.get() == self as *const ListEntry as *mut ListEntry
    }

    /// The entry this one links to (list traversal).
    pub(crate) fn next_entry(&self) -> *mut ListEntry {
        self.next.get()
    }
}

impl Default for ListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Links `entry` directly after `after`.
///
/// # Safety
/// `after` must be part of a well-formed list (or an initialized head) and
/// `entry` must be detached. No other thread may touch either list.
pub unsafe fn list_insert_after(after: *mut ListEntry, entry: *mut ListEntry) {
    debug_assert!((*entry).is_detached(), "entry is already on a list");
    let after_next = (*after).next.get();
    (*entry).prev.set(after);
    (*entry).next.set(after_next);
    (*after_next).prev.set(entry);
    (*after).next.set(entry);
}

/// Pushes `entry` at the head of the list owned by `head`.
///
/// # Safety
/// Same contract as [`list_insert_after`].
pub unsafe fn list_push_head(head: *mut ListEntry, entry: *mut ListEntry) {
    list_insert_after(head, entry);
}

/// Unlinks `entry` and leaves it detached (null links).
///
/// # Safety
/// `entry` must currently be linked into a well-formed list that no other
/// thread is touching. Must not be called on a terminator head.
pub unsafe fn list_erase(entry: *mut ListEntry) {
    let prev = (*entry).prev.get();
    let next = (*entry).next.get();
    debug_assert!(!prev.is_null() && !next.is_null(), "entry is not on a list");
    (*prev).next.set(next);
    (*next).prev.set(prev);
    (*entry).prev.set(std::ptr::null_mut());
    (*entry).next.set(std::ptr::null_mut());
}

/// Pops the first entry of `head`'s list, or returns null when empty.
///
/// # Safety
/// `head` must be an initialized head of a well-formed list that no other
/// thread is touching.
pub unsafe fn list_pop_head(head: *mut ListEntry) -> *mut ListEntry {
    let first = (*head).next.get();
    if first == head {
        return std::ptr::null_mut();
    }
    list_erase(first);
    first
}
