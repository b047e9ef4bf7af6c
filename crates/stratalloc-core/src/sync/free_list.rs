//! Versioned lock-free free list and bump stack.
//!
//! The free list is intrusive: nodes live in a caller-provided backing
//! array and are addressed by 32-bit indices; each node's link word is
//! reached through a [`LinkOps`] adapter. The list head packs
//! `{version:32, link:32}` into a single `AtomicU64`. Every successful
//! mutation CASes the head with `AcqRel` and bumps the version, so a reader
//! that observes an unchanged head between its load and its CAS concludes
//! no mutation interleaved.
//!
//! ABA note: the 32-bit version is a mitigation, not a hard guarantee. A
//! full 2^32 wraparound between one thread's load and CAS could collide; the
//! design accepts that negligible residual risk (a wider head would need a
//! 128-bit CAS).
//!
//! `pop` reads the successor's link with a relaxed access while other
//! threads may be mutating it; the value may be garbage, and correctness
//! relies on the version-checked CAS discarding it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::backoff::SpinBackoff;

/// Empty list / no successor.
pub const NULL_LINK: u32 = 0xFFFF_FFFF;
/// Bounded-attempt operation exhausted its attempts.
pub const OP_FAILED: u32 = 0xFFFF_FFFE;

/// Attempt count meaning "retry until success".
pub const UNBOUNDED: i32 = -1;

/// Access to a node's link word. Both operations are relaxed atomic
/// accesses on storage the caller owns.
pub trait LinkOps {
    fn set_next(&self, node: u32, next: u32);
    fn get_next(&self, node: u32) -> u32;
}

#[inline]
const fn pack(version: u32, link: u32) -> u64 {
    (version as u64) << 32 | link as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// `{version:32, link:32}` head of an intrusive lock-free list.
#[repr(transparent)]
pub struct VersionedHead {
    head: AtomicU64,
}

impl VersionedHead {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NULL_LINK)),
        }
    }

    /// Current link (relaxed). Only meaningful at quiescence.
    pub fn link(&self) -> u32 {
        unpack(self.head.load(Ordering::Relaxed)).1
    }

    /// Current version (relaxed). Strictly increases on every mutation.
    pub fn version(&self) -> u32 {
        unpack(self.head.load(Ordering::Relaxed)).0
    }

    /// Pushes `node` onto the list. Returns `false` when a bounded attempt
    /// count was exhausted by contention.
    pub fn push(&self, node: u32, attempts: i32, ops: &impl LinkOps) -> bool {
        debug_assert!(node < OP_FAILED, "pushing a sentinel link");
        let mut backoff = SpinBackoff;
        let mut remaining = attempts;
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            let (version, link) = unpack(old);
            ops.set_next(node, link);
            match self.head.compare_exchange_weak(
                old,
                pack(version.wrapping_add(1), node),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
            if remaining > 0 {
                remaining -= 1;
                if remaining == 0 {
                    return false;
                }
            }
            backoff.spin();
        }
    }

    /// Pops a node. Returns the node index, [`NULL_LINK`] when the list is
    /// empty, or [`OP_FAILED`] when a bounded attempt count was exhausted.
    pub fn pop(&self, attempts: i32, ops: &impl LinkOps) -> u32 {
        let mut backoff = SpinBackoff;
        let mut remaining = attempts;
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            let (version, link) = unpack(old);
            if link == NULL_LINK {
                return NULL_LINK;
            }
            // May observe garbage under concurrent mutation; the CAS below
            // fails (version changed) whenever that could matter.
            let next = ops.get_next(link);
            match self.head.compare_exchange_weak(
                old,
                pack(version.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return link,
                Err(current) => old = current,
            }
            if remaining > 0 {
                remaining -= 1;
                if remaining == 0 {
                    return OP_FAILED;
                }
            }
            backoff.spin();
        }
    }
}

impl Default for VersionedHead {
    fn default() -> Self {
        Self::new()
    }
}

/// Bump stack enumerating handles not yet in circulation. `limit` is
/// exclusive and read-only after construction.
pub struct BumpStack {
    top: AtomicU32,
    limit: u32,
}

impl BumpStack {
    pub const fn new(first: u32, limit: u32) -> Self {
        Self {
            top: AtomicU32::new(first),
            limit,
        }
    }

    /// Issues the next index, or [`NULL_LINK`] when the stack is exhausted.
    ///
    /// The counter may momentarily overshoot `limit` under contention; the
    /// losing incrementer restores it.
    pub fn bump(&self) -> u32 {
        if self.top.load(Ordering::Relaxed) >= self.limit {
            return NULL_LINK;
        }
        let old = self.top.fetch_add(1, Ordering::AcqRel);
        if old >= self.limit {
            self.top.fetch_sub(1, Ordering::AcqRel);
            return NULL_LINK;
        }
        old
    }

    /// Current top (relaxed). Only meaningful at quiescence.
    pub fn top(&self) -> u32 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Link words in a plain array, the way the region pools store them in
    /// handle headers.
    struct ArrayOps<'a> {
        links: &'a [AtomicU32],
    }

    impl LinkOps for ArrayOps<'_> {
        fn set_next(&self, node: u32, next: u32) {
            self.links[node as usize].store(next, Ordering::Relaxed);
        }

        fn get_next(&self, node: u32) -> u32 {
            self.links[node as usize].load(Ordering::Relaxed)
        }
    }

    fn make_links(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(NULL_LINK)).collect()
    }

    #[test]
    fn test_pop_empty() {
        let links = make_links(4);
        let ops = ArrayOps { links: &links };
        let head = VersionedHead::new();
        assert_eq!(head.pop(UNBOUNDED, &ops), NULL_LINK);
    }

    #[test]
    fn test_push_pop_lifo() {
        let links = make_links(8);
        let ops = ArrayOps { links: &links };
        let head = VersionedHead::new();

        assert!(head.push(3, UNBOUNDED, &ops));
        assert!(head.push(5, UNBOUNDED, &ops));
        assert!(head.push(7, UNBOUNDED, &ops));

        assert_eq!(head.pop(UNBOUNDED, &ops), 7);
        assert_eq!(head.pop(UNBOUNDED, &ops), 5);
        assert_eq!(head.pop(UNBOUNDED, &ops), 3);
        assert_eq!(head.pop(UNBOUNDED, &ops), NULL_LINK);
    }

    #[test]
    fn test_version_increases_on_every_mutation() {
        let links = make_links(4);
        let ops = ArrayOps { links: &links };
        let head = VersionedHead::new();

        let v0 = head.version();
        head.push(0, UNBOUNDED, &ops);
        let v1 = head.version();
        head.pop(UNBOUNDED, &ops);
        let v2 = head.version();
        assert_eq!(v1, v0.wrapping_add(1));
        assert_eq!(v2, v1.wrapping_add(1));
    }

    #[test]
    fn test_list_walk_matches_pushes() {
        let links = make_links(16);
        let ops = ArrayOps { links: &links };
        let head = VersionedHead::new();
        for node in [2u32, 9, 4, 11] {
            head.push(node, UNBOUNDED, &ops);
        }

        let mut seen = Vec::new();
        let mut cursor = head.link();
        while cursor != NULL_LINK {
            seen.push(cursor);
            cursor = ops.get_next(cursor);
        }
        assert_eq!(seen, vec![11, 4, 9, 2]);
    }

    #[test]
    fn test_bump_stack_sequential() {
        let stack = BumpStack::new(10, 13);
        assert_eq!(stack.bump(), 10);
        assert_eq!(stack.bump(), 11);
        assert_eq!(stack.bump(), 12);
        assert_eq!(stack.bump(), NULL_LINK);
        assert_eq!(stack.bump(), NULL_LINK);
        assert_eq!(stack.top(), 13);
    }

    #[test]
    fn test_bump_stack_empty_range() {
        let stack = BumpStack::new(5, 5);
        assert_eq!(stack.bump(), NULL_LINK);
        assert_eq!(stack.top(), 5);
    }
}
