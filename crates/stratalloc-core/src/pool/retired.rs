//! Retired-pool root: the per-thread-allocator head collecting shard
//! pools whose subtree has pending cross-thread frees.
//!
//! The climb stops at the first level whose retired flag was already set:
//! that level is guaranteed to be drained by whoever set it (or by the
//! owner's in-progress reclaim, which loops until the flag can be
//! cleared).

#![allow(unsafe_code)]

use crate::sync::retire::{RetireNodeOps, RetireReclaimEntry, RETIRED, ROOT};

use super::chunk_pool::ChunkPool;
use super::shard_pool::ShardPool;

struct ShardPoolRetireOps;

unsafe impl RetireNodeOps for ShardPoolRetireOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ()) {
        (*(node as *mut ShardPool)).retire.next.set(next);
    }
}

/// Snatched list of retired shard pools.
pub struct ShardPoolReclaimList {
    head: *mut ShardPool,
}

impl ShardPoolReclaimList {
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Pops the next shard pool off the list.
    ///
    /// # Safety
    /// The list must come from [`RetiredPools::reclaim`] and every node
    /// must still be alive.
    pub unsafe fn pop(&mut self) -> Option<*mut ShardPool> {
        if self.head.is_null() {
            return None;
        }
        let pool = self.head;
        self.head = (*pool).retire.next.replace(std::ptr::null_mut()) as *mut ShardPool;
        Some(pool)
    }
}

/// The root retire entry of a thread allocator's pool side.
pub struct RetiredPools {
    entry: RetireReclaimEntry,
}

impl RetiredPools {
    pub fn new() -> Self {
        Self {
            entry: RetireReclaimEntry::new(ROOT),
        }
    }

    /// Non-owner path: queues the chunk on its pool and climbs the
    /// hierarchy (pool → shard pool → this root), stopping at the first
    /// level already flagged.
    ///
    /// # Safety
    /// `pool` must host the live allocation `chunk`; both must belong to
    /// the thread allocator owning this root.
    pub unsafe fn retire_chunk(&self, pool: *mut ChunkPool, chunk: *mut u8) {
        let flags = (*pool).retire_chunk(chunk);
        if flags & RETIRED != 0 {
            return;
        }
        let shard_pool = (*pool).shard_pool();
        debug_assert!(!shard_pool.is_null(), "pool without a hosting shard pool");
        let flags = (*shard_pool).retire_pool(pool);
        if flags & RETIRED != 0 {
            return;
        }
        self.entry
            .head
            .retire_ptr(shard_pool as *mut (), &ShardPoolRetireOps);
    }

    /// Owner path: takes the queued shard pools.
    pub fn reclaim(&self) -> ShardPoolReclaimList {
        let word = self.entry.head.reclaim();
        let list = ShardPoolReclaimList {
            head: word.ptr() as *mut ShardPool,
        };
        if list.is_empty() {
            self.entry.head.try_reset_flags(RETIRED);
        }
        list
    }

    pub fn has_pending(&self) -> bool {
        !self.entry.head.load().is_empty()
    }
}

impl Default for RetiredPools {
    fn default() -> Self {
        Self::new()
    }
}
