//! Shard pool: a pool of fixed-size shards carved from one region chunk,
//! each shard hosting a chunk pool.
//!
//! The control block lives in the region chunk's handle, so its first word
//! is the handle header the pointer decode reads. The shard-handle array
//! (one control block per shard) is carved from the leading shard(s) of
//! the chunk itself; those shards never circulate.
//!
//! Shard hand-out is the same bump-or-free-list pattern as the chunk pool;
//! free-list links are 32-bit indices in each free shard handle's first
//! word.

#![allow(unsafe_code)]

use std::cell::Cell;

use crate::handle::{ChunkKind, HandleHeader};
use crate::list::ListEntry;
use crate::sync::retire::{RetireNodeOps, RetireReclaimEntry, RetireWord, RETIRED};
use crate::util::pow2;

use super::chunk_pool::ChunkPool;

/// Sentinel index meaning "free list empty".
const NO_FREE_SHARD: u32 = u32::MAX;

/// One shard: its handle slot (control-block storage) and its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShard {
    pub handle: *mut u8,
    pub memory: *mut u8,
    pub index: u32,
}

/// Shard-pool control block. Fits in one 128-byte region-chunk handle.
///
/// Field protocol: `handle_header` and `retire.head` are shared atomics;
/// `retire.next` belongs to the retirer that queued this pool; the rest is
/// owner-thread only.
#[repr(C)]
pub struct ShardPool {
    handle_header: HandleHeader,
    pub(crate) list_entry: ListEntry,
    top: Cell<u32>,
    head: Cell<u32>,
    count: Cell<u32>,
    /// Total shards in the chunk, reserved ones included.
    num_shards: u32,
    /// Leading shards holding the handle array; never handed out.
    reserved_shards: u32,
    shard_size_log2: u32,
    control_block_log2: u32,
    memory_size: u64,
    /// Region chunk base; the handle array starts here.
    memory: *mut u8,
    pub(crate) retire: RetireReclaimEntry,
}

const _: () = assert!(std::mem::size_of::<ShardPool>() <= 128);

// SAFETY: see the field protocol above.
unsafe impl Send for ShardPool {}
unsafe impl Sync for ShardPool {}

struct PoolRetireOps;

unsafe impl RetireNodeOps for PoolRetireOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ()) {
        (*(node as *mut ChunkPool)).retire.next.set(next);
    }
}

impl ShardPool {
    /// Constructs a shard pool in place in `handle` (a region-chunk handle
    /// slot) over the chunk at `memory`.
    ///
    /// # Safety
    /// `handle` must be a writable control block; `memory` must cover
    /// `memory_size` committed bytes aligned to the shard size; both
    /// outlive the pool.
    pub unsafe fn create(
        handle: *mut u8,
        owner: *const (),
        memory: *mut u8,
        memory_size: u64,
        shard_size_log2: u32,
        control_block_log2: u32,
    ) -> *mut ShardPool {
        let shard_size = pow2(shard_size_log2);
        debug_assert!(memory_size >= shard_size);
        debug_assert!(memory as u64 % shard_size == 0);

        let num_shards = (memory_size >> shard_size_log2) as u32;
        let handles_bytes = (num_shards as u64) << control_block_log2;
        let reserved_shards = handles_bytes.div_ceil(shard_size) as u32;
        debug_assert!(reserved_shards < num_shards, "chunk too small for its handles");

        let pool = handle as *mut ShardPool;
        pool.write(ShardPool {
            handle_header: HandleHeader::new(),
            list_entry: ListEntry::new(),
            top: Cell::new(reserved_shards),
            head: Cell::new(NO_FREE_SHARD),
            count: Cell::new(0),
            num_shards,
            reserved_shards,
            shard_size_log2,
            control_block_log2,
            memory_size,
            memory,
            retire: RetireReclaimEntry::new(0),
        });
        (*pool)
            .handle_header
            .start_chunk_lifetime(owner, ChunkKind::ShardPool);
        pool
    }

    /// Recovers the pool from a decoded region-chunk handle pointer.
    ///
    /// # Safety
    /// `handle` must be the handle slot of a live shard pool.
    pub unsafe fn from_handle(handle: *mut u8) -> *mut ShardPool {
        handle as *mut ShardPool
    }

    /// Recovers the pool from its embedded list entry.
    ///
    /// # Safety
    /// `entry` must be the `list_entry` field of a live `ShardPool`.
    pub unsafe fn from_list_entry(entry: *mut ListEntry) -> *mut ShardPool {
        let offset = std::mem::offset_of!(ShardPool, list_entry);
        (entry as *mut u8).sub(offset) as *mut ShardPool
    }

    fn shard_from_index(&self, index: u32) -> PoolShard {
        debug_assert!(index >= self.reserved_shards && index < self.num_shards);
        // SAFETY: both offsets are in bounds of the chunk.
        unsafe {
            PoolShard {
                handle: self.memory.add((index as usize) << self.control_block_log2),
                memory: self.memory.add((index as usize) << self.shard_size_log2),
                index,
            }
        }
    }

    /// Shard index and handle for an interior pointer.
    pub fn shard_for_ptr(&self, ptr: *const u8) -> Option<PoolShard> {
        let base = self.memory as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + self.memory_size as usize {
            return None;
        }
        let index = ((addr - base) >> self.shard_size_log2) as u32;
        if index < self.reserved_shards {
            return None;
        }
        Some(self.shard_from_index(index))
    }

    /// The chunk pool hosted in the shard containing `ptr`.
    ///
    /// # Safety
    /// The shard containing `ptr` must currently host a live chunk pool.
    pub unsafe fn pool_for_ptr(&self, ptr: *const u8) -> Option<*mut ChunkPool> {
        self.shard_for_ptr(ptr)
            .map(|shard| shard.handle as *mut ChunkPool)
    }

    /// Hands out one shard: free list first, then the bump cursor.
    pub fn acquire(&self) -> Option<PoolShard> {
        let head = self.head.get();
        if head != NO_FREE_SHARD {
            let shard = self.shard_from_index(head);
            // SAFETY: a free shard handle's first word is its next link.
            let next = unsafe { (shard.handle as *const u32).read() };
            self.head.set(next);
            self.count.set(self.count.get() + 1);
            return Some(shard);
        }
        if self.top.get() < self.num_shards {
            let shard = self.shard_from_index(self.top.get());
            self.top.set(self.top.get() + 1);
            self.count.set(self.count.get() + 1);
            return Some(shard);
        }
        None
    }

    /// Returns a shard to the free list. Owner-thread only.
    pub fn release(&self, shard: PoolShard) {
        debug_assert!(shard.index >= self.reserved_shards && shard.index < self.num_shards);
        // SAFETY: the shard is dead; its handle's first word becomes the
        // free-list link.
        unsafe { (shard.handle as *mut u32).write(self.head.get()) };
        self.head.set(shard.index);
        self.count.set(self.count.get() - 1);
    }

    /// No live shards; the pool's region chunk can be released.
    pub fn empty(&self) -> bool {
        self.count.get() == 0
    }

    /// Every usable shard is live.
    pub fn full(&self) -> bool {
        self.count.get() == self.num_shards - self.reserved_shards
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn capacity(&self) -> u32 {
        self.num_shards - self.reserved_shards
    }

    pub fn memory(&self) -> *mut u8 {
        self.memory
    }

    pub(crate) fn handle_header(&self) -> &HandleHeader {
        &self.handle_header
    }

    /// Non-owner: queues a chunk pool (whose own retired list just went
    /// non-empty) on this shard pool. Returns the flags observed before
    /// queuing; `RETIRED` set stops the climb.
    ///
    /// # Safety
    /// `pool` must be a live chunk pool hosted by this shard pool.
    pub unsafe fn retire_pool(&self, pool: *mut ChunkPool) -> u64 {
        debug_assert!(!pool.is_null());
        self.retire.head.retire_ptr(pool as *mut (), &PoolRetireOps)
    }

    /// Owner: takes the queued chunk pools. The retired flag stays set
    /// until [`Self::release_drained`] succeeds.
    pub fn reclaim_pools(&self) -> *mut ChunkPool {
        let word: RetireWord = self.retire.head.reclaim();
        word.ptr() as *mut ChunkPool
    }

    /// Clears the retired flag once nothing is queued; `false` when new
    /// work raced in and another reclaim pass is needed.
    pub fn release_drained(&self) -> bool {
        self.retire.head.try_reset_flags(RETIRED)
    }
}
