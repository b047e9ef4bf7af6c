//! Fixed-size chunk pool carved from a single shard.
//!
//! The control block lives in the shard's handle slot. Chunks are handed
//! out bump-first (`top` grows until `capacity`), then recirculated through
//! an index free list threaded through each free chunk's first word.
//!
//! That first word is a union in time: a 32-bit `next` index while the
//! chunk sits in the live free list, and a `next_retired` pointer while it
//! sits on the pool's retired list. The two states never overlap; a
//! retired chunk only enters the free list after the owner drains it.

#![allow(unsafe_code)]

use std::cell::Cell;

use crate::list::ListEntry;
use crate::sync::retire::{RetireNodeOps, RetireReclaimEntry, RetireWord, RETIRED};
use crate::util::{align_up, is_ptr_aligned};

use super::shard_pool::ShardPool;

/// Sentinel index meaning "free list empty".
const NO_FREE_CHUNK: u32 = u32::MAX;

/// Chunk-pool control block. Fits in one 128-byte shard handle.
///
/// Field protocol: `retire.head` is shared; `retire.next` belongs to the
/// retirer that queued this pool; the first word of a retired chunk
/// belongs to the retirer that queued the chunk; everything else is
/// owner-thread only.
#[repr(C)]
pub struct ChunkPool {
    pub(crate) list_entry: ListEntry,
    top: Cell<u32>,
    head: Cell<u32>,
    count: Cell<u32>,
    capacity: u32,
    memory_size: u32,
    chunk_size: u32,
    chunk_alignment: u32,
    /// Nonzero when the chunk stride is a power of two.
    chunk_size_log2: u32,
    memory: *mut u8,
    /// Owning shard pool (weak); the retire chain climbs through it.
    shard_pool: *mut ShardPool,
    pub(crate) retire: RetireReclaimEntry,
}

const _: () = assert!(std::mem::size_of::<ChunkPool>() <= 128);

// SAFETY: see the field protocol above.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

struct ChunkRetireOps;

unsafe impl RetireNodeOps for ChunkRetireOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ()) {
        // A retired chunk's first word is the next-retired pointer.
        (node as *mut *mut ()).write(next);
    }
}

impl ChunkPool {
    /// Constructs a pool in place in `handle` (a shard handle slot) over
    /// the shard's `memory`.
    ///
    /// # Safety
    /// `handle` must be a writable control block; `memory` must cover
    /// `memory_size` committed bytes aligned to `chunk_alignment`; both
    /// outlive the pool. `shard_pool` must be the pool's hosting shard
    /// pool.
    pub unsafe fn create(
        handle: *mut u8,
        memory: *mut u8,
        memory_size: u32,
        chunk_size: u32,
        chunk_alignment: u32,
        shard_pool: *mut ShardPool,
    ) -> *mut ChunkPool {
        debug_assert!(chunk_alignment.is_power_of_two());
        debug_assert!(is_ptr_aligned(memory, chunk_alignment as u64));
        debug_assert!(chunk_size >= 4, "chunk must hold a free-list link");
        debug_assert!(memory_size >= chunk_size);

        let stride = align_up(chunk_size as u64, chunk_alignment as u64) as u32;
        let capacity = memory_size / stride;
        let pool = handle as *mut ChunkPool;
        pool.write(ChunkPool {
            list_entry: ListEntry::new(),
            top: Cell::new(0),
            head: Cell::new(NO_FREE_CHUNK),
            count: Cell::new(0),
            capacity,
            memory_size,
            chunk_size,
            chunk_alignment,
            chunk_size_log2: if stride.is_power_of_two() {
                stride.trailing_zeros()
            } else {
                0
            },
            memory,
            shard_pool,
            retire: RetireReclaimEntry::new(0),
        });
        pool
    }

    /// Recovers the pool from its embedded list entry.
    ///
    /// # Safety
    /// `entry` must be the `list_entry` field of a live `ChunkPool`.
    pub unsafe fn from_list_entry(entry: *mut ListEntry) -> *mut ChunkPool {
        let offset = std::mem::offset_of!(ChunkPool, list_entry);
        (entry as *mut u8).sub(offset) as *mut ChunkPool
    }

    fn stride(&self) -> u32 {
        if self.chunk_size_log2 != 0 {
            1 << self.chunk_size_log2
        } else {
            align_up(self.chunk_size as u64, self.chunk_alignment as u64) as u32
        }
    }

    fn index_to_chunk(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: index * stride < memory_size.
        unsafe { self.memory.add((index * self.stride()) as usize) }
    }

    fn chunk_to_index(&self, chunk: *const u8) -> u32 {
        debug_assert!(self.owns_chunk(chunk));
        let offset = (chunk as usize - self.memory as usize) as u32;
        if self.chunk_size_log2 != 0 {
            offset >> self.chunk_size_log2
        } else {
            offset / self.stride()
        }
    }

    /// True when `chunk` is a chunk boundary inside this pool's memory.
    pub fn owns_chunk(&self, chunk: *const u8) -> bool {
        let base = self.memory as usize;
        let addr = chunk as usize;
        addr >= base
            && addr < base + self.memory_size as usize
            && (addr - base) % self.stride() as usize == 0
    }

    /// Hands out one chunk: free list first, then the bump cursor.
    pub fn acquire(&self) -> *mut u8 {
        let head = self.head.get();
        if head != NO_FREE_CHUNK {
            let chunk = self.index_to_chunk(head);
            // SAFETY: a free-listed chunk's first word is its next link.
            let next = unsafe { (chunk as *const u32).read() };
            self.head.set(next);
            self.count.set(self.count.get() + 1);
            return chunk;
        }
        if self.top.get() < self.capacity {
            let chunk = self.index_to_chunk(self.top.get());
            self.top.set(self.top.get() + 1);
            self.count.set(self.count.get() + 1);
            return chunk;
        }
        std::ptr::null_mut()
    }

    /// Returns a chunk to the free list. Owner-thread only.
    pub fn release(&self, chunk: *mut u8) {
        assert!(self.owns_chunk(chunk), "foreign pointer released to pool");
        // SAFETY: the chunk is dead; its first word becomes the link.
        unsafe { (chunk as *mut u32).write(self.head.get()) };
        self.head.set(self.chunk_to_index(chunk));
        self.count.set(self.count.get() - 1);
    }

    /// No live chunks; the pool (and its shard) can be released.
    pub fn empty(&self) -> bool {
        self.count.get() == 0
    }

    /// Every chunk is live; nothing to acquire.
    pub fn full(&self) -> bool {
        self.count.get() == self.capacity
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn shard_pool(&self) -> *mut ShardPool {
        self.shard_pool
    }

    pub fn memory(&self) -> *mut u8 {
        self.memory
    }

    /// Non-owner side of a cross-thread free: queues the chunk on this
    /// pool's retired list. Returns the flags observed before queuing;
    /// `RETIRED` set means the pool is already chained (or being drained)
    /// and the caller stops climbing.
    ///
    /// # Safety
    /// `chunk` must be a live allocation of this pool that the retirer
    /// exclusively owns.
    pub unsafe fn retire_chunk(&self, chunk: *mut u8) -> u64 {
        debug_assert!(self.owns_chunk(chunk));
        self.retire.head.retire_ptr(chunk as *mut (), &ChunkRetireOps)
    }

    /// Owner side: drains the retired chunks into the free list, looping
    /// until the retired flag can be cleared so no chunk queued during the
    /// drain is stranded behind a stale flag.
    pub fn reclaim_chunks(&self) {
        loop {
            let word: RetireWord = self.retire.head.reclaim();
            let mut cursor = word.ptr() as *mut u8;
            while !cursor.is_null() {
                // SAFETY: retired chunks carry their next pointer in the
                // first word; read it before release overwrites it.
                let next = unsafe { (cursor as *const *mut u8).read() };
                self.release(cursor);
                cursor = next;
            }
            if self.retire.head.try_reset_flags(RETIRED) {
                return;
            }
        }
    }
}
