//! Cross-thread retire/reclaim: the fast-arena scenario and the
//! retire-exactly-once property under concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use stratalloc_core::arena::{FastArena, RetiredArenas};
use stratalloc_core::sync::retire::{RetireHead, RetireNodeOps, RETIRED};
use stratalloc_core::util::align_up;

/// Standalone arena backing shared across threads.
struct ArenaBacking {
    _block: Box<[u8]>,
    _memory: Vec<u8>,
    arena: *mut FastArena,
}

unsafe impl Send for ArenaBacking {}
unsafe impl Sync for ArenaBacking {}

fn make_arena(memory_size: u64, alignment: u64) -> ArenaBacking {
    let mut block = vec![0u8; 128].into_boxed_slice();
    let mut memory = vec![0u8; memory_size as usize + alignment as usize];
    let base = align_up(memory.as_mut_ptr() as u64, alignment) as *mut u8;
    // SAFETY: backing outlives the arena.
    let arena = unsafe {
        FastArena::create(
            block.as_mut_ptr(),
            0xD000usize as *const (),
            base,
            memory_size,
            alignment,
        )
    };
    ArenaBacking {
        _block: block,
        _memory: memory,
        arena,
    }
}

/// Scenario: the owner allocates 4 objects of 128 bytes at alignment 64;
/// another thread retires all of them in parallel; the owner reclaims the
/// arena exactly once, drains it, and sees `freed == 512` and a resettable
/// arena.
#[test]
fn test_cross_thread_retire_scenario() {
    let root = Arc::new(RetiredArenas::new());
    let backing = Arc::new(make_arena(65536, 64));
    let arena = backing.arena;

    // Owner side: 4 allocations.
    let ptrs: Vec<usize> = (0..4)
        .map(|_| {
            // SAFETY: arena is alive; single-threaded at this point.
            let ptr = unsafe { (*arena).acquire(128) };
            assert!(!ptr.is_null());
            ptr as usize
        })
        .collect();

    // Remote side: retire each allocation from worker threads.
    let workers: Vec<_> = ptrs
        .iter()
        .map(|&ptr| {
            let root = root.clone();
            let backing = backing.clone();
            thread::spawn(move || {
                // SAFETY: the arena outlives the workers; retiring a live
                // allocation is the non-owner protocol.
                unsafe { root.retire(backing.arena, ptr as *const u8, 128) };
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Owner side: the arena comes back exactly once.
    unsafe {
        let mut list = root.reclaim();
        let reclaimed = list.pop().expect("the arena was retired");
        assert_eq!(reclaimed, arena);
        assert!(list.pop().is_none(), "arena queued more than once");

        (*reclaimed).reclaim_allocations();
        assert_eq!((*reclaimed).freed(), 512);
        assert!((*reclaimed).resettable());
        (*reclaimed).reset();
        assert!((*reclaimed).empty());
    }
}

/// Many remote threads retire into one arena concurrently; the owner
/// drains concurrently. No byte may be lost or applied twice.
#[test]
fn test_concurrent_retire_data_conserves_bytes() {
    let retires_per_thread = if cfg!(debug_assertions) { 2_000 } else { 20_000 };
    let threads = 4;
    let backing = Arc::new(make_arena(1 << 21, 16));
    let arena = backing.arena;

    // Pre-fill the arena so every retired size has a matching allocation.
    let total_bytes = (threads * retires_per_thread * 16) as u64;
    // SAFETY: single-threaded setup.
    unsafe {
        let ptr = (*arena).acquire(total_bytes);
        assert!(!ptr.is_null());
    }

    let barrier = Arc::new(Barrier::new(threads + 1));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let backing = backing.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..retires_per_thread {
                    // SAFETY: the base pointer stays inside the arena.
                    unsafe {
                        (*backing.arena).retire_allocation((*backing.arena).base(), 16);
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    // Owner drains while retirers run; the final drain happens after the
    // join so nothing stays queued.
    for _ in 0..100 {
        // SAFETY: owner-side drain.
        unsafe { (*arena).reclaim_allocations() };
        std::hint::spin_loop();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    unsafe {
        (*arena).reclaim_allocations();
        assert_eq!((*arena).freed(), total_bytes);
        assert!((*arena).resettable());
    }
}

// ---------------------------------------------------------------------
// Retire-exactly-once over raw retire heads
// ---------------------------------------------------------------------

#[repr(C, align(16))]
struct Resource {
    next: AtomicUsize,
    id: usize,
}

struct ResourceOps;

unsafe impl RetireNodeOps for ResourceOps {
    unsafe fn set_next(&self, node: *mut (), next: *mut ()) {
        (*(node as *mut Resource))
            .next
            .store(next as usize, Ordering::Relaxed);
    }
}

/// Property: between two reclaims a node is retired at most once, and the
/// reclaimed list contains each retired node exactly once, even with
/// many concurrent retirers.
#[test]
fn test_retire_exactly_once_concurrent() {
    let per_thread = if cfg!(debug_assertions) { 5_000 } else { 50_000 };
    let threads = 4;
    let total = threads * per_thread;

    let head = Arc::new(RetireHead::new(0));
    let resources: Arc<Vec<Resource>> = Arc::new(
        (0..total)
            .map(|id| Resource {
                next: AtomicUsize::new(0),
                id,
            })
            .collect(),
    );

    let done = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let head = head.clone();
            let resources = resources.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    let node = &resources[t * per_thread + i] as *const Resource as *mut ();
                    // SAFETY: each resource is retired exactly once; the
                    // backing vector outlives the reclaimer.
                    unsafe { head.retire_ptr(node, &ResourceOps) };
                }
                done.fetch_add(1, Ordering::Release);
            })
        })
        .collect();

    // Reclaimer drains concurrently.
    let mut seen = vec![false; total];
    let mut count = 0;
    while count < total {
        let word = head.reclaim();
        let mut cursor = word.ptr() as *mut Resource;
        while !cursor.is_null() {
            // SAFETY: reclaimed nodes are exclusively ours.
            let (id, next) = unsafe {
                (
                    (*cursor).id,
                    (*cursor).next.load(Ordering::Relaxed) as *mut Resource,
                )
            };
            assert!(!seen[id], "resource {id} reclaimed twice");
            seen[id] = true;
            count += 1;
            cursor = next;
        }
        if count == total {
            break;
        }
        std::hint::spin_loop();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(head.try_reset_flags(RETIRED));
    assert!(seen.iter().all(|&s| s));
}
