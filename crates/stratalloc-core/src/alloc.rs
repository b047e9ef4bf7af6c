//! Process-level allocator: owns the substrate and the graveyard, hands
//! out per-thread allocator handles, and recycles parked allocators.
//!
//! A thread asking for its allocator first tries to adopt one parked in
//! the graveyard, picking up whatever retired work the dead thread left
//! behind, and only builds a fresh one when the graveyard comes up empty.
//! When a handle drops, the allocator behind it is torn down if nothing it
//! served is still live, or parked for the next adopter otherwise.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AllocatorConfig;
use crate::error::ConfigError;
use crate::graveyard::{GraveAcquireParams, ThreadGraveyard};
use crate::substrate::Substrate;
use crate::tla::{ThreadLocalAllocator, TlaGraveOps};

struct Shared {
    substrate: Arc<Substrate>,
    graveyard: ThreadGraveyard,
    config: AllocatorConfig,
    /// Per-thread scan seed so adopters spread over the grave slots.
    thread_seq: AtomicU32,
    /// Serializes sweep walks over the graveyard.
    sweep_lock: Mutex<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Destroy whatever is still parked; the chunk memory dies with the
        // substrate mappings, the control structures are heap boxes.
        // SAFETY: nothing else can reach the graveyard during drop.
        unsafe {
            while let Some(data) = self
                .graveyard
                .acquire(GraveAcquireParams::default(), &TlaGraveOps)
            {
                self.graveyard.release_thread(data);
                drop(Box::from_raw(data.thread as *mut ThreadLocalAllocator));
            }
        }
    }
}

/// The process-wide allocator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<Shared>,
}

impl Allocator {
    /// Validates `config`, reserves the address space and builds the
    /// allocator. The only fallible surface; runtime exhaustion shows up
    /// as null pointers from `allocate`.
    pub fn new(config: AllocatorConfig) -> Result<Allocator, ConfigError> {
        config.validate()?;
        let substrate = Arc::new(Substrate::reserve(&config)?);
        let graveyard = ThreadGraveyard::new(config.graveyard_slot_count);
        log::debug!(
            "allocator up: contention split {}, {} grave slots",
            config.contention_split,
            config.graveyard_slot_count
        );
        Ok(Allocator {
            shared: Arc::new(Shared {
                substrate,
                graveyard,
                config,
                thread_seq: AtomicU32::new(0),
                sweep_lock: Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.shared.config
    }

    /// Builds (or adopts) the calling thread's allocator.
    pub fn thread_allocator(&self) -> ThreadAllocatorHandle {
        let shared = &self.shared;
        let seed = shared.thread_seq.fetch_add(1, Ordering::Relaxed);
        let params = GraveAcquireParams {
            rounds: 1,
            start: seed,
            step: 1,
        };
        // SAFETY: every node in the graveyard is a parked Tla; slot
        // acquisition grants exclusive ownership.
        let adopted = unsafe { shared.graveyard.acquire(params, &TlaGraveOps) };
        if let Some(data) = adopted {
            let tla = data.thread as *mut ThreadLocalAllocator;
            // SAFETY: the slot exchange made this thread the exclusive
            // owner.
            unsafe {
                (*tla).mark_adopted();
                shared.graveyard.release_thread(data);
                (*tla).reclaim_retired();
            }
            log::debug!("adopted a parked thread allocator");
            return ThreadAllocatorHandle {
                allocator: self.clone(),
                tla,
            };
        }

        let tla = Box::into_raw(ThreadLocalAllocator::new(
            shared.substrate.clone(),
            &shared.config,
        ));
        ThreadAllocatorHandle {
            allocator: self.clone(),
            tla,
        }
    }

    /// Retires a thread's allocator: drains its retired work, then either
    /// tears it down (nothing live) or parks it for adoption.
    fn retire_thread(&self, tla: *mut ThreadLocalAllocator) {
        // SAFETY: called from the handle's drop; the dropping thread is
        // the exclusive owner.
        unsafe {
            (*tla).reclaim_retired();
            if (*tla).is_idle() {
                (*tla).teardown();
                drop(Box::from_raw(tla));
                log::debug!("idle thread allocator torn down");
                return;
            }
            (*tla).mark_parked();
            self.shared
                .graveyard
                .put_thread_to_rest(tla as *mut (), &TlaGraveOps);
            log::debug!("thread allocator parked with live allocations");
        }
    }

    /// Walks every parked allocator once: drains its retired work and
    /// tears it down when nothing live remains. Returns the number of
    /// allocators destroyed.
    pub fn sweep_graveyard(&self) -> usize {
        let shared = &self.shared;
        let _guard = shared.sweep_lock.lock();
        let mut kept = Vec::new();
        let mut destroyed = 0;
        // SAFETY: slot acquisition grants exclusivity per allocator; kept
        // allocators are re-parked below.
        unsafe {
            while let Some(data) = shared
                .graveyard
                .acquire(GraveAcquireParams::default(), &TlaGraveOps)
            {
                let tla = data.thread as *mut ThreadLocalAllocator;
                (*tla).reclaim_retired();
                if (*tla).is_idle() {
                    shared.graveyard.release_thread(data);
                    (*tla).teardown();
                    drop(Box::from_raw(tla));
                    destroyed += 1;
                } else {
                    kept.push(data);
                }
            }
            for data in kept {
                shared.graveyard.put_thread_back(data, &TlaGraveOps);
            }
        }
        if destroyed > 0 {
            log::debug!("graveyard sweep destroyed {destroyed} allocators");
        }
        destroyed
    }
}

/// A thread's entry point into the allocator. Not `Send`: the per-thread
/// structures behind it are only coherent from the owning thread.
pub struct ThreadAllocatorHandle {
    allocator: Allocator,
    tla: *mut ThreadLocalAllocator,
}

impl ThreadAllocatorHandle {
    /// Allocates `size` bytes aligned to `align`. Null means out of
    /// memory; no panic, no abort.
    pub fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        // SAFETY: the handle is !Send, so this is the owning thread.
        unsafe { (*self.tla).allocate(size as u64, align as u64) }
    }

    /// Frees an allocation of `size` bytes. The pointer may have been
    /// allocated by any thread of this allocator; frees of foreign
    /// pointers are ignored with a warning.
    pub fn deallocate(&self, ptr: *mut u8, size: usize) {
        // SAFETY: as for `allocate`; cross-thread owners are reached only
        // through their retire protocol.
        unsafe { (*self.tla).deallocate(ptr, size as u64) }
    }

    /// Drains everything other threads have retired to this thread.
    /// Called opportunistically by the allocation slow path; callers with
    /// idle periods can invoke it directly.
    pub fn reclaim_retired(&self) {
        // SAFETY: the handle is !Send, so this is the owning thread.
        unsafe { (*self.tla).reclaim_retired() }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }
}

impl Drop for ThreadAllocatorHandle {
    fn drop(&mut self) {
        self.allocator.retire_thread(self.tla);
    }
}
