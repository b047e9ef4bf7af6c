//! # stratalloc-core
//!
//! A multi-threaded general-purpose memory allocator built as a hierarchy
//! of specialized sub-allocators over one pre-reserved virtual address
//! range.
//!
//! The address space is cut into up to eight *regions*, each uniformly
//! partitioned into power-of-two *region-chunks* with a parallel array of
//! fixed-size metadata *handles*. Threads allocate through a per-thread
//! allocator that serves small and medium requests from bump *fast
//! arenas*, medium and large requests from fixed-size *chunk pools* carved
//! out of *shard pools*, and oversized requests straight from region
//! chunks. Freeing decodes the pointer back to its chunk and owner in
//! O(1); frees crossing thread boundaries ride a lock-free retire/reclaim
//! protocol, and allocators of dead threads rest in a *graveyard* until
//! another thread adopts them.
//!
//! All inter-thread coordination is lock-free: versioned free-list heads,
//! bump stacks, push/snatch lists and retire words, each a single atomic
//! machine word.

#![deny(unsafe_code)]

pub mod alloc;
pub mod arena;
pub mod backoff;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod graveyard;
pub mod handle;
pub mod list;
pub mod pool;
pub mod region;
pub mod substrate;
pub mod sync;
pub mod tla;
pub mod util;
pub mod vmem;

pub use alloc::{Allocator, ThreadAllocatorHandle};
pub use config::AllocatorConfig;
pub use error::ConfigError;
