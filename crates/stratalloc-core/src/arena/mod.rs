//! Fast-arena allocator: bump arenas over region chunks, the per-thread
//! 2-D bin table that recycles them, and the retire/reclaim root for
//! cross-thread frees at allocation granularity.

mod bins;
mod fast_arena;
mod retired;

pub use bins::{ArenaAcquire, FastArenaBins};
pub use fast_arena::FastArena;
pub use retired::{ArenaReclaimList, RetiredArenas};
