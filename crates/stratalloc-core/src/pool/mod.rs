//! Chunk & shard pool allocator: fixed-size chunk pools carved from shard
//! memory, shards carved from region chunks by a shard-pool-of-pools, and
//! the three-level retire chain (chunk → chunk pool → shard pool → thread
//! root) for cross-thread frees.

mod bins;
mod chunk_pool;
mod retired;
mod shard_pool;

pub use bins::{PoolBin, PoolBins};
pub use chunk_pool::ChunkPool;
pub use retired::{RetiredPools, ShardPoolReclaimList};
pub use shard_pool::{PoolShard, ShardPool};
