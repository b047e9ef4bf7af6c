//! Configuration-time error reporting.
//!
//! Runtime allocation failure is expressed as a null pointer, never as an
//! error value; the only fallible surface is allocator construction.

use thiserror::Error;

/// Rejected allocator configuration. Creation returns this instead of the
/// allocator; nothing aborts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("number of regions must be in 1..=8, got {0}")]
    InvalidRegionCount(usize),
    #[error("region size and chunk size lists differ in length ({regions} vs {chunks})")]
    RegionChunkCountMismatch { regions: usize, chunks: usize },
    #[error("region size log2 {0} exceeds the supported maximum of 40")]
    RegionSizeTooLarge(u32),
    #[error("region chunk sizes must be unique and ascending")]
    ChunkSizesNotAscending,
    #[error("region chunk size log2 {chunk} exceeds its region size log2 {region}")]
    ChunkLargerThanRegion { chunk: u32, region: u32 },
    #[error("contention split {0} must be a power of two in 1..=16")]
    InvalidContentionSplit(u32),
    #[error("cacheline size {0} must be a power of two of at least 32")]
    InvalidCacheline(u64),
    #[error("control block size {0} must be a power of two of at least twice the cacheline")]
    InvalidControlBlock(u64),
    #[error("minimum allocation size/alignment must be powers of two of at least 16")]
    InvalidMinAlloc,
    #[error("graveyard slot count {0} must be a power of two in 1..=64")]
    InvalidGraveyardSlots(u32),
    #[error("fast-arena geometry invalid: {0}")]
    InvalidArenaGeometry(&'static str),
    #[error("pool geometry invalid: {0}")]
    InvalidPoolGeometry(&'static str),
    #[error("virtual memory reservation failed (os error {0})")]
    ReservationFailed(u64),
}
