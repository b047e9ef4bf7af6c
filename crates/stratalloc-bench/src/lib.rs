//! Benchmark crate; see `benches/alloc_bench.rs`.
