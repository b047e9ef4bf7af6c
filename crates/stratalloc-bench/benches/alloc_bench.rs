//! Allocator benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use stratalloc_core::{Allocator, AllocatorConfig};

fn bench_config() -> AllocatorConfig {
    AllocatorConfig {
        region_sizes_log2: vec![28, 28, 28, 28],
        region_chunk_sizes_log2: vec![20, 21, 22, 23],
        contention_split: 4,
        ..AllocatorConfig::default()
    }
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    let allocator = Allocator::new(bench_config()).unwrap();
    let handle = allocator.thread_allocator();
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("stratalloc", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = handle.allocate(sz, 16);
                criterion::black_box(ptr);
                handle.deallocate(ptr, sz);
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    let allocator = Allocator::new(bench_config()).unwrap();
    let handle = allocator.thread_allocator();
    group.bench_function("stratalloc_1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<*mut u8> = (0..1000).map(|_| handle.allocate(64, 16)).collect();
            for &ptr in &ptrs {
                handle.deallocate(ptr, 64);
            }
        });
    });
    group.bench_function("system_1000x64B", |b| {
        b.iter(|| {
            let allocs: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 64]).collect();
            criterion::black_box(allocs);
        });
    });

    group.finish();
}

fn bench_cross_thread_free(c: &mut Criterion) {
    use std::sync::mpsc;

    let mut group = c.benchmark_group("cross_thread_free");
    group.sample_size(20);

    group.bench_function("retire_pipeline_4096x256B", |b| {
        b.iter(|| {
            let allocator = Allocator::new(bench_config()).unwrap();
            let (sender, receiver) = mpsc::sync_channel::<usize>(512);
            let consumer = {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    let handle = allocator.thread_allocator();
                    while let Ok(ptr) = receiver.recv() {
                        handle.deallocate(ptr as *mut u8, 256);
                    }
                })
            };
            let handle = allocator.thread_allocator();
            for _ in 0..4096 {
                let ptr = handle.allocate(256, 16);
                sender.send(ptr as usize).unwrap();
            }
            drop(sender);
            consumer.join().unwrap();
            handle.reclaim_retired();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_cross_thread_free
);
criterion_main!(benches);
