use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use std::alloc::Layout;

use bedrock::alloc::temp::TempScope;
use bedrock::alloc::{Allocator, BumpAlloc, TlsfAlloc};

fn bench_bump(c: &mut Criterion) {
    let mut group = c.benchmark_group("bump");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("alloc_64b_x1000", |b| {
        let bump = BumpAlloc::with_reserve(64 * 1024 * 1024).unwrap();
        let layout = Layout::from_size_align(64, 16).unwrap();
        b.iter(|| {
            bump.reset();
            for _ in 0..1000 {
                black_box(bump.alloc(layout));
            }
        });
    });

    group.finish();
}

fn bench_temp(c: &mut Criterion) {
    let mut group = c.benchmark_group("temp");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("scope_alloc_64b_x1000", |b| {
        let layout = Layout::from_size_align(64, 16).unwrap();
        b.iter(|| {
            let scope = TempScope::push();
            for _ in 0..1000 {
                black_box(scope.alloc(layout));
            }
        });
    });

    group.finish();
}

fn bench_tlsf(c: &mut Criterion) {
    let mut group = c.benchmark_group("tlsf");
    group.throughput(Throughput::Elements(128));

    group.bench_function("alloc_free_mixed_x128", |b| {
        let tlsf = TlsfAlloc::with_capacity(16 * 1024 * 1024).unwrap();
        let sizes = [24usize, 64, 200, 1024, 4096, 96, 333, 8192];
        b.iter(|| {
            let mut ptrs = Vec::with_capacity(128);
            for i in 0..128 {
                let size = sizes[i % sizes.len()];
                let layout = Layout::from_size_align(size, 8).unwrap();
                ptrs.push((tlsf.alloc(layout), layout));
            }
            for (ptr, layout) in ptrs {
                unsafe { tlsf.dealloc(ptr, layout) };
            }
        });
    });

    group.bench_function("baseline_bumpalo_64b_x1000", |b| {
        b.iter(|| {
            let arena = bumpalo::Bump::new();
            for _ in 0..1000 {
                black_box(arena.alloc([0u8; 64]));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_bump, bench_temp, bench_tlsf);
criterion_main!(benches);
