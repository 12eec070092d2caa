// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocator throughput: small-block churn, medium-block churn, and value
// creation through the container layer.

use criterion::{criterion_group, criterion_main, Criterion};

use shmstore::{heap, value, Region, ThreadContext};

fn bench_small_churn(c: &mut Criterion) {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    c.bench_function("small_alloc_free_200B", |b| {
        b.iter(|| {
            let ptr = thread.alloc(200, 20).expect("alloc");
            heap::free_mem(thread.region(), ptr);
        })
    });
}

fn bench_medium_churn(c: &mut Criterion) {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    c.bench_function("medium_alloc_free_8K", |b| {
        b.iter(|| {
            let ptr = thread.alloc(8192, 20).expect("alloc");
            heap::free_mem(thread.region(), ptr);
        })
    });
}

fn bench_string_values(c: &mut Criterion) {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    c.bench_function("new_string_value", |b| {
        b.iter(|| {
            let ptr = value::new_string(&thread, "benchmark payload").expect("value");
            heap::free_mem(thread.region(), ptr);
        })
    });
}

criterion_group!(
    benches,
    bench_small_churn,
    bench_medium_churn,
    bench_string_values
);
criterion_main!(benches);
