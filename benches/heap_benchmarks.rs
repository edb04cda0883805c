//! Performance benchmarks for allocation, collection and frame access

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use frameheap::{Heap, HeapConfig, Symbol, Value};
use std::hint::black_box;

fn heap(slots: usize) -> Heap {
    Heap::new(HeapConfig::with_arena_slots(slots)).unwrap()
}

fn allocation_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    for len in [0usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("array", len), &len, |b, &len| {
            let mut heap = heap(1 << 20);
            b.iter(|| black_box(heap.allocate_array(Value::Nil, len).unwrap()));
        });
    }

    group.bench_function("binary_256", |b| {
        let mut heap = heap(1 << 20);
        b.iter(|| black_box(heap.allocate_binary(Value::Nil, 256).unwrap()));
    });

    // Small arena so allocation keeps running into collections.
    group.bench_function("array_under_pressure", |b| {
        let mut heap = heap(4096);
        b.iter(|| black_box(heap.allocate_array(Value::Nil, 30).unwrap()));
    });

    group.finish();
}

/// Builds a heap holding `live` rooted arrays interleaved with garbage.
fn populated_heap(live: usize) -> Heap {
    let mut heap = heap(live * 24 + 1024);
    let mut previous = None;
    for i in 0..live {
        let array = heap.allocate_array(Value::Int(i as i64), 4).unwrap();
        if let Some(root) = previous {
            let previous = heap.root(root).unwrap();
            heap.set_slot(array, 0, previous).unwrap();
        }
        previous = Some(heap.add_root(array).unwrap());
        heap.allocate_binary(Value::Nil, 40).unwrap();
    }
    heap
}

fn collection_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection");

    for live in [100usize, 1000, 10_000] {
        group.bench_with_input(BenchmarkId::new("compacting", live), &live, |b, &live| {
            b.iter_batched(
                || populated_heap(live),
                |mut heap| black_box(heap.collect().unwrap()),
                BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("already_compact", live), &live, |b, &live| {
            let mut heap = populated_heap(live);
            heap.collect().unwrap();
            b.iter(|| black_box(heap.collect().unwrap()));
        });
    }

    group.finish();
}

fn frame_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");
    let tags: Vec<Value> = (0..32).map(|n| Value::Symbol(Symbol(n))).collect();

    group.bench_function("frame_set_32_tags", |b| {
        b.iter_batched(
            || heap(1 << 16),
            |mut heap| {
                let mut frame = heap.allocate_frame().unwrap();
                for &tag in &tags {
                    frame = heap.frame_set(frame, tag, Value::True).unwrap();
                }
                black_box(frame)
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("frame_lookup_last_tag", |b| {
        let mut heap = heap(1 << 16);
        let mut frame = heap.allocate_frame().unwrap();
        for &tag in &tags {
            frame = heap.frame_set(frame, tag, Value::True).unwrap();
        }
        let last = tags[tags.len() - 1];
        b.iter(|| black_box(heap.frame_lookup(frame, black_box(last)).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    allocation_benchmarks,
    collection_benchmarks,
    frame_benchmarks
);
criterion_main!(benches);
