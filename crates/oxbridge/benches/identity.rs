// Object identity and conversion benchmarks
//
// This benchmark suite measures:
// - Wrapping a pointer that already has a wrapper
// - Creating and dropping a wrapper
// - Converting host values to Foundation objects and back

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxbridge::bridge::{Value, ValueMap, ns_from_value, value_from_ns, wrap};
use oxbridge::runtime::{foundation, object};

/// Registry hit: the wrapper is shared
fn bench_wrap_existing(c: &mut Criterion) {
    let ptr = object::alloc_instance(foundation::classes().ns_object).unwrap();
    let held = wrap(ptr, true).unwrap();

    c.bench_function("wrap_existing", |b| {
        b.iter(|| black_box(wrap(ptr, false).unwrap()));
    });
    drop(held);
}

/// Registry miss: a wrapper is created, then dropped
fn bench_wrap_fresh(c: &mut Criterion) {
    let ptr = object::alloc_instance(foundation::classes().ns_object).unwrap();

    c.bench_function("wrap_fresh", |b| {
        b.iter(|| drop(black_box(wrap(ptr, false).unwrap())));
    });
    object::release(ptr);
}

/// Round trips through Foundation collections
fn bench_ns_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ns_round_trip");
    for size in [1usize, 16, 256] {
        let list = Value::List((0..size as i64).map(Value::Int).collect());
        let map = Value::Dict(
            ValueMap::from_pairs((0..size).map(|i| (format!("key{i}"), i as i64))).unwrap(),
        );
        group.bench_with_input(BenchmarkId::new("list", size), &list, |b, list| {
            b.iter(|| black_box(value_from_ns(&ns_from_value(list).unwrap()).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("dict", size), &map, |b, map| {
            b.iter(|| black_box(value_from_ns(&ns_from_value(map).unwrap()).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_wrap_existing, bench_wrap_fresh, bench_ns_round_trip);
criterion_main!(benches);
