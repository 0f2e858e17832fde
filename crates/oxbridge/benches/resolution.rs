// Method resolution and dispatch benchmarks
//
// This benchmark suite measures:
// - Memoized sends to Foundation and host-defined methods
// - The cost of a cold lookup after a cache flush
// - Keyword calls through a bound partial
// - Multi-threaded sends to one receiver

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxbridge::bridge::{ClassBuilder, ObjCClass, ObjCInstance, Value, objc_instance};
use std::thread;

fn bench_class(name: &str) -> ObjCClass {
    let base = ObjCClass::named("NSObject").unwrap();
    ClassBuilder::new(name, &base)
        .auto_rename(true)
        .method("add:to:", "q@:qq", |_, args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(Value::Int(a + b))
        })
        .method("noop", "v@:", |_, _| Ok(Value::None))
        .register()
        .unwrap()
}

fn instance(class: &ObjCClass) -> ObjCInstance {
    objc_instance(&class.call("new", &[]).unwrap()).unwrap()
}

/// Repeated sends hit the memo table
fn bench_cached_send(c: &mut Criterion) {
    let class = bench_class("BenchCached");
    let obj = instance(&class);
    let array = objc_instance(&ObjCClass::named("NSMutableArray").unwrap().call("array", &[]).unwrap()).unwrap();

    let mut group = c.benchmark_group("cached_send");
    group.bench_function("host_noop", |b| {
        b.iter(|| black_box(obj.call("noop", &[]).unwrap()));
    });
    group.bench_function("host_add", |b| {
        b.iter(|| black_box(obj.call("add:to:", &[Value::Int(2), Value::Int(3)]).unwrap()));
    });
    group.bench_function("foundation_count", |b| {
        b.iter(|| black_box(array.call("count", &[]).unwrap()));
    });
    group.finish();
}

/// A flush forces the method table to be copied again
fn bench_cold_lookup(c: &mut Criterion) {
    let class = bench_class("BenchCold");
    let obj = instance(&class);

    c.bench_function("cold_lookup", |b| {
        b.iter(|| {
            class.flush_method_cache();
            black_box(obj.call("noop", &[]).unwrap())
        });
    });
}

/// Keyword calls resolve a selector from a keyword set
fn bench_partial_call(c: &mut Criterion) {
    let class = bench_class("BenchPartial");
    let obj = instance(&class);
    let partial = obj.partial("add").unwrap();

    c.bench_function("partial_call", |b| {
        b.iter(|| black_box(partial.call(Some(Value::Int(1)), &[("to", Value::Int(2))]).unwrap()));
    });
}

/// Several threads sending to one object
fn bench_concurrent_sends(c: &mut Criterion) {
    let class = bench_class("BenchConcurrent");
    let obj = instance(&class);

    let mut group = c.benchmark_group("concurrent_sends");
    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let obj = obj.clone();
                        thread::spawn(move || {
                            for _ in 0..100 {
                                black_box(obj.call("noop", &[]).unwrap());
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_cached_send,
    bench_cold_lookup,
    bench_partial_call,
    bench_concurrent_sends
);
criterion_main!(benches);
