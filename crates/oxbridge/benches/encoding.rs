// Type encoding benchmarks
//
// This benchmark suite measures:
// - Decoding with and without a cache hit
// - Encoding descriptors back to text
// - Struct conversion from host sequences

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxbridge::bridge::{Value, compound_value_for_sequence, decode, encode};

const ENCODINGS: [&str; 5] = [
    "q",
    "{CGPoint=dd}",
    "{CGRect={CGPoint=dd}{CGSize=dd}}",
    "[16{BenchPair=iq}]",
    "^{BenchNode=\"value\"q\"next\"^{BenchNode}}",
];

/// Every call after the first is a cache hit
fn bench_decode_cached(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_cached");
    for text in ENCODINGS {
        decode(text).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(text), &text, |b, text| {
            b.iter(|| black_box(decode(text).unwrap()));
        });
    }
    group.finish();
}

/// Fresh struct names defeat the cache
fn bench_decode_uncached(c: &mut Criterion) {
    let mut counter = 0usize;
    c.bench_function("decode_uncached", |b| {
        b.iter(|| {
            counter += 1;
            let text = format!("{{BenchFresh{counter}=dq{{?=ii}}[4c]}}");
            black_box(decode(&text).unwrap())
        });
    });
}

fn bench_encode(c: &mut Criterion) {
    let rect = decode("{CGRect={CGPoint=dd}{CGSize=dd}}").unwrap();
    c.bench_function("encode_rect", |b| {
        b.iter(|| black_box(encode(&rect)));
    });
}

/// Host sequences converted to struct values
fn bench_struct_from_sequence(c: &mut Criterion) {
    let rect = decode("{CGRect={CGPoint=dd}{CGSize=dd}}").unwrap();
    let seq = [
        Value::List(vec![Value::Float(0.0), Value::Float(1.0)]),
        Value::List(vec![Value::Float(10.0), Value::Float(20.0)]),
    ];
    c.bench_function("struct_from_sequence", |b| {
        b.iter(|| black_box(compound_value_for_sequence(&seq, &rect).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_decode_cached,
    bench_decode_uncached,
    bench_encode,
    bench_struct_from_sequence
);
criterion_main!(benches);
