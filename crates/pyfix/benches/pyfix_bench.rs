//! Benchmarks for the hot non-interpreter paths: cache keys, serialization
//! bounding, and syntax validation (cold and memoized).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pyfix::serialize::bounded_repr;
use pyfix::{FixCache, SafeCompiler};

const SAMPLE_SOURCE: &str = "\
def normalize(values):
    total = sum(values)
    return [v / total for v in values]

data = [1, 2, 3, 4, 5]
print(normalize(data))
";

fn bench_cache_key(c: &mut Criterion) {
    c.bench_function("cache_key_sha256", |b| {
        b.iter(|| {
            FixCache::cache_key(
                black_box(SAMPLE_SOURCE),
                black_box("ZeroDivisionError: division by zero"),
            )
        })
    });
}

fn bench_bounded_repr(c: &mut Criterion) {
    let long_repr = format!("[{}]", "'item', ".repeat(500));
    c.bench_function("bounded_repr_short", |b| {
        b.iter(|| bounded_repr(black_box("[1, 2, 3]")))
    });
    c.bench_function("bounded_repr_truncating", |b| {
        b.iter(|| bounded_repr(black_box(&long_repr)))
    });
}

fn bench_validate_syntax(c: &mut Criterion) {
    let compiler = SafeCompiler::new();
    c.bench_function("validate_syntax_memoized", |b| {
        // After the first iteration this measures the LRU fast path.
        b.iter(|| compiler.validate_syntax(black_box(SAMPLE_SOURCE)))
    });
}

criterion_group!(
    benches,
    bench_cache_key,
    bench_bounded_repr,
    bench_validate_syntax
);
criterion_main!(benches);
