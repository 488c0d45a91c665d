//! Criterion benchmarks for the coordinate cache.
//!
//! Measures bulk `put` and random `get` throughput for every allocation
//! strategy over two id layouts: ascending ids as found in a sorted extract,
//! and ids scattered across the id space as in an append run.
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench --package middle-core
//! ```

// Criterion macros generate code that triggers missing_docs warnings.
#![allow(missing_docs, reason = "Criterion macros generate undocumented code")]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use middle_core::{
    AllocationStrategy, Coordinate, CoordinateCache, PersistentOverflowCache, PrimitiveId,
};
use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;

const BENCHMARK_SEED: u64 = 0x6f73_6d6d;
const POINTS: usize = 100_000;
const BUDGET: usize = 64 * 1024 * 1024;

const STRATEGIES: &[AllocationStrategy] = &[
    AllocationStrategy::Dense,
    AllocationStrategy::Sparse,
    AllocationStrategy::Chunked,
    AllocationStrategy::Combined,
];

fn coordinate(rng: &mut ChaCha8Rng) -> Coordinate {
    let x = rng.gen_range(-1_800_000_000..=1_800_000_000);
    let y = rng.gen_range(-900_000_000..=900_000_000);
    Coordinate::from_fixed(x, y).expect("generated inside range")
}

/// Ascending ids with small gaps, like a planet extract.
fn ascending(rng: &mut ChaCha8Rng) -> Vec<(PrimitiveId, Coordinate)> {
    let mut id = 1_000_000;
    (0..POINTS)
        .map(|_| {
            id += rng.gen_range(1..4);
            (id, coordinate(rng))
        })
        .collect()
}

/// Ids spread over the whole positive id space.
fn scattered(rng: &mut ChaCha8Rng) -> Vec<(PrimitiveId, Coordinate)> {
    (0..POINTS)
        .map(|_| (rng.gen_range(1..12_000_000_000), coordinate(rng)))
        .collect()
}

fn filled(strategy: AllocationStrategy, points: &[(PrimitiveId, Coordinate)]) -> CoordinateCache {
    let overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow file");
    let mut cache = CoordinateCache::new(strategy, BUDGET, overflow);
    for (id, location) in points {
        cache.put(*id, *location).expect("put");
    }
    cache
}

fn layouts() -> [(&'static str, Vec<(PrimitiveId, Coordinate)>); 2] {
    let mut rng = ChaCha8Rng::seed_from_u64(BENCHMARK_SEED);
    [("ascending", ascending(&mut rng)), ("scattered", scattered(&mut rng))]
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_put");
    group.throughput(Throughput::Elements(POINTS as u64));
    group.sample_size(20);

    for (layout, points) in layouts() {
        for &strategy in STRATEGIES {
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), layout),
                &points,
                |b, points| b.iter(|| filled(strategy, points)),
            );
        }
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get");
    group.throughput(Throughput::Elements(POINTS as u64));

    let mut rng = ChaCha8Rng::seed_from_u64(BENCHMARK_SEED ^ 1);
    for (layout, points) in layouts() {
        let mut lookups: Vec<_> = points.iter().map(|(id, _)| *id).collect();
        lookups.shuffle(&mut rng);
        for &strategy in STRATEGIES {
            let mut cache = filled(strategy, &points);
            group.bench_function(BenchmarkId::new(strategy.to_string(), layout), |b| {
                b.iter(|| {
                    lookups
                        .iter()
                        .filter(|id| matches!(cache.get(**id), Ok(Some(_))))
                        .count()
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
