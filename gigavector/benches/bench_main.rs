use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gigavector::db::Database;
use gigavector::distance::Distance;
use gigavector::index::IndexKind;

fn random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()).collect()
}

fn bench_distance_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("distance");
    for dim in [64usize, 256, 1024] {
        let vectors = random_vectors(2, dim, 1);
        let (a, b) = (&vectors[0], &vectors[1]);
        group.throughput(Throughput::Elements(dim as u64));
        for metric in [Distance::Euclidean, Distance::Cosine, Distance::DotProduct] {
            group.bench_with_input(
                BenchmarkId::new(metric.to_string(), dim),
                &dim,
                |bench, _| bench.iter(|| metric.compute(black_box(a), black_box(b))),
            );
        }
    }
    group.finish();
}

fn bench_flat_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_search");
    for count in [1_000usize, 10_000] {
        let db = Database::open_in_memory(64, IndexKind::Flat).expect("open");
        for v in random_vectors(count, 64, 2) {
            db.add_vector(&v).expect("add");
        }
        let query = random_vectors(1, 64, 3).remove(0);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |bench, _| {
            bench.iter(|| db.search(black_box(&query), 10, Distance::Euclidean).expect("search"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_distance_kernels, bench_flat_search);
criterion_main!(benches);
