//! Benchmarks for network contraction
//!
//! Measures the three query paths on grid-shaped pairwise models:
//! - forward real contraction (partition function)
//! - forward plus adjoint pass (marginals)
//! - tropical forward plus decoding (MAP)

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use scirs2_core::ndarray::Array;
use std::hint::black_box;
use tensorinference::{ContractionOptions, Factor, TensorNetworkModel};

/// Pairwise model on a `side x side` grid with a fixed pseudo-random table.
fn grid_model(side: usize, card: usize, parallel: bool) -> TensorNetworkModel {
    let var = |r: usize, c: usize| r * side + c;
    let table = |seed: usize| {
        let values: Vec<f64> = (0..card * card)
            .map(|i| 0.5 + ((seed * 31 + i * 17) % 13) as f64 / 13.0)
            .collect();
        Array::from_shape_vec(vec![card, card], values).unwrap().into_dyn()
    };

    let mut factors = Vec::new();
    for r in 0..side {
        for c in 0..side {
            if c + 1 < side {
                factors.push(Factor::new(vec![var(r, c), var(r, c + 1)], table(factors.len())).unwrap());
            }
            if r + 1 < side {
                factors.push(Factor::new(vec![var(r, c), var(r + 1, c)], table(factors.len())).unwrap());
            }
        }
    }
    let n = side * side;
    TensorNetworkModel::builder((0..n).collect(), vec![card; n], factors)
        .with_options(ContractionOptions::default().with_parallel(parallel))
        .build()
        .unwrap()
}

fn bench_probability(c: &mut Criterion) {
    let mut group = c.benchmark_group("probability");
    for side in [3, 4, 5] {
        for parallel in [false, true] {
            let model = grid_model(side, 2, parallel);
            let label = if parallel { "parallel" } else { "serial" };
            group.bench_with_input(BenchmarkId::new(label, side), &model, |b, model| {
                b.iter(|| black_box(model.probability().unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_marginals(c: &mut Criterion) {
    let mut group = c.benchmark_group("marginals");
    for side in [3, 4, 5] {
        let model = grid_model(side, 2, true);
        group.bench_with_input(BenchmarkId::from_parameter(side), &model, |b, model| {
            b.iter(|| black_box(model.marginals().unwrap()));
        });
    }
    group.finish();
}

fn bench_most_probable_config(c: &mut Criterion) {
    let mut group = c.benchmark_group("most_probable_config");
    for (side, card) in [(3, 2), (4, 2), (4, 3)] {
        let model = grid_model(side, card, true);
        group.bench_with_input(
            BenchmarkId::new(format!("card{}", card), side),
            &model,
            |b, model| {
                b.iter(|| black_box(model.most_probable_config().unwrap()));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_probability,
    bench_marginals,
    bench_most_probable_config
);
criterion_main!(benches);
