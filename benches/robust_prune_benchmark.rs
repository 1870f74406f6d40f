//! Benchmark for the Vamana robust-prune neighbour selection step.
//!
//! Run with: `cargo bench --bench robust_prune_benchmark`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use semadb_core::graph::GraphIndex;

fn vector(dim: usize, seed: u64) -> Vec<f32> {
    (0..dim).map(|i| ((seed as f32 + i as f32) * 0.37).sin()).collect()
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

fn candidate_pool(dim: usize, point: &[f32], n: usize) -> Vec<(u64, f32, Vec<f32>)> {
    (2..2 + n as u64)
        .map(|id| {
            let v = vector(dim, id);
            let dist = euclidean(point, &v);
            (id, dist, v)
        })
        .collect()
}

fn bench_robust_prune(c: &mut Criterion) {
    let dim = 128;
    let graph = GraphIndex::new(75, 64, 1.2);
    let point_vec = vector(dim, 1);
    let pool = candidate_pool(dim, &point_vec, 200);
    let candidates: Vec<(u64, f32)> = pool.iter().map(|(id, dist, _)| (*id, *dist)).collect();

    c.bench_function("robust_prune_200_candidates_degree64", |b| {
        b.iter(|| {
            let pairwise_distance = |a: u64, bid: u64| -> f32 {
                let va = &pool.iter().find(|(id, _, _)| *id == a).unwrap().2;
                let vb = &pool.iter().find(|(id, _, _)| *id == bid).unwrap().2;
                euclidean(va, vb)
            };
            let pruned = graph.robust_prune(1, candidates.clone(), pairwise_distance);
            black_box(pruned);
        });
    });
}

criterion_group!(benches, bench_robust_prune);
criterion_main!(benches);
