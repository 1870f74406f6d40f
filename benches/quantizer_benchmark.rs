//! Benchmark for insert-triggered vector quantization (spec §4.4).
//!
//! Run with: `cargo bench --bench quantizer_benchmark`

use criterion::{criterion_group, criterion_main, Criterion};
use semadb_core::config::{CollectionSchema, GraphParameters, IndexSchemaValue, QuantizerSpec};
use semadb_core::distance::DistanceMetric;
use semadb_core::point::Point;
use semadb_core::shard::{CancellationToken, Shard};
use semadb_core::value::Value;
use uuid::Uuid;

fn generate_vector(dim: usize, seed: u64) -> Vec<f32> {
    (0..dim).map(|i| ((seed as f32 + i as f32) * 0.23).sin()).collect()
}

fn schema_with(dim: usize, quantizer: QuantizerSpec) -> CollectionSchema {
    let mut schema = CollectionSchema::default();
    schema.index_schema.insert(
        "embedding".to_string(),
        IndexSchemaValue::VectorVamana {
            vector_length: dim,
            metric: DistanceMetric::Euclidean,
            parameters: GraphParameters::default(),
            quantizer,
        },
    );
    schema
}

fn points(dim: usize, count: u64) -> Vec<Point> {
    (0..count)
        .map(|i| Point::new(Uuid::new_v4(), generate_vector(dim, i), Value::Null))
        .collect()
}

fn bench_binary_quantizer_fit(c: &mut Criterion) {
    let dim = 256;
    let quantizer = QuantizerSpec::Binary {
        threshold: None,
        trigger_threshold: 500,
    };

    c.bench_function("binary_quantizer_fit_on_500_inserts", |b| {
        b.iter_batched(
            || (Shard::open_in_memory(schema_with(dim, quantizer.clone())).unwrap(), points(dim, 500)),
            |(shard, batch)| {
                shard.insert_points(&batch, &CancellationToken::new()).unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_product_quantizer_fit(c: &mut Criterion) {
    let dim = 256;
    let quantizer = QuantizerSpec::Product {
        num_sub_vectors: 8,
        num_centroids: 16,
        trigger_threshold: Some(500),
        seed: Some(7),
    };

    c.bench_function("product_quantizer_fit_on_500_inserts", |b| {
        b.iter_batched(
            || (Shard::open_in_memory(schema_with(dim, quantizer.clone())).unwrap(), points(dim, 500)),
            |(shard, batch)| {
                shard.insert_points(&batch, &CancellationToken::new()).unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_binary_quantizer_fit, bench_product_quantizer_fit);
criterion_main!(benches);
