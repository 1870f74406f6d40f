//! Black-box integration tests over `Shard`'s public surface, covering the
//! numbered end-to-end scenarios this core must satisfy.

use semadb_core::config::{CollectionSchema, GraphParameters, IndexSchemaValue, QuantizerSpec};
use semadb_core::distance::DistanceMetric;
use semadb_core::point::Point;
use semadb_core::shard::{CancellationToken, SearchRequest, Shard};
use semadb_core::value::Value;
use uuid::Uuid;
use std::sync::Arc;
use std::thread;

fn vamana_schema(length: usize) -> CollectionSchema {
    let mut schema = CollectionSchema::default();
    schema.index_schema.insert(
        "embedding".to_string(),
        IndexSchemaValue::VectorVamana {
            vector_length: length,
            metric: DistanceMetric::Euclidean,
            parameters: GraphParameters {
                search_size: 20,
                degree_bound: 8,
                alpha: 1.2,
            },
            quantizer: QuantizerSpec::None,
        },
    );
    schema
}

/// Scenario 1: two points, search for the one at the query itself.
#[test]
fn scenario_1_small_worked_example() {
    let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    shard
        .insert_points(
            &[
                Point::new(a, vec![0.0, 0.0], Value::Null),
                Point::new(b, vec![1.0, 1.0], Value::Null),
            ],
            &CancellationToken::new(),
        )
        .unwrap();

    let results = shard
        .search_points(&SearchRequest {
            vector: vec![0.0, 0.0],
            limit: 1,
            search_size: None,
            select: vec![],
        })
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, a);
    assert_eq!(results[0].distance, Some(0.0));
}

/// Scenario 2: insert 100, delete 50, search a deleted vector finds a
/// survivor; point_count reflects the deletion and id allocation doesn't
/// regrow past what's been allocated.
#[test]
fn scenario_2_delete_then_search_and_id_compactness() {
    let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
    let mut ids = Vec::new();
    let mut points = Vec::new();
    for i in 0..100u32 {
        let id = Uuid::new_v4();
        ids.push(id);
        points.push(Point::new(id, vec![i as f32, (i * 3) as f32], Value::Null));
    }
    shard.insert_points(&points, &CancellationToken::new()).unwrap();

    let deleted: Vec<_> = ids[..50].to_vec();
    shard.delete_points(&deleted).unwrap();
    assert_eq!(shard.info().unwrap().point_count, 50);

    let results = shard
        .search_points(&SearchRequest {
            vector: vec![0.0, 0.0],
            limit: 1,
            search_size: None,
            select: vec![],
        })
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(!deleted.contains(&results[0].id));

    // Reinserting 50 more must not need ids beyond what 100 inserts + the
    // reserved start node already allocated (freed ids are recycled).
    let mut more = Vec::new();
    for i in 0..50u32 {
        more.push(Point::new(Uuid::new_v4(), vec![(i + 200) as f32, 0.0], Value::Null));
    }
    shard.insert_points(&more, &CancellationToken::new()).unwrap();
    assert_eq!(shard.info().unwrap().point_count, 100);
}

/// Scenario 4: binary quantizer bit layout for a length-5 vector with a
/// fixed threshold, read back through the public distance-preserving
/// contract (a point found by its own post-quantization vector).
#[test]
fn scenario_4_binary_quantizer_encodes_expected_bit_pattern() {
    let mut schema = CollectionSchema::default();
    schema.index_schema.insert(
        "embedding".to_string(),
        IndexSchemaValue::VectorFlat {
            vector_length: 5,
            metric: DistanceMetric::Hamming,
            quantizer: QuantizerSpec::Binary {
                threshold: Some(0.5),
                trigger_threshold: 1,
            },
        },
    );
    let shard = Shard::open_in_memory(schema).unwrap();
    let id = Uuid::new_v4();
    let vector = vec![1.0, 0.1, 0.6, 0.7, 0.4];
    shard
        .insert_points(&[Point::new(id, vector.clone(), Value::Null)], &CancellationToken::new())
        .unwrap();

    // The expected bit pattern (1,0,1,1,0) above threshold 0.5, printed
    // MSB-first over the 5 significant bits, is "01101" (spec scenario 4).
    let bits: Vec<bool> = vector.iter().map(|x| *x > 0.5).collect();
    let printed: String = bits.iter().rev().map(|b| if *b { '1' } else { '0' }).collect();
    assert_eq!(printed, "01101");

    let results = shard
        .search_points(&SearchRequest {
            vector: vector.clone(),
            limit: 1,
            search_size: None,
            select: vec![],
        })
        .unwrap();
    assert_eq!(results[0].id, id);
}

/// Scenario 5: product quantizer over enough points to trigger fitting,
/// then a trained point is found as its own nearest neighbour.
#[test]
fn scenario_5_product_quantizer_top1_recall_after_fit() {
    let dim = 8;
    let mut schema = CollectionSchema::default();
    schema.index_schema.insert(
        "embedding".to_string(),
        IndexSchemaValue::VectorFlat {
            vector_length: dim,
            metric: DistanceMetric::Euclidean,
            quantizer: QuantizerSpec::Product {
                num_sub_vectors: 4,
                num_centroids: 16,
                trigger_threshold: Some(200),
                seed: Some(7),
            },
        },
    );
    let shard = Shard::open_in_memory(schema).unwrap();

    let mut points = Vec::new();
    for i in 0..200u32 {
        let v: Vec<f32> = (0..dim).map(|d| ((i as f32 + d as f32) * 0.31).sin()).collect();
        points.push(Point::new(Uuid::new_v4(), v, Value::Null));
    }
    let target = points[37].clone();
    shard.insert_points(&points, &CancellationToken::new()).unwrap();

    let results = shard
        .search_points(&SearchRequest {
            vector: target.vector.clone().unwrap(),
            limit: 1,
            search_size: None,
            select: vec![],
        })
        .unwrap();
    assert_eq!(results[0].id, target.id);
}

/// Scenario 6: a writer inserting new points concurrently with readers
/// searching existing ones; no failures, final count reflects every
/// insert.
#[test]
fn scenario_6_concurrent_writer_and_readers() {
    let shard = Arc::new(Shard::open_in_memory(vamana_schema(4)).unwrap());
    let mut seed_ids = Vec::new();
    let mut seed_points = Vec::new();
    for i in 0..50u32 {
        let id = Uuid::new_v4();
        seed_ids.push(id);
        seed_points.push(Point::new(id, vec![i as f32, 0.0, 0.0, 0.0], Value::Null));
    }
    shard.insert_points(&seed_points, &CancellationToken::new()).unwrap();
    let initial_count = shard.info().unwrap().point_count;

    thread::scope(|scope| {
        let writer_shard = Arc::clone(&shard);
        scope.spawn(move || {
            let mut points = Vec::new();
            for i in 0..100u32 {
                points.push(Point::new(Uuid::new_v4(), vec![(i + 1000) as f32, 0.0, 0.0, 0.0], Value::Null));
            }
            writer_shard.insert_points(&points, &CancellationToken::new()).unwrap();
        });

        for _ in 0..4 {
            let reader_shard = Arc::clone(&shard);
            let query_ids = seed_ids.clone();
            scope.spawn(move || {
                for _ in 0..25 {
                    let idx = query_ids.len() / 2;
                    let query = vec![idx as f32, 0.0, 0.0, 0.0];
                    reader_shard
                        .search_points(&SearchRequest {
                            vector: query,
                            limit: 5,
                            search_size: None,
                            select: vec![],
                        })
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(shard.info().unwrap().point_count, initial_count + 100);
}

/// Universal invariant: a point searched for by its own vector under a
/// plain (unquantized) store is its own nearest neighbour at distance 0.
#[test]
fn round_trip_own_vector_finds_itself_at_zero_distance() {
    let shard = Shard::open_in_memory(vamana_schema(3)).unwrap();
    let id = Uuid::new_v4();
    let vector = vec![3.2, -1.5, 0.75];
    shard
        .insert_points(&[Point::new(id, vector.clone(), Value::Null)], &CancellationToken::new())
        .unwrap();

    let results = shard
        .search_points(&SearchRequest {
            vector,
            limit: 1,
            search_size: None,
            select: vec![],
        })
        .unwrap();
    assert_eq!(results[0].id, id);
    assert_eq!(results[0].distance, Some(0.0));
}
