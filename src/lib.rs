//! # SemaDB Core
//!
//! Disk-backed multi-index document and vector search engine core.
//!
//! A single [`shard::Shard`] owns one schema-defined collection's worth of
//! points: a transactional byte-bucket [`store::Store`], a recyclable node
//! id allocator, an optional vector store (flat or quantized), and an
//! optional Vamana-style approximate nearest-neighbour graph shared across
//! concurrent transactions via a [`cache::SharedCacheManager`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use semadb_core::config::{CollectionSchema, IndexSchemaValue, GraphParameters, QuantizerSpec};
//! use semadb_core::distance::DistanceMetric;
//! use semadb_core::point::Point;
//! use semadb_core::value::Value;
//! use semadb_core::shard::{Shard, CancellationToken, SearchRequest};
//!
//! let mut schema = CollectionSchema::default();
//! schema.index_schema.insert(
//!     "embedding".to_string(),
//!     IndexSchemaValue::VectorVamana {
//!         vector_length: 3,
//!         metric: DistanceMetric::Euclidean,
//!         parameters: GraphParameters::default(),
//!         quantizer: QuantizerSpec::None,
//!     },
//! );
//!
//! let shard = Shard::open_in_memory(schema)?;
//! let id = uuid::Uuid::new_v4();
//! shard.insert_points(
//!     &[Point::new(id, vec![0.1, 0.2, 0.3], Value::Null)],
//!     &CancellationToken::new(),
//! )?;
//! let hits = shard.search_points(&SearchRequest {
//!     vector: vec![0.1, 0.2, 0.3],
//!     limit: 10,
//!     search_size: None,
//!     select: vec![],
//! })?;
//! # Ok::<(), semadb_core::error::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod distance;
pub mod error;
pub mod graph;
pub mod id_counter;
pub mod point;
pub mod point_store;
pub mod shard;
pub mod store;
pub mod value;
pub mod vector_store;

pub use config::CollectionSchema;
pub use distance::DistanceMetric;
pub use error::{Error, Result};
pub use point::{Point, SearchResult};
pub use shard::{CancellationToken, SearchRequest, Shard, ShardInfo};
pub use value::Value;
