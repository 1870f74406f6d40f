//! Collection schema and shard configuration (spec §6).
//!
//! A [`CollectionSchema`] is supplied by the collaborator that owns schema
//! validation and user-plan enforcement (out of scope here, spec §1); this
//! crate only validates that the schema itself is internally consistent and
//! that incoming point data is compatible with it before insertion.
//!
//! Layered loading follows the teacher's convention: programmatic defaults,
//! overridden by a TOML file, overridden by `SEMADB_`-prefixed environment
//! variables.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::distance::DistanceMetric;

/// Configuration errors, distinct from the runtime [`crate::error::Error`]
/// taxonomy since these occur before a shard exists.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse a configuration source.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Why it's invalid.
        message: String,
    },

    /// Underlying IO error loading a config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-property index declaration (spec §6 `IndexSchemaValue`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum IndexSchemaValue {
    /// A Vamana-style ANN graph index over a vector property.
    VectorVamana {
        /// Fixed vector length for this property.
        vector_length: usize,
        /// Distance metric.
        metric: DistanceMetric,
        /// Graph construction/search parameters.
        parameters: GraphParameters,
        /// Optional quantizer to apply.
        #[serde(default)]
        quantizer: QuantizerSpec,
    },
    /// A flat (brute-force) vector index, no graph.
    VectorFlat {
        /// Fixed vector length for this property.
        vector_length: usize,
        /// Distance metric.
        metric: DistanceMetric,
        /// Optional quantizer to apply.
        #[serde(default)]
        quantizer: QuantizerSpec,
    },
    /// Free text, analysed.
    Text {
        /// Analyser name (collaborator-defined, opaque here).
        analyser: String,
    },
    /// Exact-match string.
    String {
        /// Case sensitivity.
        case_sensitive: bool,
    },
    /// Array of exact-match strings.
    StringArray {
        /// Case sensitivity.
        case_sensitive: bool,
    },
    /// Signed integer.
    Integer,
    /// 64-bit float.
    Float,
}

/// Quantizer choice for a vector index (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuantizerSpec {
    /// No quantization; raw floats only.
    #[default]
    None,
    /// Bit-packed threshold quantizer.
    Binary {
        /// Explicit threshold; if set, `fit()` is skipped (spec §4.4).
        #[serde(default)]
        threshold: Option<f32>,
        /// Point count at which fitting triggers if no explicit threshold
        /// is given.
        #[serde(default = "default_binary_trigger_threshold")]
        trigger_threshold: usize,
    },
    /// Sub-vector KMeans centroid quantizer.
    Product {
        /// Number of equal-length sub-vectors; must divide vector length.
        num_sub_vectors: usize,
        /// Centroids learned per sub-vector, `<= 256`.
        num_centroids: usize,
        /// Point count at which fitting triggers; `None` derives
        /// `num_centroids * 40` (see `SPEC_FULL.md` Open Question #1).
        #[serde(default)]
        trigger_threshold: Option<usize>,
        /// RNG seed for kmeans++ initialisation; `None` uses a fixed
        /// deterministic seed (see `SPEC_FULL.md` Open Question #2).
        #[serde(default)]
        seed: Option<u64>,
    },
}

fn default_binary_trigger_threshold() -> usize {
    1000
}

/// Graph construction/search parameters (spec §4.5), immutable once a shard
/// is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphParameters {
    /// Candidate frontier size during search/build; must be `>= k` at query
    /// time.
    pub search_size: usize,
    /// Maximum out-degree of any node.
    pub degree_bound: usize,
    /// Robust-prune relaxation factor, `>= 1.0`.
    pub alpha: f32,
}

impl Default for GraphParameters {
    fn default() -> Self {
        Self {
            search_size: 75,
            degree_bound: 64,
            alpha: 1.2,
        }
    }
}

/// User-plan limits, enforced by this crate at the points named in spec §7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPlan {
    /// Maximum serialized size, in bytes, of a point's data blob.
    pub max_point_data_bytes: usize,
    /// Maximum `limit` accepted by a search request.
    pub max_search_limit: usize,
    /// Backup cadence, in seconds (enforced by the collaborator scheduling
    /// backups; recorded here for completeness).
    pub shard_backup_frequency_s: u64,
    /// Number of rolling backups to retain.
    pub shard_backup_count: usize,
}

impl Default for UserPlan {
    fn default() -> Self {
        Self {
            max_point_data_bytes: 1 << 20,
            max_search_limit: 1000,
            shard_backup_frequency_s: 3600,
            shard_backup_count: 3,
        }
    }
}

/// The full, immutable per-collection schema supplied by the collaborator
/// that owns schema management (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSchema {
    /// Named property indexes.
    pub index_schema: std::collections::BTreeMap<String, IndexSchemaValue>,
    /// User-plan limits.
    pub user_plan: UserPlan,
}

impl CollectionSchema {
    /// Loads a schema from a TOML file, overridden by `SEMADB_`-prefixed
    /// environment variables, overriding the programmatic default.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CollectionSchema::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SEMADB_"));
        let schema: CollectionSchema = figment
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Validates internal consistency: vector-index parameters are sane and
    /// product quantizers divide evenly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_plan.max_search_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "user_plan.max_search_limit".into(),
                message: "must be greater than zero".into(),
            });
        }
        for (name, index) in &self.index_schema {
            if let IndexSchemaValue::VectorVamana {
                vector_length,
                parameters,
                quantizer,
                ..
            } = index
            {
                if *vector_length == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: format!("index_schema.{name}.vector_length"),
                        message: "must be greater than zero".into(),
                    });
                }
                if parameters.alpha < 1.0 {
                    return Err(ConfigError::InvalidValue {
                        key: format!("index_schema.{name}.parameters.alpha"),
                        message: "alpha must be >= 1.0".into(),
                    });
                }
                if parameters.degree_bound == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: format!("index_schema.{name}.parameters.degree_bound"),
                        message: "degree_bound must be greater than zero".into(),
                    });
                }
                if let QuantizerSpec::Product {
                    num_sub_vectors,
                    num_centroids,
                    ..
                } = quantizer
                {
                    if *num_sub_vectors == 0 || vector_length % num_sub_vectors != 0 {
                        return Err(ConfigError::InvalidValue {
                            key: format!("index_schema.{name}.quantizer.num_sub_vectors"),
                            message: "must evenly divide vector_length".into(),
                        });
                    }
                    if *num_centroids == 0 || *num_centroids > 256 {
                        return Err(ConfigError::InvalidValue {
                            key: format!("index_schema.{name}.quantizer.num_centroids"),
                            message: "must be in 1..=256".into(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
