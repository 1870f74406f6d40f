//! Point and search-result data types (spec §3, §6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// External identity of a point: a 128-bit UUID.
pub type PointId = Uuid;

/// Internal identity of a graph node: a compact 64-bit id allocated by the
/// Id Counter. Id `1` is reserved for the sentinel start node.
pub type NodeId = u64;

/// A user-visible point: external UUID, optional vector, opaque data blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    /// External identifier.
    pub id: PointId,
    /// Vector embedding; `None` for a metadata-only point on a schema with
    /// no vector index.
    pub vector: Option<Vec<f32>>,
    /// Opaque, self-describing data blob (spec §6).
    pub data: Value,
}

impl Point {
    /// Creates a point with a vector and data blob.
    #[must_use]
    pub fn new(id: PointId, vector: Vec<f32>, data: Value) -> Self {
        Self {
            id,
            vector: Some(vector),
            data,
        }
    }

    /// Creates a metadata-only point (no vector).
    #[must_use]
    pub fn metadata_only(id: PointId, data: Value) -> Self {
        Self {
            id,
            vector: None,
            data,
        }
    }

    /// Vector dimension, or 0 for a metadata-only point.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.vector.as_ref().map_or(0, Vec::len)
    }

    /// Whether this point carries no vector.
    #[must_use]
    pub fn is_metadata_only(&self) -> bool {
        self.vector.is_none()
    }
}

/// One row of a `search_points` response (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// External point id.
    pub id: PointId,
    /// Distance from the query under the shard's configured metric, if
    /// requested.
    pub distance: Option<f32>,
    /// A derived relevance score, if requested (interpretation is
    /// collaborator-defined; this core only plumbs it through).
    pub score: Option<f32>,
    /// Decoded fields named by the request's `select` list, keyed by
    /// property path.
    pub selected: std::collections::BTreeMap<String, Value>,
    /// The point's opaque data blob.
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_only_point_has_zero_dimension() {
        let p = Point::metadata_only(Uuid::new_v4(), Value::Null);
        assert!(p.is_metadata_only());
        assert_eq!(p.dimension(), 0);
    }

    #[test]
    fn vector_point_reports_its_dimension() {
        let p = Point::new(Uuid::new_v4(), vec![1.0, 2.0, 3.0], Value::Null);
        assert!(!p.is_metadata_only());
        assert_eq!(p.dimension(), 3);
    }
}
