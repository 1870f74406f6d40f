//! Plain (unquantized) vector store (spec §4.4).

use crate::cache::item_cache::ItemCache;
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::point::NodeId;
use crate::store::WriteBucket;

use super::{GetFn, RawVector};

/// Stores raw `f32` vectors at `n<id>v`. `fit()` is a no-op.
pub struct PlainVectorStore {
    cache: ItemCache<RawVector>,
    pub(super) metric: DistanceMetric,
    pub(super) length: usize,
}

impl PlainVectorStore {
    /// Creates an empty store for vectors of the given length and metric.
    #[must_use]
    pub fn new(length: usize, metric: DistanceMetric) -> Self {
        PlainVectorStore {
            cache: ItemCache::new(),
            metric,
            length,
        }
    }

    pub(super) fn exists(&mut self, get: GetFn, id: NodeId) -> bool {
        self.cache.get(id, get).is_ok()
    }

    pub(super) fn get(&mut self, get: GetFn, id: NodeId) -> Result<Vec<f32>> {
        self.cache.get(id, get).map(|v| v.0)
    }

    pub(super) fn get_many(&mut self, get: GetFn, ids: &[NodeId]) -> Vec<(NodeId, Vec<f32>)> {
        ids.iter()
            .filter_map(|&id| self.cache.get(id, get).ok().map(|v| (id, v.0)))
            .collect()
    }

    pub(super) fn set(&mut self, id: NodeId, vector: Vec<f32>) {
        self.cache.put(id, RawVector(vector));
    }

    pub(super) fn delete(&mut self, get: GetFn, ids: &[NodeId]) {
        self.cache.delete(ids, get);
    }

    pub(super) fn distance_from_float<'a>(
        &'a mut self,
        get: GetFn<'a>,
        query: Vec<f32>,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        let metric = self.metric;
        Box::new(move |id| match self.cache.get(id, get) {
            Ok(v) => metric.calculate(&query, &v.0),
            Err(_) => {
                tracing::warn!(node_id = id, "distance lookup against missing point");
                f32::MAX
            }
        })
    }

    pub(super) fn distance_from_point<'a>(
        &'a mut self,
        get: GetFn<'a>,
        point: NodeId,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        let query = match self.cache.get(point, get) {
            Ok(v) => v.0,
            Err(_) => return Box::new(|_| f32::MAX),
        };
        self.distance_from_float(get, query)
    }

    pub(super) fn flush(&mut self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        self.cache.flush(bucket)
    }

    pub(super) fn for_each(
        &mut self,
        scan: super::ScanFn,
        mut f: impl FnMut(NodeId, &[f32]) -> Result<()>,
        get: GetFn,
    ) -> Result<()> {
        self.cache.for_each(scan, |id, v| f(id, &v.0), get)
    }

    /// Nothing is hydrated from the bucket at open time for this variant,
    /// so there is no persisted state to re-read when the bucket changes.
    pub(super) fn update_bucket(&mut self, _get: GetFn) {}

    pub(super) fn size_in_memory(&self) -> usize {
        self.cache.size_in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_at_zero_distance() {
        let mut store = PlainVectorStore::new(3, DistanceMetric::Euclidean);
        store.set(1, vec![1.0, 2.0, 3.0]);
        let no_bucket: GetFn = &|_| None;
        let mut dist = store.distance_from_float(no_bucket, vec![1.0, 2.0, 3.0]);
        assert!((dist(1)).abs() < 1e-6);
    }

    #[test]
    fn missing_point_distance_is_sentinel_max() {
        let mut store = PlainVectorStore::new(3, DistanceMetric::Euclidean);
        let no_bucket: GetFn = &|_| None;
        let mut dist = store.distance_from_float(no_bucket, vec![0.0, 0.0, 0.0]);
        assert_eq!(dist(42), f32::MAX);
    }
}
