//! Polymorphic vector storage keyed by node id (spec §4.4).
//!
//! Three variants share one key space (`n<id>v` raw, `n<id>q` quantized)
//! inside whichever bucket the collection schema names for a vector
//! property (`index/vectorVamana/<prop>` or `index/vectorFlat/<prop>`, spec
//! §6). Dispatch is a tagged enum rather than a trait object, per the
//! design notes: the hot path (a distance closure captured once per query)
//! doesn't pay for a vtable call per candidate.

mod binary;
mod plain;
mod product;

pub use binary::BinaryVectorStore;
pub use plain::PlainVectorStore;
pub use product::ProductVectorStore;

use crate::config::QuantizerSpec;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::point::NodeId;
use crate::store::WriteBucket;

/// Read-through accessor into a bucket; mirrors the closure style
/// `cache::item_cache` already uses so every layer shares one idiom for
/// "read a key, maybe through a cache, maybe through a live transaction".
pub type GetFn<'a> = &'a dyn Fn(&[u8]) -> Option<Vec<u8>>;
/// Enumerates every id currently present in the backing bucket (typically
/// a prefix scan), used by `fit()` to decide whether the trigger threshold
/// has been reached and by `for_each`/`count` to merge with cache state.
pub type ScanFn<'a> = &'a dyn Fn(&mut dyn FnMut(NodeId) -> Result<()>) -> Result<()>;

pub(crate) const RESERVED_BINARY_THRESHOLD_KEY: &[u8] = b"_binaryQuantizerThreshold";
pub(crate) const RESERVED_PRODUCT_CENTROIDS_KEY: &[u8] = b"_productQuantizerFlatCentroids";
pub(crate) const RESERVED_PRODUCT_DISTS_KEY: &[u8] = b"_productQuantizerCentroidDists";

/// Builds the `n<id>v` key for a node's raw (or pre-quantization) vector.
#[must_use]
pub fn vector_key(id: NodeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.push(b'n');
    k.extend_from_slice(&id.to_le_bytes());
    k.push(b'v');
    k
}

/// Builds the `n<id>q` key for a node's quantized representation.
#[must_use]
pub fn quant_key(id: NodeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.push(b'n');
    k.extend_from_slice(&id.to_le_bytes());
    k.push(b'q');
    k
}

fn parse_node_key(key: &[u8], suffix: u8) -> Option<(NodeId, bool)> {
    if key.len() != 10 || key[0] != b'n' || key[9] != suffix {
        return None;
    }
    let id = u64::from_le_bytes(key[1..9].try_into().ok()?);
    Some((id, true))
}

pub(crate) fn encode_f32_vec(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub(crate) fn decode_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// A raw, cacheable `f32` vector stored at `n<id>v`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawVector(pub Vec<f32>);

impl crate::cache::item_cache::Storable for RawVector {
    fn id_from_key(key: &[u8]) -> Option<(u64, bool)> {
        parse_node_key(key, b'v')
    }

    fn read_from(id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Option<Self> {
        get(&vector_key(id)).map(|b| RawVector(decode_f32_vec(&b)))
    }

    fn write_to(&self, id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.put(vector_key(id), encode_f32_vec(&self.0));
    }

    fn delete_from(id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.delete(vector_key(id));
    }

    fn size_in_memory(&self) -> usize {
        self.0.len() * std::mem::size_of::<f32>()
    }
}

/// Tagged dispatch across the three vector store variants (spec §4.4).
pub enum VectorStoreVariant {
    /// Raw floats, no quantization.
    Plain(PlainVectorStore),
    /// Bit-packed threshold quantizer.
    Binary(BinaryVectorStore),
    /// Sub-vector KMeans centroid quantizer.
    Product(ProductVectorStore),
}

impl VectorStoreVariant {
    /// Builds the variant named by `spec` for a vector property with the
    /// given length and metric, hydrating any previously fitted quantizer
    /// state from the bucket (`get`) so that re-opening a shard doesn't
    /// forget a quantizer that had already triggered before the shard was
    /// last closed. Metrics that force binary quantization (spec §3:
    /// hamming, jaccard) override an unrelated quantizer choice, keeping
    /// whatever threshold/trigger the schema supplied if it already named
    /// `Binary`.
    #[must_use]
    pub fn open(get: GetFn, length: usize, metric: DistanceMetric, spec: &QuantizerSpec) -> Self {
        if metric.forces_binary_quantization() {
            let (threshold, trigger) = match spec {
                QuantizerSpec::Binary {
                    threshold,
                    trigger_threshold,
                } => (*threshold, *trigger_threshold),
                _ => (None, 1000),
            };
            return VectorStoreVariant::Binary(BinaryVectorStore::open(
                get, length, metric, threshold, trigger,
            ));
        }
        match spec {
            QuantizerSpec::None => VectorStoreVariant::Plain(PlainVectorStore::new(length, metric)),
            QuantizerSpec::Binary {
                threshold,
                trigger_threshold,
            } => VectorStoreVariant::Binary(BinaryVectorStore::open(
                get,
                length,
                metric,
                *threshold,
                *trigger_threshold,
            )),
            QuantizerSpec::Product {
                num_sub_vectors,
                num_centroids,
                trigger_threshold,
                seed,
            } => VectorStoreVariant::Product(ProductVectorStore::open(
                get,
                length,
                metric,
                *num_sub_vectors,
                *num_centroids,
                trigger_threshold.unwrap_or(num_centroids * 40),
                seed.unwrap_or(0xDEC0_DEED_C0FF_EE42),
            )),
        }
    }

    /// Whether `id` has a stored vector.
    pub fn exists(&mut self, get: GetFn, id: NodeId) -> bool {
        match self {
            VectorStoreVariant::Plain(s) => s.exists(get, id),
            VectorStoreVariant::Binary(s) => s.exists(get, id),
            VectorStoreVariant::Product(s) => s.exists(get, id),
        }
    }

    /// Fetches the decoded float vector for `id`.
    pub fn get(&mut self, get: GetFn, id: NodeId) -> Result<Vec<f32>> {
        match self {
            VectorStoreVariant::Plain(s) => s.get(get, id),
            VectorStoreVariant::Binary(s) => s.get(get, id),
            VectorStoreVariant::Product(s) => s.get(get, id),
        }
    }

    /// Fetches decoded float vectors for every found id.
    pub fn get_many(&mut self, get: GetFn, ids: &[NodeId]) -> Vec<(NodeId, Vec<f32>)> {
        match self {
            VectorStoreVariant::Plain(s) => s.get_many(get, ids),
            VectorStoreVariant::Binary(s) => s.get_many(get, ids),
            VectorStoreVariant::Product(s) => s.get_many(get, ids),
        }
    }

    /// Stores a vector for `id`, validating its length against the
    /// configured dimension.
    pub fn set(&mut self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        let expected = self.dimension();
        if vector.len() != expected {
            return Err(Error::invalid_argument(format!(
                "vector length {} does not match schema length {expected}",
                vector.len()
            )));
        }
        match self {
            VectorStoreVariant::Plain(s) => s.set(id, vector),
            VectorStoreVariant::Binary(s) => s.set(id, vector),
            VectorStoreVariant::Product(s) => s.set(id, vector),
        }
        Ok(())
    }

    /// Removes the stored vector(s) for the given ids.
    pub fn delete(&mut self, get: GetFn, ids: &[NodeId]) {
        match self {
            VectorStoreVariant::Plain(s) => s.delete(get, ids),
            VectorStoreVariant::Binary(s) => s.delete(get, ids),
            VectorStoreVariant::Product(s) => s.delete(get, ids),
        }
    }

    /// Runs the deferred quantizer training step, if any. Idempotent.
    pub fn fit(&mut self, get: GetFn, scan: ScanFn) -> Result<()> {
        match self {
            VectorStoreVariant::Plain(_) => Ok(()),
            VectorStoreVariant::Binary(s) => s.fit(get, scan),
            VectorStoreVariant::Product(s) => s.fit(get, scan),
        }
    }

    /// Returns a distance-from-float closure, captured once per query.
    /// Missing points resolve to `f32::MAX` (spec §4.4 failure semantics).
    pub fn distance_from_float<'a>(
        &'a mut self,
        get: GetFn<'a>,
        query: Vec<f32>,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        match self {
            VectorStoreVariant::Plain(s) => s.distance_from_float(get, query),
            VectorStoreVariant::Binary(s) => s.distance_from_float(get, query),
            VectorStoreVariant::Product(s) => s.distance_from_float(get, query),
        }
    }

    /// Returns a distance-from-point closure, captured once per query.
    pub fn distance_from_point<'a>(
        &'a mut self,
        get: GetFn<'a>,
        point: NodeId,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        match self {
            VectorStoreVariant::Plain(s) => s.distance_from_point(get, point),
            VectorStoreVariant::Binary(s) => s.distance_from_point(get, point),
            VectorStoreVariant::Product(s) => s.distance_from_point(get, point),
        }
    }

    /// Flushes dirty entries to `bucket`.
    pub fn flush(&mut self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        match self {
            VectorStoreVariant::Plain(s) => s.flush(bucket),
            VectorStoreVariant::Binary(s) => s.flush(bucket),
            VectorStoreVariant::Product(s) => s.flush(bucket),
        }
    }

    /// Best-effort resident memory estimate.
    #[must_use]
    pub fn size_in_memory(&self) -> usize {
        match self {
            VectorStoreVariant::Plain(s) => s.size_in_memory(),
            VectorStoreVariant::Binary(s) => s.size_in_memory(),
            VectorStoreVariant::Product(s) => s.size_in_memory(),
        }
    }

    /// The vector length this store was configured with.
    #[must_use]
    pub fn dimension(&self) -> usize {
        match self {
            VectorStoreVariant::Plain(s) => s.length,
            VectorStoreVariant::Binary(s) => s.length,
            VectorStoreVariant::Product(s) => s.length,
        }
    }

    /// Merges bucket scan with in-memory state, invoking `f` once per live
    /// point with its decoded float vector (tombstones skipped).
    pub fn for_each(
        &mut self,
        scan: ScanFn,
        get: GetFn,
        f: impl FnMut(NodeId, &[f32]) -> Result<()>,
    ) -> Result<()> {
        match self {
            VectorStoreVariant::Plain(s) => s.for_each(scan, f, get),
            VectorStoreVariant::Binary(s) => s.for_each(scan, f, get),
            VectorStoreVariant::Product(s) => s.for_each(scan, f, get),
        }
    }

    /// Rebinds the `GetFn` this store reads persisted quantizer state
    /// against, re-hydrating it if fitting hadn't already completed.
    /// Needed when a long-lived store outlives the transaction its bucket
    /// closure was captured from (e.g. across a reopen or restore).
    pub fn update_bucket(&mut self, get: GetFn) {
        match self {
            VectorStoreVariant::Plain(s) => s.update_bucket(get),
            VectorStoreVariant::Binary(s) => s.update_bucket(get),
            VectorStoreVariant::Product(s) => s.update_bucket(get),
        }
    }

    /// Whether this store's quantizer (if any) has completed fitting.
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        match self {
            VectorStoreVariant::Plain(_) => false,
            VectorStoreVariant::Binary(s) => s.fitted,
            VectorStoreVariant::Product(s) => s.fitted,
        }
    }
}
