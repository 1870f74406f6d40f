//! Bit-packed threshold quantizer (spec §4.4 `Binary`).
//!
//! Stores the raw vector at `n<id>v` until fitted; once fitted, stores a
//! packed bit vector at `n<id>q` (one bit per dimension) and elides the raw
//! form from future reads to save memory. Bits are packed low-order first
//! within each 64-bit word (dimension `i` lives at bit `i % 64` of word
//! `i / 64`), matching `distance::hamming_distance`'s masking convention,
//! which keeps the low `bit_len` bits of the final word significant.

use crate::cache::item_cache::{ItemCache, Storable};
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::point::NodeId;
use crate::store::WriteBucket;

use super::{GetFn, RawVector, ScanFn, RESERVED_BINARY_THRESHOLD_KEY};

#[derive(Clone, Debug, PartialEq)]
struct PackedBits(Vec<u64>);

fn quant_key_for(id: NodeId) -> Vec<u8> {
    super::quant_key(id)
}

impl Storable for PackedBits {
    fn id_from_key(key: &[u8]) -> Option<(u64, bool)> {
        super::parse_node_key(key, b'q')
    }

    fn read_from(id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Option<Self> {
        get(&quant_key_for(id)).map(|b| PackedBits(decode_word_vec(&b)))
    }

    fn write_to(&self, id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.put(quant_key_for(id), encode_word_vec(&self.0));
    }

    fn delete_from(id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.delete(quant_key_for(id));
    }

    fn size_in_memory(&self) -> usize {
        self.0.len() * std::mem::size_of::<u64>()
    }
}

fn encode_word_vec(words: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 8);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

fn decode_word_vec(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn encode_bits(v: &[f32], threshold: f32) -> Vec<u64> {
    let num_words = v.len().div_ceil(64);
    let mut words = vec![0u64; num_words];
    for (i, x) in v.iter().enumerate() {
        if *x > threshold {
            words[i / 64] |= 1u64 << (i % 64);
        }
    }
    words
}

fn decode_bits(words: &[u64], length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| {
            if words[i / 64] & (1u64 << (i % 64)) != 0 {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Bit-packed threshold quantizer (spec §4.4 `Binary`).
pub struct BinaryVectorStore {
    raw: ItemCache<RawVector>,
    packed: ItemCache<PackedBits>,
    pub(super) metric: DistanceMetric,
    pub(super) length: usize,
    threshold: Option<f32>,
    pub(super) fitted: bool,
    trigger_threshold: usize,
}

impl BinaryVectorStore {
    /// Opens a store, hydrating a previously fitted threshold from the
    /// bucket if one is persisted there. If `threshold` is explicitly
    /// supplied, fitting is skipped entirely (spec §4.4: "if supplied
    /// explicitly ... fitting is skipped") and the store starts already
    /// fitted.
    #[must_use]
    pub fn open(
        get: GetFn,
        length: usize,
        metric: DistanceMetric,
        threshold: Option<f32>,
        trigger_threshold: usize,
    ) -> Self {
        let persisted = get(RESERVED_BINARY_THRESHOLD_KEY)
            .and_then(|b| b.try_into().ok())
            .map(f32::from_le_bytes);
        let threshold = threshold.or(persisted);
        BinaryVectorStore {
            raw: ItemCache::new(),
            packed: ItemCache::new(),
            metric,
            length,
            fitted: threshold.is_some(),
            threshold,
            trigger_threshold,
        }
    }

    pub(super) fn exists(&mut self, get: GetFn, id: NodeId) -> bool {
        self.get(get, id).is_ok()
    }

    pub(super) fn get(&mut self, get: GetFn, id: NodeId) -> Result<Vec<f32>> {
        if let Ok(v) = self.raw.get(id, get) {
            return Ok(v.0);
        }
        self.packed.get(id, get).map(|p| decode_bits(&p.0, self.length))
    }

    pub(super) fn get_many(&mut self, get: GetFn, ids: &[NodeId]) -> Vec<(NodeId, Vec<f32>)> {
        ids.iter()
            .filter_map(|&id| self.get(get, id).ok().map(|v| (id, v)))
            .collect()
    }

    pub(super) fn set(&mut self, id: NodeId, vector: Vec<f32>) {
        if self.fitted {
            let bits = encode_bits(&vector, self.threshold.unwrap());
            self.packed.put(id, PackedBits(bits));
        } else {
            self.raw.put(id, RawVector(vector));
        }
    }

    pub(super) fn delete(&mut self, get: GetFn, ids: &[NodeId]) {
        self.raw.delete(ids, get);
        self.packed.delete(ids, get);
    }

    pub(super) fn fit(&mut self, get: GetFn, scan: ScanFn) -> Result<()> {
        if self.fitted {
            return Ok(());
        }
        let mut bucket_ids = Vec::new();
        scan(&mut |id| {
            bucket_ids.push(id);
            Ok(())
        })?;
        if self.raw.count(&bucket_ids) < self.trigger_threshold {
            return Ok(());
        }
        let mut loaded = Vec::new();
        self.raw.for_each(
            scan,
            |id, v| {
                loaded.push((id, v.0.clone()));
                Ok(())
            },
            get,
        )?;
        if loaded.is_empty() {
            return Ok(());
        }
        let mut sum = 0f64;
        let mut count = 0u64;
        for (_, v) in &loaded {
            for x in v {
                sum += f64::from(*x);
                count += 1;
            }
        }
        let threshold = (sum / count as f64) as f32;
        self.threshold = Some(threshold);
        for (id, v) in &loaded {
            self.packed.put(*id, PackedBits(encode_bits(v, threshold)));
        }
        let ids: Vec<NodeId> = loaded.iter().map(|(id, _)| *id).collect();
        self.raw.delete(&ids, get);
        self.fitted = true;
        tracing::debug!(threshold, count = ids.len(), "binary quantizer fitted");
        Ok(())
    }

    pub(super) fn distance_from_float<'a>(
        &'a mut self,
        get: GetFn<'a>,
        query: Vec<f32>,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        let metric = self.metric;
        if let Some(threshold) = self.threshold.filter(|_| self.fitted) {
            let bit_len = self.length;
            let query_bits = encode_bits(&query, threshold);
            Box::new(move |id| match self.packed.get(id, get) {
                Ok(p) => metric.calculate_packed(&query_bits, &p.0, bit_len),
                Err(_) => {
                    tracing::warn!(node_id = id, "distance lookup against missing point");
                    f32::MAX
                }
            })
        } else {
            Box::new(move |id| match self.raw.get(id, get) {
                Ok(v) => metric.calculate(&query, &v.0),
                Err(_) => {
                    tracing::warn!(node_id = id, "distance lookup against missing point");
                    f32::MAX
                }
            })
        }
    }

    pub(super) fn distance_from_point<'a>(
        &'a mut self,
        get: GetFn<'a>,
        point: NodeId,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        let query = match self.get(get, point) {
            Ok(v) => v,
            Err(_) => return Box::new(|_| f32::MAX),
        };
        self.distance_from_float(get, query)
    }

    pub(super) fn flush(&mut self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        self.raw.flush(bucket)?;
        self.packed.flush(bucket)?;
        if let Some(threshold) = self.threshold {
            bucket.put(RESERVED_BINARY_THRESHOLD_KEY.to_vec(), threshold.to_le_bytes().to_vec());
        }
        Ok(())
    }

    pub(super) fn size_in_memory(&self) -> usize {
        self.raw.size_in_memory() + self.packed.size_in_memory()
    }

    pub(super) fn for_each(
        &mut self,
        scan: ScanFn,
        mut f: impl FnMut(NodeId, &[f32]) -> Result<()>,
        get: GetFn,
    ) -> Result<()> {
        let length = self.length;
        self.raw.for_each(scan, |id, v| f(id, &v.0), get)?;
        self.packed.for_each(scan, |id, p| f(id, &decode_bits(&p.0, length)), get)
    }

    /// Re-reads the persisted threshold from `get` if this store hasn't
    /// already fitted one, mirroring what [`BinaryVectorStore::open`] does
    /// at construction time.
    pub(super) fn update_bucket(&mut self, get: GetFn) {
        if self.threshold.is_none() {
            self.threshold = get(RESERVED_BINARY_THRESHOLD_KEY)
                .and_then(|b| b.try_into().ok())
                .map(f32::from_le_bytes);
            self.fitted = self.threshold.is_some();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_point_five_matches_the_documented_bit_layout() {
        let v = vec![1.0_f32, 0.1, 0.6, 0.7, 0.4];
        let bits = encode_bits(&v, 0.5);
        // Significant 5-bit prefix, printed MSB-first, is "01101" (13).
        assert_eq!(bits[0] & 0b11111, 0b0110_1);
    }

    #[test]
    fn explicit_threshold_skips_fitting_and_encodes_immediately() {
        let no_bucket: GetFn = &|_| None;
        let mut store = BinaryVectorStore::open(no_bucket, 4, DistanceMetric::Hamming, Some(0.5), 1000);
        assert!(store.fitted);
        store.set(1, vec![1.0, 0.0, 1.0, 0.0]);
        assert!(store.get(no_bucket, 1).is_ok());
    }

    #[test]
    fn fit_is_idempotent() {
        let no_bucket: GetFn = &|_| None;
        let mut store = BinaryVectorStore::open(no_bucket, 2, DistanceMetric::Euclidean, None, 2);
        store.set(1, vec![1.0, 0.0]);
        store.set(2, vec![0.0, 1.0]);
        let ids = vec![1u64, 2u64];
        let scan: ScanFn = &|f| {
            for id in &ids {
                f(*id)?;
            }
            Ok(())
        };
        let no_bucket: GetFn = &|_| None;
        store.fit(no_bucket, scan).unwrap();
        assert!(store.fitted);
        let threshold_after_first = store.threshold;
        store.fit(no_bucket, scan).unwrap();
        assert_eq!(store.threshold, threshold_after_first);
    }
}
