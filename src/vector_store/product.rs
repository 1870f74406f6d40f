//! Sub-vector KMeans centroid quantizer (spec §4.4 `Product`).
//!
//! Splits each vector into `num_sub_vectors` contiguous chunks and replaces
//! each chunk with the id of its nearest centroid (one byte per
//! sub-vector, `num_centroids <= 256`). Centroids are learned once, at fit
//! time, via KMeans over a sample of the bucket's vectors and then frozen.
//! Cosine-metric collections substitute squared-euclidean for both the
//! KMeans objective and the asymmetric/symmetric distance tables below,
//! since centroid means aren't meaningful under cosine (spec §9 design
//! notes accept this as an approximation).

use crate::cache::item_cache::{ItemCache, Storable};
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::point::NodeId;
use crate::store::WriteBucket;

use super::{GetFn, RawVector, ScanFn, RESERVED_PRODUCT_CENTROIDS_KEY, RESERVED_PRODUCT_DISTS_KEY};

#[derive(Clone, Debug, PartialEq)]
struct CentroidIds(Vec<u8>);

impl Storable for CentroidIds {
    fn id_from_key(key: &[u8]) -> Option<(u64, bool)> {
        super::parse_node_key(key, b'q')
    }

    fn read_from(id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Option<Self> {
        get(&super::quant_key(id)).map(CentroidIds)
    }

    fn write_to(&self, id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.put(super::quant_key(id), self.0.clone());
    }

    fn delete_from(id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.delete(super::quant_key(id));
    }

    fn size_in_memory(&self) -> usize {
        self.0.len()
    }
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_euclidean(point, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

/// Deterministic kmeans++ seeding followed by Lloyd's algorithm, capped at
/// 100 iterations or until an iteration reassigns nothing. `k` is clamped
/// to `data.len()` so small fit samples never starve for centroids.
fn kmeans(data: &[Vec<f32>], k: usize, seed: u64) -> Vec<Vec<f32>> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let k = k.min(data.len()).max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..data.len())].clone());
    while centroids.len() < k {
        let mut farthest_idx = 0;
        let mut farthest_dist = -1.0f32;
        for (i, p) in data.iter().enumerate() {
            let nearest = centroids
                .iter()
                .map(|c| squared_euclidean(p, c))
                .fold(f32::MAX, f32::min);
            if nearest > farthest_dist {
                farthest_dist = nearest;
                farthest_idx = i;
            }
        }
        centroids.push(data[farthest_idx].clone());
    }

    let mut assignments = vec![usize::MAX; data.len()];
    for _ in 0..100 {
        let mut reassigned = 0usize;
        let mut new_assignments = vec![0usize; data.len()];
        for (i, p) in data.iter().enumerate() {
            let c = nearest_centroid(p, &centroids);
            if c != assignments[i] {
                reassigned += 1;
            }
            new_assignments[i] = c;
        }
        assignments = new_assignments;
        if reassigned == 0 {
            break;
        }
        let dim = centroids[0].len();
        let mut sums = vec![vec![0f32; dim]; k];
        let mut counts = vec![0u64; k];
        for (p, &c) in data.iter().zip(&assignments) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(p) {
                *s += x;
            }
        }
        for (c, sum) in sums.into_iter().enumerate() {
            if counts[c] == 0 {
                continue;
            }
            centroids[c] = sum.into_iter().map(|s| s / counts[c] as f32).collect();
        }
    }
    centroids
}

fn split_sub_vectors(v: &[f32], num_sub_vectors: usize) -> Vec<&[f32]> {
    let sub_len = v.len() / num_sub_vectors;
    v.chunks(sub_len).collect()
}

fn decode_with(centroids: &[Vec<Vec<f32>>], codes: &[u8], length: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(length);
    for (s, &c) in codes.iter().enumerate() {
        out.extend_from_slice(&centroids[s][c as usize]);
    }
    out
}

/// Sub-vector KMeans centroid quantizer (spec §4.4 `Product`).
pub struct ProductVectorStore {
    raw: ItemCache<RawVector>,
    codes: ItemCache<CentroidIds>,
    pub(super) metric: DistanceMetric,
    pub(super) length: usize,
    num_sub_vectors: usize,
    num_centroids: usize,
    trigger_threshold: usize,
    seed: u64,
    pub(super) fitted: bool,
    /// `centroids[s][c]` is sub-vector `s`'s centroid `c`.
    centroids: Vec<Vec<Vec<f32>>>,
    /// `centroid_dists[s][c1][c2]` precomputed for symmetric queries.
    centroid_dists: Vec<Vec<Vec<f32>>>,
}

impl ProductVectorStore {
    /// Opens a store, hydrating previously fitted centroids (and their
    /// precomputed distance tables) from the bucket if present.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        get: GetFn,
        length: usize,
        metric: DistanceMetric,
        num_sub_vectors: usize,
        num_centroids: usize,
        trigger_threshold: usize,
        seed: u64,
    ) -> Self {
        let centroids: Vec<Vec<Vec<f32>>> = get(RESERVED_PRODUCT_CENTROIDS_KEY)
            .and_then(|b| bincode::deserialize(&b).ok())
            .unwrap_or_default();
        let centroid_dists: Vec<Vec<Vec<f32>>> = get(RESERVED_PRODUCT_DISTS_KEY)
            .and_then(|b| bincode::deserialize(&b).ok())
            .unwrap_or_default();
        let fitted = !centroids.is_empty();
        ProductVectorStore {
            raw: ItemCache::new(),
            codes: ItemCache::new(),
            metric,
            length,
            num_sub_vectors,
            num_centroids,
            trigger_threshold,
            seed,
            fitted,
            centroids,
            centroid_dists,
        }
    }

    fn encode(&self, v: &[f32]) -> Vec<u8> {
        split_sub_vectors(v, self.num_sub_vectors)
            .iter()
            .enumerate()
            .map(|(s, sub)| nearest_centroid(sub, &self.centroids[s]) as u8)
            .collect()
    }

    fn decode(&self, codes: &[u8]) -> Vec<f32> {
        decode_with(&self.centroids, codes, self.length)
    }

    pub(super) fn exists(&mut self, get: GetFn, id: NodeId) -> bool {
        self.get(get, id).is_ok()
    }

    pub(super) fn get(&mut self, get: GetFn, id: NodeId) -> Result<Vec<f32>> {
        if let Ok(v) = self.raw.get(id, get) {
            return Ok(v.0);
        }
        self.codes.get(id, get).map(|c| self.decode(&c.0))
    }

    pub(super) fn get_many(&mut self, get: GetFn, ids: &[NodeId]) -> Vec<(NodeId, Vec<f32>)> {
        ids.iter()
            .filter_map(|&id| self.get(get, id).ok().map(|v| (id, v)))
            .collect()
    }

    pub(super) fn set(&mut self, id: NodeId, vector: Vec<f32>) {
        if self.fitted {
            let codes = self.encode(&vector);
            self.codes.put(id, CentroidIds(codes));
        } else {
            self.raw.put(id, RawVector(vector));
        }
    }

    pub(super) fn delete(&mut self, get: GetFn, ids: &[NodeId]) {
        self.raw.delete(ids, get);
        self.codes.delete(ids, get);
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

        let mut centroids = Vec::with_capacity(self.num_sub_vectors);
        for s in 0..self.num_sub_vectors {
            let sub_data: Vec<Vec<f32>> = loaded
                .iter()
                .map(|(_, v)| split_sub_vectors(v, self.num_sub_vectors)[s].to_vec())
                .collect();
            centroids.push(kmeans(&sub_data, self.num_centroids, self.seed.wrapping_add(s as u64)));
        }
        self.centroids = centroids;
        self.centroid_dists = self
            .centroids
            .iter()
            .map(|sub_centroids| {
                sub_centroids
                    .iter()
                    .map(|c1| sub_centroids.iter().map(|c2| squared_euclidean(c1, c2)).collect())
                    .collect()
            })
            .collect();

        for (id, v) in &loaded {
            let codes = self.encode(v);
            self.codes.put(*id, CentroidIds(codes));
        }
        let ids: Vec<NodeId> = loaded.iter().map(|(id, _)| *id).collect();
        self.raw.delete(&ids, get);
        self.fitted = true;
        tracing::debug!(
            count = ids.len(),
            num_sub_vectors = self.num_sub_vectors,
            num_centroids = self.num_centroids,
            "product quantizer fitted"
        );
        Ok(())
    }

    pub(super) fn distance_from_float<'a>(
        &'a mut self,
        get: GetFn<'a>,
        query: Vec<f32>,
    ) -> Box<dyn FnMut(NodeId) -> f32 + 'a> {
        let metric = self.metric;
        if self.fitted {
            // Query-to-centroid distances, precomputed once per query
            // rather than per candidate (asymmetric PQ distance).
            let query_dists: Vec<Vec<f32>> = split_sub_vectors(&query, self.num_sub_vectors)
                .iter()
                .enumerate()
                .map(|(s, sub)| self.centroids[s].iter().map(|c| squared_euclidean(sub, c)).collect())
                .collect();
            Box::new(move |id| match self.codes.get(id, get) {
                Ok(codes) => codes
                    .0
                    .iter()
                    .enumerate()
                    .map(|(s, &c)| query_dists[s][c as usize])
                    .sum(),
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
        if self.fitted {
            if let Ok(point_codes) = self.codes.get(point, get) {
                let dists = self.centroid_dists.clone();
                let point_codes = point_codes.0;
                return Box::new(move |id| match self.codes.get(id, get) {
                    Ok(codes) => point_codes
                        .iter()
                        .zip(&codes.0)
                        .enumerate()
                        .map(|(s, (&pc, &cc))| dists[s][pc as usize][cc as usize])
                        .sum(),
                    Err(_) => {
                        tracing::warn!(node_id = id, "distance lookup against missing point");
                        f32::MAX
                    }
                });
            }
            return Box::new(|_| f32::MAX);
        }
        let query = match self.get(get, point) {
            Ok(v) => v,
            Err(_) => return Box::new(|_| f32::MAX),
        };
        self.distance_from_float(get, query)
    }

    pub(super) fn flush(&mut self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        self.raw.flush(bucket)?;
        self.codes.flush(bucket)?;
        if self.fitted {
            if let Ok(bytes) = bincode::serialize(&self.centroids) {
                bucket.put(RESERVED_PRODUCT_CENTROIDS_KEY.to_vec(), bytes);
            }
            if let Ok(bytes) = bincode::serialize(&self.centroid_dists) {
                bucket.put(RESERVED_PRODUCT_DISTS_KEY.to_vec(), bytes);
            }
        }
        Ok(())
    }

    pub(super) fn size_in_memory(&self) -> usize {
        self.raw.size_in_memory()
            + self.codes.size_in_memory()
            + self
                .centroids
                .iter()
                .map(|s| s.iter().map(|c| c.len() * std::mem::size_of::<f32>()).sum::<usize>())
                .sum::<usize>()
    }

    pub(super) fn for_each(
        &mut self,
        scan: ScanFn,
        mut f: impl FnMut(NodeId, &[f32]) -> Result<()>,
        get: GetFn,
    ) -> Result<()> {
        let length = self.length;
        self.raw.for_each(scan, |id, v| f(id, &v.0), get)?;
        let centroids = &self.centroids;
        self.codes.for_each(scan, |id, c| f(id, &decode_with(centroids, &c.0, length)), get)
    }

    /// Re-reads persisted centroids (and their distance tables) from `get`
    /// if this store hasn't already fitted its own, mirroring what
    /// [`ProductVectorStore::open`] does at construction time.
    pub(super) fn update_bucket(&mut self, get: GetFn) {
        if self.fitted {
            return;
        }
        if let Some(centroids) = get(RESERVED_PRODUCT_CENTROIDS_KEY).and_then(|b| bincode::deserialize(&b).ok()) {
            self.centroids = centroids;
            self.centroid_dists = get(RESERVED_PRODUCT_DISTS_KEY)
                .and_then(|b| bincode::deserialize(&b).ok())
                .unwrap_or_default();
            self.fitted = !self.centroids.is_empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit_store(
        points: &[(NodeId, Vec<f32>)],
        num_sub_vectors: usize,
        num_centroids: usize,
    ) -> ProductVectorStore {
        let no_bucket: GetFn = &|_| None;
        let mut store = ProductVectorStore::open(
            no_bucket,
            points[0].1.len(),
            DistanceMetric::Euclidean,
            num_sub_vectors,
            num_centroids,
            points.len(),
            42,
        );
        for (id, v) in points {
            store.set(*id, v.clone());
        }
        let ids: Vec<NodeId> = points.iter().map(|(id, _)| *id).collect();
        let scan: ScanFn = &|f| {
            for id in &ids {
                f(*id)?;
            }
            Ok(())
        };
        store.fit(no_bucket, scan).unwrap();
        store
    }

    #[test]
    fn fitting_encodes_points_to_their_nearest_centroid() {
        let points = vec![
            (1u64, vec![0.0, 0.0, 0.0, 0.0]),
            (2u64, vec![0.1, 0.1, 0.1, 0.1]),
            (3u64, vec![10.0, 10.0, 10.0, 10.0]),
            (4u64, vec![10.1, 10.1, 10.1, 10.1]),
        ];
        let mut store = fit_store(&points, 2, 2);
        assert!(store.fitted);
        let no_bucket: GetFn = &|_| None;
        let mut dist = store.distance_from_float(no_bucket, vec![0.0, 0.0, 0.0, 0.0]);
        assert!(dist(1) < dist(3));
    }

    #[test]
    fn fit_is_idempotent_once_centroids_are_frozen() {
        let points = vec![
            (1u64, vec![0.0, 0.0]),
            (2u64, vec![1.0, 1.0]),
            (3u64, vec![2.0, 2.0]),
        ];
        let mut store = fit_store(&points, 1, 2);
        let before = store.centroids.clone();
        let no_bucket: GetFn = &|_| None;
        let scan: ScanFn = &|_| Ok(());
        store.fit(no_bucket, scan).unwrap();
        assert_eq!(store.centroids, before);
    }

    #[test]
    fn reopening_hydrates_persisted_centroids() {
        use crate::store::Store;
        let points = vec![
            (1u64, vec![0.0, 0.0]),
            (2u64, vec![1.0, 1.0]),
            (3u64, vec![2.0, 2.0]),
        ];
        let mut store = fit_store(&points, 1, 2);
        let store_db = Store::open_in_memory();
        store_db
            .write(|txn| {
                let mut b = txn.bucket("vec");
                store.flush(&mut b)
            })
            .unwrap();
        store_db
            .read(|txn| {
                let b = txn.bucket("vec");
                let get: GetFn = &|k| b.get(k);
                let reopened = ProductVectorStore::open(get, 2, DistanceMetric::Euclidean, 1, 2, 3, 42);
                assert!(reopened.fitted);
                assert_eq!(reopened.centroids, store.centroids);
                Ok(())
            })
            .unwrap();
    }
}
