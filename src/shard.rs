//! Shard Orchestrator (spec §4.7): the single entry point that coordinates
//! the Disk Store, Id Counter, Point Store, vector store and graph index
//! behind one immutable collection schema.
//!
//! A schema may declare several vector properties, but a [`crate::point::Point`]
//! carries exactly one optional vector, so a shard resolves and indexes
//! only the first `VectorVamana`/`VectorFlat` entry in
//! `index_schema` (a `BTreeMap`, so alphabetically first by property name).
//! A schema with none makes every point metadata-only.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::cache::shared::SharedCacheManager;
use crate::config::{CollectionSchema, IndexSchemaValue, QuantizerSpec};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::graph::{random_unit_vector, EdgeList, GraphIndex, START_NODE_ID};
use crate::id_counter::IdCounter;
use crate::point::{NodeId, Point, PointId, SearchResult};
use crate::point_store::PointStore;
use crate::store::{ReadBucket, Store, WriteBucket};
use crate::value::Value;
use crate::vector_store::{vector_key, GetFn, ScanFn, VectorStoreVariant};

const POINTS_BUCKET: &str = "points";
const INTERNAL_BUCKET: &str = "internal";
const POINT_COUNT_KEY: &[u8] = b"pointCount";

fn vector_bucket_name(kind: &str, property: &str) -> String {
    format!("index/{kind}/{property}")
}

/// Cooperative cancellation signal threaded through long-running operations
/// (spec §5: every long-running operation respects a caller-supplied
/// cancellation token; workers stop at their next channel read).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Observed cooperatively, not pre-emptively.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The resolved primary vector property this shard indexes, if any.
struct VectorIndex {
    property: String,
    bucket: String,
    length: usize,
    metric: DistanceMetric,
    quantizer: QuantizerSpec,
    graph: Option<GraphIndex>,
}

fn resolve_vector_index(schema: &CollectionSchema) -> Option<VectorIndex> {
    for (name, value) in &schema.index_schema {
        match value {
            IndexSchemaValue::VectorVamana {
                vector_length,
                metric,
                parameters,
                quantizer,
            } => {
                return Some(VectorIndex {
                    property: name.clone(),
                    bucket: vector_bucket_name("vectorVamana", name),
                    length: *vector_length,
                    metric: *metric,
                    quantizer: quantizer.clone(),
                    graph: Some(GraphIndex::new(parameters.search_size, parameters.degree_bound, parameters.alpha)),
                });
            }
            IndexSchemaValue::VectorFlat {
                vector_length,
                metric,
                quantizer,
            } => {
                return Some(VectorIndex {
                    property: name.clone(),
                    bucket: vector_bucket_name("vectorFlat", name),
                    length: *vector_length,
                    metric: *metric,
                    quantizer: quantizer.clone(),
                    graph: None,
                });
            }
            _ => continue,
        }
    }
    None
}

/// Enumerates every node id present in a write-transaction bucket, merging
/// the `n<id>v` raw and `n<id>q` quantized key spaces so a scan still finds
/// every point after a quantizer has elided the raw form (spec §4.4).
fn scan_write_bucket<'b>(bucket: &'b WriteBucket<'_, '_>) -> impl Fn(&mut dyn FnMut(NodeId) -> Result<()>) -> Result<()> + 'b {
    move |f| {
        let mut seen = rustc_hash::FxHashSet::default();
        bucket.for_each(|k, _| {
            if k.len() == 10 && k[0] == b'n' && (k[9] == b'v' || k[9] == b'q') {
                let id = u64::from_le_bytes(k[1..9].try_into().unwrap());
                if seen.insert(id) {
                    f(id)?;
                }
            }
            Ok(())
        })
    }
}

fn scan_read_bucket<'b>(bucket: &'b ReadBucket<'b>) -> impl Fn(&mut dyn FnMut(NodeId) -> Result<()>) -> Result<()> + 'b {
    move |f| {
        let mut seen = rustc_hash::FxHashSet::default();
        bucket.for_each(|k, _| {
            if k.len() == 10 && k[0] == b'n' && (k[9] == b'v' || k[9] == b'q') {
                let id = u64::from_le_bytes(k[1..9].try_into().unwrap());
                if seen.insert(id) {
                    f(id)?;
                }
            }
            Ok(())
        })
    }
}

fn start_node_seed(property: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    property.hash(&mut hasher);
    hasher.finish()
}

/// A vector search request (spec §6's `Search request`, narrowed to the
/// vector-only surface this core implements: see `SPEC_FULL.md` for why the
/// filter/sort query language over non-vector properties is out of scope).
pub struct SearchRequest {
    /// Query vector; must match the shard's indexed vector length.
    pub vector: Vec<f32>,
    /// Maximum results to return, bounded by the user plan's
    /// `max_search_limit`.
    pub limit: usize,
    /// Overrides the graph's configured search frontier size for this
    /// query only. Ignored for a `VectorFlat` index. Must be `>= limit`.
    pub search_size: Option<usize>,
    /// Dotted property paths to decode out of each hit's data blob.
    pub select: Vec<String>,
}

/// Best-effort storage statistics for a shard (spec §4.7 `info`).
#[derive(Debug, Clone, Copy)]
pub struct ShardInfo {
    /// Live point count.
    pub point_count: i64,
    /// Total bytes resident across this shard's buckets.
    pub bytes_allocated: u64,
    /// Bytes actually holding live (non-tombstoned) data; equal to
    /// `bytes_allocated` for this in-memory bucket model, which has no
    /// separate notion of reclaimable free space.
    pub bytes_in_use: u64,
    /// Name of the resolved vector store variant (`"plain"`, `"binary"`,
    /// `"product"`), or `None` for a metadata-only schema.
    pub vector_store_kind: Option<&'static str>,
    /// Whether the vector store's quantizer (if any) has completed its
    /// fit. Always `false` for `"plain"` or when there is no vector store.
    pub quantizer_fitted: bool,
}

/// Coordinates every subsystem behind one shard's disk file (spec §4.7).
pub struct Shard {
    store: Store,
    schema: CollectionSchema,
    vector_index: Option<VectorIndex>,
    vector_store: Option<Mutex<VectorStoreVariant>>,
    edge_cache: SharedCacheManager<EdgeList>,
}

impl Shard {
    /// Opens (or creates) a shard backed by a file at `path`, or purely
    /// in-memory if `path` is `None`. `cache_memory_cap` is forwarded to
    /// the shared cache manager (spec §4.6: `-1` disables eviction, `0`
    /// disables sharing entirely).
    pub fn open(path: Option<&Path>, schema: CollectionSchema, cache_memory_cap: i64) -> Result<Self> {
        schema.validate().map_err(|e| Error::invalid_argument(e.to_string()))?;
        let store = Store::open(path)?;
        let vector_index = resolve_vector_index(&schema);
        let vector_store = match &vector_index {
            Some(vi) => {
                let vs = store.read(|txn| {
                    let bucket = txn.bucket(&vi.bucket);
                    let get = |k: &[u8]| bucket.get(k);
                    Ok(VectorStoreVariant::open(&get, vi.length, vi.metric, &vi.quantizer))
                })?;
                Some(Mutex::new(vs))
            }
            None => None,
        };
        let shard = Shard {
            store,
            schema,
            vector_index,
            vector_store,
            edge_cache: SharedCacheManager::new(cache_memory_cap),
        };
        shard.bootstrap_start_node()?;
        tracing::debug!(path = ?path, "shard opened");
        Ok(shard)
    }

    /// Convenience for tests: a purely in-memory shard with eviction
    /// disabled.
    pub fn open_in_memory(schema: CollectionSchema) -> Result<Self> {
        Self::open(None, schema, -1)
    }

    fn vector_store(&self) -> &Mutex<VectorStoreVariant> {
        self.vector_store
            .as_ref()
            .expect("vector_store is populated whenever vector_index is Some")
    }

    /// Creates the sentinel start node (spec §4.5, §5 "start-node creation
    /// race") if it doesn't already exist. A no-op for a schema with no
    /// graph index. Called once from `open`; the Disk Store's single-writer
    /// model means there is no actual race to resolve, only the
    /// idempotency the spec requires if this were ever called again.
    fn bootstrap_start_node(&self) -> Result<()> {
        let Some(vi) = &self.vector_index else { return Ok(()) };
        if vi.graph.is_none() {
            return Ok(());
        }
        self.store.write(|txn| {
            let mut vec_bucket = txn.bucket(&vi.bucket);
            if vec_bucket.get(&vector_key(START_NODE_ID)).is_some() {
                return Ok(());
            }
            let vector = random_unit_vector(vi.length, start_node_seed(&vi.property));
            {
                let mut vs = self.vector_store().lock();
                vs.set(START_NODE_ID, vector)?;
                vs.flush(&mut vec_bucket)?;
            }
            let mut cache_txn = self.edge_cache.begin_write();
            let workspace = cache_txn.workspace(&vi.bucket);
            workspace.put(START_NODE_ID, EdgeList::new(Vec::new()));
            workspace.flush(&mut vec_bucket)?;
            cache_txn.commit(false);
            Ok(())
        })
    }

    fn check_plan(&self, p: &Point) -> Result<()> {
        if p.data.encode()?.len() > self.schema.user_plan.max_point_data_bytes {
            return Err(Error::plan_exceeded(format!("point {} data exceeds max_point_data_bytes", p.id)));
        }
        if let Some(vi) = &self.vector_index {
            match &p.vector {
                Some(v) if v.len() != vi.length => {
                    return Err(Error::invalid_argument(format!(
                        "point {} vector length {} does not match schema length {}",
                        p.id,
                        v.len(),
                        vi.length
                    )));
                }
                None => {
                    return Err(Error::invalid_argument(format!(
                        "point {} has no vector but shard indexes property '{}'",
                        p.id, vi.property
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Inserts a batch of new points (spec §4.7, §4.5 Insert). Every point
    /// must have a distinct, not-yet-used id; duplicate or pre-existing ids
    /// fail the whole batch via the write transaction's rollback. Graph
    /// insertion for the batch runs across a bounded worker pool (spec §5:
    /// ≈¾ of logical cores); a failure or cancellation scraps the shared
    /// edge cache workspace rather than leaving it partially mutated.
    pub fn insert_points(&self, points: &[Point], cancel: &CancellationToken) -> Result<Vec<PointId>> {
        for p in points {
            self.check_plan(p)?;
        }

        self.store.write(|txn| {
            let mut node_ids: Vec<NodeId> = Vec::with_capacity(points.len());
            {
                let mut internal_bucket = txn.bucket(INTERNAL_BUCKET);
                let mut counter = IdCounter::load(|k| internal_bucket.get(k));
                for _ in points {
                    node_ids.push(counter.next());
                }
                counter.flush(&mut internal_bucket)?;
                let count: i64 = internal_bucket
                    .get(POINT_COUNT_KEY)
                    .and_then(|b| b.try_into().ok())
                    .map(i64::from_le_bytes)
                    .unwrap_or(0);
                internal_bucket.put(POINT_COUNT_KEY.to_vec(), (count + points.len() as i64).to_le_bytes().to_vec());
            }

            let mut inserted_ids = Vec::with_capacity(points.len());
            {
                let mut points_bucket = txn.bucket(POINTS_BUCKET);
                for (p, &node_id) in points.iter().zip(&node_ids) {
                    PointStore::insert(&mut points_bucket, node_id, p.id, &p.data)?;
                    inserted_ids.push(p.id);
                }
            }

            let Some(vi) = &self.vector_index else { return Ok(inserted_ids) };

            let mut vec_bucket = txn.bucket(&vi.bucket);
            {
                let mut vs = self.vector_store().lock();
                for (p, &node_id) in points.iter().zip(&node_ids) {
                    if let Some(v) = &p.vector {
                        vs.set(node_id, v.clone())?;
                    }
                }
                vs.flush(&mut vec_bucket)?;
                let scan_closure = scan_write_bucket(&vec_bucket);
                let scan: ScanFn = &scan_closure;
                let get: GetFn = &|k| vec_bucket.get(k);
                vs.fit(get, scan)?;
                vs.flush(&mut vec_bucket)?;
            }

            let Some(graph) = &vi.graph else { return Ok(inserted_ids) };

            let mut cache_txn = self.edge_cache.begin_write();
            let workspace = cache_txn.workspace(&vi.bucket);
            let result = self.parallel_graph_insert(graph, &vec_bucket, workspace, &node_ids, cancel);
            if let Err(e) = result {
                cache_txn.commit(true);
                return Err(e);
            }
            workspace.flush(&mut vec_bucket)?;
            cache_txn.commit(false);
            Ok(inserted_ids)
        })
    }

    /// Distributes `node_ids` across a bounded worker pool, each inserting
    /// into the shared graph workspace (spec §5 Insert parallelism). Workers
    /// capture the concrete `&WriteBucket` rather than the `GetFn`/`ScanFn`
    /// trait-object aliases, since those aliases carry no `Send`/`Sync`
    /// bound and can't themselves cross the thread boundary as values.
    fn parallel_graph_insert(
        &self,
        graph: &GraphIndex,
        vec_bucket: &WriteBucket<'_, '_>,
        workspace: &crate::cache::shared::SharedWorkspace<EdgeList>,
        node_ids: &[NodeId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let worker_count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1) * 3 / 4;
        let worker_count = worker_count.max(1).min(node_ids.len());

        let (tx, rx) = crossbeam_channel::unbounded::<NodeId>();
        for &id in node_ids {
            tx.send(id).expect("receiver outlives every sender within this scope");
        }
        drop(tx);

        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let cancelled = AtomicBool::new(false);
        let vs_lock = self.vector_store();

        thread::scope(|scope| {
            for _ in 0..worker_count {
                let rx = rx.clone();
                let first_error = &first_error;
                let cancelled = &cancelled;
                scope.spawn(move || {
                    while let Ok(id) = rx.recv() {
                        if cancelled.load(Ordering::Relaxed) || cancel.is_cancelled() {
                            cancelled.store(true, Ordering::Relaxed);
                            return;
                        }
                        let get: GetFn = &|k| vec_bucket.get(k);
                        let distance_from_point = |n: NodeId| -> f32 {
                            let mut vs = vs_lock.lock();
                            let mut f = vs.distance_from_point(get, id);
                            f(n)
                        };
                        let pairwise_distance = |a: NodeId, b: NodeId| -> f32 {
                            let mut vs = vs_lock.lock();
                            let mut f = vs.distance_from_point(get, a);
                            f(b)
                        };
                        if let Err(e) = graph.insert(workspace, get, id, distance_from_point, pairwise_distance) {
                            *first_error.lock() = Some(e);
                            cancelled.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                });
            }
        });

        if cancelled.into_inner() {
            let err = first_error.into_inner().unwrap_or(Error::Cancelled);
            tracing::warn!(error = %err, "insert batch scrapped");
            return Err(err);
        }
        Ok(())
    }

    /// Updates existing points in place (spec §4.5 Update): treated as
    /// delete-then-reinsert of the same node id to avoid id churn. Points
    /// absent from this shard are silently skipped and excluded from the
    /// returned list; a vector whose length violates the schema fails the
    /// whole batch.
    pub fn update_points(&self, points: &[Point], cancel: &CancellationToken) -> Result<Vec<PointId>> {
        for p in points {
            if p.data.encode()?.len() > self.schema.user_plan.max_point_data_bytes {
                return Err(Error::plan_exceeded(format!("point {} data exceeds max_point_data_bytes", p.id)));
            }
        }

        self.store.write(|txn| {
            let mut updated = Vec::new();
            let mut existing: Vec<(NodeId, &Point)> = Vec::new();
            {
                let mut points_bucket = txn.bucket(POINTS_BUCKET);
                for p in points {
                    let Some(node_id) = PointStore::node_id_for(&|k: &[u8]| points_bucket.get(k), p.id) else {
                        continue;
                    };
                    PointStore::set_data(&mut points_bucket, node_id, &p.data)?;
                    updated.push(p.id);
                    existing.push((node_id, p));
                }
            }

            let Some(vi) = &self.vector_index else { return Ok(updated) };
            if existing.is_empty() {
                return Ok(updated);
            }
            for (_, p) in &existing {
                if let Some(v) = &p.vector {
                    if v.len() != vi.length {
                        return Err(Error::invalid_argument(format!(
                            "point {} vector length {} does not match schema length {}",
                            p.id,
                            v.len(),
                            vi.length
                        )));
                    }
                }
            }

            let mut vec_bucket = txn.bucket(&vi.bucket);
            let vs_lock = self.vector_store();

            if let Some(graph) = &vi.graph {
                let mut cache_txn = self.edge_cache.begin_write();
                let workspace = cache_txn.workspace(&vi.bucket);
                let result: Result<()> = (|| {
                    for (node_id, p) in &existing {
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        let Some(v) = &p.vector else { continue };

                        // Remove inbound edges from this node's neighbours
                        // first (spec §4.5 Update), using the same edge-scan
                        // machinery as a real delete; the node id itself is
                        // tombstoned only transiently, overwritten below by
                        // the reinsert under the same id.
                        {
                            let scan_closure = scan_write_bucket(&vec_bucket);
                            let scan: ScanFn = &scan_closure;
                            let get: GetFn = &|k| vec_bucket.get(k);
                            let pairwise_distance = |a: NodeId, b: NodeId| -> f32 {
                                let mut vs = vs_lock.lock();
                                let mut f = vs.distance_from_point(get, a);
                                f(b)
                            };
                            graph.delete(workspace, get, scan, &[*node_id], pairwise_distance)?;
                        }

                        {
                            let mut vs = vs_lock.lock();
                            vs.set(*node_id, v.clone())?;
                        }

                        {
                            let get: GetFn = &|k| vec_bucket.get(k);
                            let distance_from_point = |n: NodeId| -> f32 {
                                let mut vs = vs_lock.lock();
                                let mut f = vs.distance_from_point(get, *node_id);
                                f(n)
                            };
                            let pairwise_distance = |a: NodeId, b: NodeId| -> f32 {
                                let mut vs = vs_lock.lock();
                                let mut f = vs.distance_from_point(get, a);
                                f(b)
                            };
                            graph.insert(workspace, get, *node_id, distance_from_point, pairwise_distance)?;
                        }
                    }
                    Ok(())
                })();
                if let Err(e) = result {
                    cache_txn.commit(true);
                    return Err(e);
                }
                workspace.flush(&mut vec_bucket)?;
                cache_txn.commit(false);
            } else {
                let mut vs = vs_lock.lock();
                for (node_id, p) in &existing {
                    if let Some(v) = &p.vector {
                        vs.set(*node_id, v.clone())?;
                    }
                }
            }

            {
                let mut vs = vs_lock.lock();
                vs.flush(&mut vec_bucket)?;
            }
            Ok(updated)
        })
    }

    /// Deletes points by external id (spec §4.5 Delete): marks their nodes
    /// tombstoned in the shared workspace, edge-scans for survivors with an
    /// edge into the deleted set, robust-prunes each using its own
    /// surviving neighbours plus its deleted neighbours' survivors
    /// (two-hop replacement), then frees the node ids back to the Id
    /// Counter. Ids absent from this shard are silently skipped.
    pub fn delete_points(&self, ids: &[PointId]) -> Result<Vec<PointId>> {
        self.store.write(|txn| {
            let mut deleted_ids = Vec::new();
            let mut node_ids = Vec::new();
            {
                let mut points_bucket = txn.bucket(POINTS_BUCKET);
                for &id in ids {
                    let Some(node_id) = PointStore::node_id_for(&|k: &[u8]| points_bucket.get(k), id) else {
                        continue;
                    };
                    PointStore::delete(&mut points_bucket, node_id, id);
                    deleted_ids.push(id);
                    node_ids.push(node_id);
                }
            }
            if node_ids.is_empty() {
                return Ok(deleted_ids);
            }

            {
                let mut internal_bucket = txn.bucket(INTERNAL_BUCKET);
                let count: i64 = internal_bucket
                    .get(POINT_COUNT_KEY)
                    .and_then(|b| b.try_into().ok())
                    .map(i64::from_le_bytes)
                    .unwrap_or(0);
                let updated = (count - deleted_ids.len() as i64).max(0);
                internal_bucket.put(POINT_COUNT_KEY.to_vec(), updated.to_le_bytes().to_vec());
            }

            if let Some(vi) = &self.vector_index {
                let mut vec_bucket = txn.bucket(&vi.bucket);
                let vs_lock = self.vector_store();

                if let Some(graph) = &vi.graph {
                    let mut cache_txn = self.edge_cache.begin_write();
                    let workspace = cache_txn.workspace(&vi.bucket);
                    let result: Result<()> = (|| {
                        let scan_closure = scan_write_bucket(&vec_bucket);
                        let scan: ScanFn = &scan_closure;
                        let get: GetFn = &|k| vec_bucket.get(k);
                        let pairwise_distance = |a: NodeId, b: NodeId| -> f32 {
                            let mut vs = vs_lock.lock();
                            let mut f = vs.distance_from_point(get, a);
                            f(b)
                        };
                        graph.delete(workspace, get, scan, &node_ids, pairwise_distance)
                    })();
                    if let Err(e) = result {
                        cache_txn.commit(true);
                        return Err(e);
                    }
                    workspace.flush(&mut vec_bucket)?;
                    cache_txn.commit(false);
                }

                {
                    let mut vs = vs_lock.lock();
                    let get: GetFn = &|k| vec_bucket.get(k);
                    vs.delete(get, &node_ids);
                    vs.flush(&mut vec_bucket)?;
                }
            }

            {
                let mut internal_bucket = txn.bucket(INTERNAL_BUCKET);
                let mut counter = IdCounter::load(|k| internal_bucket.get(k));
                for &id in &node_ids {
                    counter.free(id);
                }
                counter.flush(&mut internal_bucket)?;
            }

            Ok(deleted_ids)
        })
    }

    /// Runs a vector search (spec §4.7): up to `request.limit` results in
    /// increasing distance order, the start node never among them.
    pub fn search_points(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        if request.limit == 0 || request.limit > self.schema.user_plan.max_search_limit {
            return Err(Error::invalid_argument(format!(
                "limit must be in 1..={}",
                self.schema.user_plan.max_search_limit
            )));
        }
        let Some(vi) = &self.vector_index else {
            return Err(Error::invalid_argument("shard has no vector index to search"));
        };
        if request.vector.len() != vi.length {
            return Err(Error::invalid_argument(format!(
                "query vector length {} does not match schema length {}",
                request.vector.len(),
                vi.length
            )));
        }
        if let Some(search_size) = request.search_size {
            if search_size < request.limit {
                return Err(Error::invalid_argument("search_size must be >= limit"));
            }
        }

        self.store.read(|txn| {
            let vec_bucket = txn.bucket(&vi.bucket);
            let points_bucket = txn.bucket(POINTS_BUCKET);
            let mut vs = self.vector_store().lock();
            let get: GetFn = &|k| vec_bucket.get(k);

            let hits: Vec<(NodeId, f32)> = if let Some(graph) = &vi.graph {
                let search_size = request.search_size.unwrap_or(graph.search_size);
                let effective_graph = GraphIndex::new(search_size, graph.degree_bound, graph.alpha);
                let mut read_cache_txn = self.edge_cache.begin_read();
                let workspace = read_cache_txn.workspace(&vi.bucket);
                let distance = vs.distance_from_float(get, request.vector.clone());
                let result = effective_graph.greedy_search(workspace, get, distance, request.limit)?;
                let mut hits: Vec<(NodeId, f32)> =
                    result.frontier.into_iter().filter(|&(id, _)| id != START_NODE_ID).collect();
                hits.truncate(request.limit);
                hits
            } else {
                let mut distance = vs.distance_from_float(get, request.vector.clone());
                let mut all = Vec::new();
                let scan_closure = scan_read_bucket(&vec_bucket);
                scan_closure(&mut |id| {
                    if id != START_NODE_ID {
                        all.push((id, distance(id)));
                    }
                    Ok(())
                })?;
                all.sort_by(|a, b| a.1.total_cmp(&b.1));
                all.truncate(request.limit);
                all
            };

            let mut results = Vec::with_capacity(hits.len());
            for (node_id, distance) in hits {
                let Some(point_id) = PointStore::point_id_for(&|k| points_bucket.get(k), node_id) else {
                    continue;
                };
                let data = PointStore::data_for(&|k| points_bucket.get(k), node_id)?;
                let mut selected = std::collections::BTreeMap::new();
                for path in &request.select {
                    if let Some(v) = data.resolve_path(path) {
                        selected.insert(path.clone(), v.clone());
                    }
                }
                results.push(SearchResult {
                    id: point_id,
                    distance: Some(distance),
                    // Collaborator-defined score (spec §6); this core only
                    // guarantees it orders the same as increasing distance
                    // regardless of whether the metric is itself
                    // higher-is-better (distance is already normalised so
                    // smaller is always closer, see `distance::DistanceMetric`).
                    score: Some(-distance),
                    selected,
                    data,
                });
            }
            Ok(results)
        })
    }

    /// Best-effort storage statistics (spec §4.7 `info`).
    pub fn info(&self) -> Result<ShardInfo> {
        self.store.read(|txn| {
            let internal_bucket = txn.bucket(INTERNAL_BUCKET);
            let point_count: i64 = internal_bucket
                .get(POINT_COUNT_KEY)
                .and_then(|b| b.try_into().ok())
                .map(i64::from_le_bytes)
                .unwrap_or(0);

            let mut bucket_names = vec![POINTS_BUCKET.to_string(), INTERNAL_BUCKET.to_string()];
            if let Some(vi) = &self.vector_index {
                bucket_names.push(vi.bucket.clone());
            }
            let mut bytes = 0u64;
            for name in bucket_names {
                txn.bucket(&name).for_each(|k, v| {
                    bytes += (k.len() + v.len()) as u64;
                    Ok(())
                })?;
            }
            let (vector_store_kind, quantizer_fitted) = match (&self.vector_index, &self.vector_store) {
                (Some(_), Some(vs)) => {
                    let vs = vs.lock();
                    let kind = match &*vs {
                        VectorStoreVariant::Plain(_) => "plain",
                        VectorStoreVariant::Binary(_) => "binary",
                        VectorStoreVariant::Product(_) => "product",
                    };
                    (Some(kind), vs.is_fitted())
                }
                _ => (None, false),
            };

            Ok(ShardInfo {
                point_count,
                vector_store_kind,
                quantizer_fitted,
                bytes_allocated: bytes,
                bytes_in_use: bytes,
            })
        })
    }

    /// Writes a consistent snapshot of this shard to `dest` (spec §4.7
    /// `backup`).
    pub fn backup(&self, dest: &Path) -> Result<()> {
        self.store.backup(dest)
    }

    /// Releases resources held by this shard. Idempotent.
    pub fn close(&self) -> Result<()> {
        tracing::debug!("shard closing");
        self.edge_cache.clear();
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphParameters, UserPlan};
    use uuid::Uuid;

    fn vamana_schema(length: usize) -> CollectionSchema {
        let mut schema = CollectionSchema::default();
        schema.index_schema.insert(
            "embedding".into(),
            IndexSchemaValue::VectorVamana {
                vector_length: length,
                metric: DistanceMetric::Euclidean,
                parameters: GraphParameters {
                    search_size: 10,
                    degree_bound: 4,
                    alpha: 1.2,
                },
                quantizer: QuantizerSpec::None,
            },
        );
        schema
    }

    #[test]
    fn insert_then_search_finds_the_closest_point() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let points = vec![
            Point::new(a, vec![0.0, 0.0], Value::String("a".into())),
            Point::new(b, vec![1.0, 1.0], Value::String("b".into())),
        ];
        shard.insert_points(&points, &CancellationToken::new()).unwrap();

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

    #[test]
    fn insert_100_delete_50_search_reports_consistent_counts() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let mut ids = Vec::new();
        let mut points = Vec::new();
        for i in 0..100u32 {
            let id = Uuid::new_v4();
            ids.push(id);
            points.push(Point::new(id, vec![i as f32, 0.0], Value::Null));
        }
        shard.insert_points(&points, &CancellationToken::new()).unwrap();

        let to_delete: Vec<PointId> = ids[..50].to_vec();
        shard.delete_points(&to_delete).unwrap();

        let info = shard.info().unwrap();
        assert_eq!(info.point_count, 50);

        let results = shard
            .search_points(&SearchRequest {
                vector: vec![0.0, 0.0],
                limit: 1,
                search_size: None,
                select: vec![],
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!to_delete.contains(&results[0].id));
    }

    #[test]
    fn update_keeps_the_same_node_id_and_new_vector_is_searchable() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let a = Uuid::new_v4();
        shard
            .insert_points(
                &[Point::new(a, vec![0.0, 0.0], Value::String("a".into()))],
                &CancellationToken::new(),
            )
            .unwrap();
        shard
            .update_points(
                &[Point::new(a, vec![9.0, 9.0], Value::String("a2".into()))],
                &CancellationToken::new(),
            )
            .unwrap();

        let results = shard
            .search_points(&SearchRequest {
                vector: vec![9.0, 9.0],
                limit: 1,
                search_size: None,
                select: vec![],
            })
            .unwrap();
        assert_eq!(results[0].id, a);
        assert_eq!(results[0].data, Value::String("a2".into()));
    }

    #[test]
    fn update_of_missing_point_is_silently_skipped() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let missing = Uuid::new_v4();
        let updated = shard
            .update_points(
                &[Point::new(missing, vec![1.0, 1.0], Value::Null)],
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(updated.is_empty());
    }

    #[test]
    fn search_rejects_limit_over_the_user_plan_cap() {
        let mut schema = vamana_schema(2);
        schema.user_plan = UserPlan {
            max_search_limit: 5,
            ..UserPlan::default()
        };
        let shard = Shard::open_in_memory(schema).unwrap();
        let err = shard
            .search_points(&SearchRequest {
                vector: vec![0.0, 0.0],
                limit: 6,
                search_size: None,
                select: vec![],
            })
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[test]
    fn oversized_point_data_is_rejected_before_any_mutation() {
        let mut schema = vamana_schema(2);
        schema.user_plan = UserPlan {
            max_point_data_bytes: 4,
            ..UserPlan::default()
        };
        let shard = Shard::open_in_memory(schema).unwrap();
        let id = Uuid::new_v4();
        let err = shard
            .insert_points(
                &[Point::new(id, vec![0.0, 0.0], Value::String("too long for the cap".into()))],
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "plan-exceeded");
        assert_eq!(shard.info().unwrap().point_count, 0);
    }

    #[test]
    fn select_resolves_dotted_property_paths() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let id = Uuid::new_v4();
        let mut inner = std::collections::BTreeMap::new();
        inner.insert("city".to_string(), Value::String("london".into()));
        let mut outer = std::collections::BTreeMap::new();
        outer.insert("address".to_string(), Value::Map(inner));
        shard
            .insert_points(
                &[Point::new(id, vec![0.0, 0.0], Value::Map(outer))],
                &CancellationToken::new(),
            )
            .unwrap();

        let results = shard
            .search_points(&SearchRequest {
                vector: vec![0.0, 0.0],
                limit: 1,
                search_size: None,
                select: vec!["address.city".to_string()],
            })
            .unwrap();
        assert_eq!(results[0].selected.get("address.city"), Some(&Value::String("london".into())));
    }

    #[test]
    fn metadata_only_schema_allows_inserts_without_search() {
        let shard = Shard::open_in_memory(CollectionSchema::default()).unwrap();
        let id = Uuid::new_v4();
        shard
            .insert_points(
                &[Point::metadata_only(id, Value::Null)],
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(shard.info().unwrap().point_count, 1);
    }

    #[test]
    fn info_reports_vector_store_kind_and_fit_state() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let info = shard.info().unwrap();
        assert_eq!(info.vector_store_kind, Some("plain"));
        assert!(!info.quantizer_fitted);

        let metadata_only = Shard::open_in_memory(CollectionSchema::default()).unwrap();
        let info = metadata_only.info().unwrap();
        assert_eq!(info.vector_store_kind, None);
        assert!(!info.quantizer_fitted);
    }

    #[test]
    fn close_is_idempotent() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        shard.close().unwrap();
        shard.close().unwrap();
    }

    #[test]
    fn bfs_from_start_node_reaches_every_surviving_node_after_bulk_delete() {
        let shard = Shard::open_in_memory(vamana_schema(2)).unwrap();
        let mut ids = Vec::new();
        let mut points = Vec::new();
        for i in 0..300u32 {
            let id = Uuid::new_v4();
            ids.push(id);
            points.push(Point::new(id, vec![i as f32, (i * 7) as f32], Value::Null));
        }
        shard.insert_points(&points, &CancellationToken::new()).unwrap();
        shard.delete_points(&ids[..80]).unwrap();

        let vi = shard.vector_index.as_ref().unwrap();
        let graph = vi.graph.as_ref().unwrap();
        let reachable_count = shard
            .store
            .read(|txn| {
                let vec_bucket = txn.bucket(&vi.bucket);
                let get: GetFn = &|k| vec_bucket.get(k);
                let mut read_txn = shard.edge_cache.begin_read();
                let workspace = read_txn.workspace(&vi.bucket);
                Ok(graph.bfs_reachable(workspace, get).len())
            })
            .unwrap();
        assert_eq!(reachable_count, 220);
    }
}
