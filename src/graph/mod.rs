//! Flat, CRUD-capable proximity graph (spec §4.5, Vamana-style).
//!
//! Node records live in the same bucket as their vector property's store:
//! `n<id>v` (owned by the vector store) and `n<id>e` (owned here). Edge
//! state is cached through a [`crate::cache::shared::SharedWorkspace`] of
//! [`EdgeList`] handles, one workspace per vector property per shard, so
//! concurrent readers can walk the graph without taking the shard's write
//! lock (spec §4.6).

mod node;

pub use node::EdgeList;

use rustc_hash::FxHashSet;
use std::collections::VecDeque;

use crate::cache::shared::SharedWorkspace;
use crate::error::{Error, Result};
use crate::point::NodeId;
use crate::vector_store::{GetFn, ScanFn};

/// Node id 1 is reserved for the sentinel start node: a fixed random unit
/// vector, empty-at-creation edge list, never returned in results but
/// always a discoverable entry point (spec §4.5).
pub const START_NODE_ID: NodeId = 1;

/// Deterministic pseudo-random unit vector for the start node. Seeded
/// rather than wall-clock random so a freshly created shard's bytes are
/// reproducible given its inputs.
#[must_use]
pub fn random_unit_vector(length: usize, seed: u64) -> Vec<f32> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut v: Vec<f32> = (0..length).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

struct Candidate {
    id: NodeId,
    dist: f32,
    visited: bool,
}

/// Result of [`GraphIndex::greedy_search`]: the bounded top-`k` `frontier`
/// for query results, and the unbounded `visited` set (every node actually
/// expanded, sorted ascending by distance) for build-time prune candidates.
pub struct GreedySearchResult {
    pub frontier: Vec<(NodeId, f32)>,
    pub visited: Vec<(NodeId, f32)>,
}

fn insert_bounded(frontier: &mut Vec<Candidate>, c: Candidate, cap: usize) {
    if frontier.len() >= cap {
        if let Some(last) = frontier.last() {
            if c.dist >= last.dist {
                return;
            }
        }
    }
    let pos = frontier.partition_point(|x| x.dist <= c.dist);
    frontier.insert(pos, c);
    if frontier.len() > cap {
        frontier.pop();
    }
}

/// The proximity graph over one vector property (spec §4.5). Parameters
/// are immutable for the lifetime of the shard.
pub struct GraphIndex {
    pub search_size: usize,
    pub degree_bound: usize,
    pub alpha: f32,
}

impl GraphIndex {
    #[must_use]
    pub fn new(search_size: usize, degree_bound: usize, alpha: f32) -> Self {
        GraphIndex {
            search_size,
            degree_bound,
            alpha,
        }
    }

    /// Greedy best-first search, seeded from the start node itself so a
    /// shard with no edges yet still has something to search from (spec
    /// §4.5: the start node is "always a discoverable entry point").
    /// Returns both the bounded top-`k` `frontier` (for query results) and
    /// the unbounded `visited` set of every node actually expanded, in the
    /// order the spec's build step needs it for [`GraphIndex::robust_prune`]
    /// — the two must stay separate since the bounded frontier can evict an
    /// already-visited entry to make room for a closer unvisited one.
    pub fn greedy_search(
        &self,
        workspace: &SharedWorkspace<EdgeList>,
        get: GetFn,
        mut distance: impl FnMut(NodeId) -> f32,
        k: usize,
    ) -> Result<GreedySearchResult> {
        if self.search_size < k {
            return Err(Error::invalid_argument("search_size must be >= k"));
        }
        let mut frontier: Vec<Candidate> = Vec::with_capacity(self.search_size + 1);
        let mut visited: Vec<(NodeId, f32)> = Vec::new();
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        seen.insert(START_NODE_ID);

        let start_dist = distance(START_NODE_ID);
        insert_bounded(&mut frontier, Candidate { id: START_NODE_ID, dist: start_dist, visited: false }, self.search_size);

        loop {
            let Some(idx) = frontier.iter().position(|c| !c.visited) else {
                break;
            };
            frontier[idx].visited = true;
            let current = frontier[idx].id;
            let current_dist = frontier[idx].dist;
            visited.push((current, current_dist));
            let Ok(edges) = workspace.get(current, get) else {
                continue;
            };
            for n in edges.read() {
                if n == current || !seen.insert(n) {
                    continue;
                }
                let d = distance(n);
                insert_bounded(&mut frontier, Candidate { id: n, dist: d, visited: false }, self.search_size);
            }
        }

        visited.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(GreedySearchResult {
            frontier: frontier.into_iter().map(|c| (c.id, c.dist)).collect(),
            visited,
        })
    }

    /// Robust prune (spec §4.5). `candidates` must already be sorted
    /// ascending by distance to `point`. `pairwise_distance(a, b)`
    /// computes the distance between two arbitrary node ids, used to
    /// decide which later candidates the newly added neighbour already
    /// covers.
    pub fn robust_prune(
        &self,
        point: NodeId,
        candidates: Vec<(NodeId, f32)>,
        mut pairwise_distance: impl FnMut(NodeId, NodeId) -> f32,
    ) -> Vec<NodeId> {
        let candidates: Vec<(NodeId, f32)> = candidates.into_iter().filter(|&(id, _)| id != point).collect();
        let mut removed = vec![false; candidates.len()];
        let mut edges = Vec::with_capacity(self.degree_bound);
        let mut i = 0;
        while edges.len() < self.degree_bound && i < candidates.len() {
            if removed[i] {
                i += 1;
                continue;
            }
            let (added, _) = candidates[i];
            edges.push(added);
            for j in (i + 1)..candidates.len() {
                if removed[j] {
                    continue;
                }
                let (q, dist_p_q) = candidates[j];
                let dist_added_q = pairwise_distance(added, q);
                if self.alpha * dist_added_q < dist_p_q {
                    removed[j] = true;
                }
            }
            i += 1;
        }
        edges
    }

    /// Inserts node `id` into the graph: seeds greedy search with `k=1`
    /// from the start node using the point's own vector, robust-prunes the
    /// full visited set into `id`'s edges, then repairs bidirectional edges
    /// on every chosen neighbour (spec §4.5 Insert). The start node is
    /// always among the visited candidates (see `greedy_search`), so the
    /// very first points inserted into an empty shard still get a real
    /// edge rather than an empty one.
    pub fn insert(
        &self,
        workspace: &SharedWorkspace<EdgeList>,
        get: GetFn,
        id: NodeId,
        distance_from_point: impl FnMut(NodeId) -> f32,
        mut pairwise_distance: impl FnMut(NodeId, NodeId) -> f32,
    ) -> Result<()> {
        let result = self.greedy_search(workspace, get, distance_from_point, 1)?;
        let edges = self.robust_prune(id, result.visited, &mut pairwise_distance);
        workspace.put(id, EdgeList::new(edges.clone()));

        for n in edges {
            let Ok(neighbour) = workspace.get(n, get) else {
                continue;
            };
            let needs_prune = neighbour.with_write(|ne| {
                if ne.contains(&id) {
                    None
                } else if ne.len() < self.degree_bound {
                    ne.push(id);
                    None
                } else {
                    let mut candidate_ids = ne.clone();
                    candidate_ids.push(id);
                    Some(candidate_ids)
                }
            });
            if let Some(candidate_ids) = needs_prune {
                let mut cand: Vec<(NodeId, f32)> =
                    candidate_ids.iter().map(|&c| (c, pairwise_distance(n, c))).collect();
                cand.sort_by(|a, b| a.1.total_cmp(&b.1));
                let pruned = self.robust_prune(n, cand, &mut pairwise_distance);
                neighbour.set(pruned);
            }
            workspace.put(n, neighbour);
        }
        Ok(())
    }

    /// Removes `deleted` from the graph (spec §4.5 Delete): marks them
    /// tombstoned, finds every surviving node with an edge into the
    /// deleted set (edge scan), and robust-prunes each using its surviving
    /// neighbours plus the surviving neighbours of its deleted neighbours
    /// (two-hop replacement) as the candidate pool.
    pub fn delete(
        &self,
        workspace: &SharedWorkspace<EdgeList>,
        get: GetFn,
        scan: ScanFn,
        deleted: &[NodeId],
        mut pairwise_distance: impl FnMut(NodeId, NodeId) -> f32,
    ) -> Result<()> {
        let deleted_set: FxHashSet<NodeId> = deleted.iter().copied().collect();
        workspace.delete(deleted, get);

        let mut to_prune = Vec::new();
        workspace.for_each(
            scan,
            |id, edges| {
                if !deleted_set.contains(&id) && edges.read().iter().any(|n| deleted_set.contains(n)) {
                    to_prune.push(id);
                }
                Ok(())
            },
            get,
        )?;

        for node in to_prune {
            let Ok(edge_list) = workspace.get(node, get) else {
                continue;
            };
            let current = edge_list.read();
            let mut candidate_ids = Vec::new();
            for &n in &current {
                if deleted_set.contains(&n) {
                    if let Ok(n_edges) = workspace.get(n, get) {
                        for nn in n_edges.read() {
                            if nn != node && !deleted_set.contains(&nn) {
                                candidate_ids.push(nn);
                            }
                        }
                    }
                } else {
                    candidate_ids.push(n);
                }
            }
            candidate_ids.sort_unstable();
            candidate_ids.dedup();
            let mut candidates: Vec<(NodeId, f32)> =
                candidate_ids.into_iter().map(|c| (c, pairwise_distance(node, c))).collect();
            candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
            let pruned = self.robust_prune(node, candidates, &mut pairwise_distance);
            edge_list.set(pruned);
            workspace.put(node, edge_list);
        }
        Ok(())
    }

    /// Breadth-first reachability from the start node, excluding the start
    /// node itself from the returned set (spec §8: "BFS from the start
    /// node visits every live node exactly once").
    pub fn bfs_reachable(&self, workspace: &SharedWorkspace<EdgeList>, get: GetFn) -> FxHashSet<NodeId> {
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut queue = VecDeque::new();
        visited.insert(START_NODE_ID);
        queue.push_back(START_NODE_ID);
        while let Some(current) = queue.pop_front() {
            if let Ok(edges) = workspace.get(current, get) {
                for n in edges.read() {
                    if visited.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
        }
        visited.remove(&START_NODE_ID);
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny in-memory graph fixture: adjacency by hand, `dist(a, b) =
    /// |a - b|` so greedy search and robust prune have a predictable
    /// order without needing a real vector store.
    fn fixture(edges: &[(NodeId, &[NodeId])]) -> SharedWorkspace<EdgeList> {
        let workspace: SharedWorkspace<EdgeList> = SharedWorkspace::default();
        for &(id, neighbours) in edges {
            workspace.put(id, EdgeList::new(neighbours.to_vec()));
        }
        workspace
    }

    fn linear_distance(a: NodeId, b: NodeId) -> f32 {
        (a as f32 - b as f32).abs()
    }

    #[test]
    fn greedy_search_finds_the_closest_node_via_the_start_node() {
        let workspace = fixture(&[(START_NODE_ID, &[2, 5]), (2, &[3]), (5, &[6]), (3, &[]), (6, &[])]);
        let no_bucket: GetFn = &|_| None;
        let result = GraphIndex::new(10, 4, 1.0)
            .greedy_search(&workspace, no_bucket, |id| linear_distance(id, 3), 1)
            .unwrap();
        assert_eq!(result.frontier[0].0, 3);
    }

    #[test]
    fn greedy_search_rejects_search_size_below_k() {
        let workspace = fixture(&[(START_NODE_ID, &[])]);
        let no_bucket: GetFn = &|_| None;
        let err = GraphIndex::new(1, 4, 1.0)
            .greedy_search(&workspace, no_bucket, |id| linear_distance(id, 3), 5)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[test]
    fn robust_prune_respects_the_degree_bound() {
        let graph = GraphIndex::new(10, 2, 1.0);
        let candidates = vec![(10u64, 1.0), (11, 2.0), (12, 3.0), (13, 4.0)];
        let edges = graph.robust_prune(1, candidates, |a, b| (a as f32 - b as f32).abs());
        assert!(edges.len() <= 2);
    }

    #[test]
    fn insert_adds_bidirectional_edges() {
        let workspace = fixture(&[(START_NODE_ID, &[100]), (100, &[])]);
        let no_bucket: GetFn = &|_| None;
        let graph = GraphIndex::new(10, 4, 1.0);
        let target = 100;
        graph
            .insert(
                &workspace,
                no_bucket,
                200,
                |id| linear_distance(id, 200),
                |a, b| linear_distance(a, b),
            )
            .unwrap();
        assert!(workspace.get(200, no_bucket).unwrap().read().contains(&target));
        assert!(workspace.get(target, no_bucket).unwrap().read().contains(&200));
    }

    #[test]
    fn delete_prunes_edges_into_the_deleted_set_with_two_hop_replacement() {
        // 1(start) -> 2 -> 3 ; 2 is deleted, 3's only path to start was via 2.
        let workspace = fixture(&[(START_NODE_ID, &[2]), (2, &[3]), (3, &[2])]);
        let no_bucket: GetFn = &|_| None;
        let ids = vec![START_NODE_ID, 2, 3];
        let scan: ScanFn = &|f| {
            for id in &ids {
                f(*id)?;
            }
            Ok(())
        };
        let graph = GraphIndex::new(10, 4, 1.0);
        graph
            .delete(&workspace, no_bucket, scan, &[2], |a, b| linear_distance(a, b))
            .unwrap();
        assert!(workspace.get(2, no_bucket).is_err());
        let start_edges = workspace.get(START_NODE_ID, no_bucket).unwrap().read();
        assert!(!start_edges.contains(&2));
    }

    #[test]
    fn bfs_reachable_excludes_the_start_node_and_visits_every_live_node() {
        let workspace = fixture(&[(START_NODE_ID, &[2, 3]), (2, &[4]), (3, &[]), (4, &[])]);
        let no_bucket: GetFn = &|_| None;
        let graph = GraphIndex::new(10, 4, 1.0);
        let reachable = graph.bfs_reachable(&workspace, no_bucket);
        let expected: FxHashSet<NodeId> = [2u64, 3, 4].into_iter().collect();
        assert_eq!(reachable, expected);
    }
}
