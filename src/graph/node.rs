//! Per-node edge list, shared and individually lockable (spec §4.5, §9
//! design notes: "model each node as owned by its workspace, with
//! per-node read/write lock for edges").

use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::item_cache::Storable;
use crate::point::NodeId;
use crate::store::WriteBucket;

fn edge_key(id: NodeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.push(b'n');
    k.extend_from_slice(&id.to_le_bytes());
    k.push(b'e');
    k
}

fn encode_edges(edges: &[NodeId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(edges.len() * 8);
    for e in edges {
        out.extend_from_slice(&e.to_le_bytes());
    }
    out
}

fn decode_edges(bytes: &[u8]) -> Vec<NodeId> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// A node's outgoing edges. Cloning shares the same underlying lock, so
/// every handle returned by the cache for a given node id mutates the same
/// list; callers still need to re-`put` the handle after mutating it in
/// place so the cache's dirty bit gets set for flush.
#[derive(Clone)]
pub struct EdgeList(Arc<RwLock<Vec<NodeId>>>);

impl EdgeList {
    #[must_use]
    pub fn new(edges: Vec<NodeId>) -> Self {
        EdgeList(Arc::new(RwLock::new(edges)))
    }

    /// Snapshot of the current edges.
    #[must_use]
    pub fn read(&self) -> Vec<NodeId> {
        self.0.read().clone()
    }

    /// Replaces the edge list wholesale.
    pub fn set(&self, edges: Vec<NodeId>) {
        *self.0.write() = edges;
    }

    /// Holds the write lock for the duration of `f`, for read-modify-write
    /// sequences that must not interleave with another mutator of the same
    /// node (spec §4.5 insert step 5: "acquire n's edge lock").
    pub fn with_write<R>(&self, f: impl FnOnce(&mut Vec<NodeId>) -> R) -> R {
        f(&mut self.0.write())
    }
}

impl Storable for EdgeList {
    fn id_from_key(key: &[u8]) -> Option<(u64, bool)> {
        if key.len() == 10 && key[0] == b'n' && key[9] == b'e' {
            Some((u64::from_le_bytes(key[1..9].try_into().ok()?), true))
        } else {
            None
        }
    }

    fn read_from(id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Option<Self> {
        get(&edge_key(id)).map(|b| EdgeList::new(decode_edges(&b)))
    }

    fn write_to(&self, id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.put(edge_key(id), encode_edges(&self.read()));
    }

    fn delete_from(id: u64, bucket: &mut WriteBucket<'_, '_>) {
        bucket.delete(edge_key(id));
    }

    fn size_in_memory(&self) -> usize {
        self.0.read().len() * std::mem::size_of::<NodeId>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_lock() {
        let a = EdgeList::new(vec![1, 2, 3]);
        let b = a.clone();
        b.set(vec![4, 5]);
        assert_eq!(a.read(), vec![4, 5]);
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let edges = vec![7u64, 9, 1_000_000];
        assert_eq!(decode_edges(&encode_edges(&edges)), edges);
    }
}
