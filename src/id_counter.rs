//! Recyclable node-id allocator (spec §4.2).
//!
//! Persists two keys in a designated bucket so that ids stay compact under
//! churn: this lets graph traversal size its visited bitset by `max_id()`
//! rather than by the total number of points ever created.

use crate::error::Result;
use crate::store::WriteBucket;

const NEXT_FREE_KEY: &[u8] = b"nextFreeNodeId";
const FREE_LIST_KEY: &[u8] = b"freeNodeIds";

/// In-memory state of the id counter, flushed to a bucket within the
/// owning shard's write transaction.
#[derive(Debug, Clone)]
pub struct IdCounter {
    next_free: u64,
    free_list: Vec<u64>,
}

impl IdCounter {
    /// Loads counter state given a key-lookup closure, starting fresh (next
    /// id `2`, since id `1` is reserved for the start node) if no state
    /// exists. Takes a closure rather than a concrete bucket type so it
    /// works identically against a `ReadBucket` or a `WriteBucket`.
    #[must_use]
    pub fn load(get: impl Fn(&[u8]) -> Option<Vec<u8>>) -> Self {
        let next_free = get(NEXT_FREE_KEY)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(2);
        let free_list = get(FREE_LIST_KEY)
            .map(|b| decode_id_list(&b))
            .unwrap_or_default();
        IdCounter {
            next_free,
            free_list: dedupe(free_list),
        }
    }

    /// Returns the head of the free list if any, else post-increments
    /// `next_free`. Never returns `0`.
    pub fn next(&mut self) -> u64 {
        if let Some(id) = self.free_list.pop() {
            return id;
        }
        let id = self.next_free;
        self.next_free += 1;
        id
    }

    /// Returns `id` to the free list. Duplicates are tolerated; they are
    /// deduplicated on the next `load`.
    pub fn free(&mut self, id: u64) {
        self.free_list.push(id);
    }

    /// One less than `next_free`: the upper bound of any id ever
    /// allocated.
    #[must_use]
    pub fn max_id(&self) -> u64 {
        self.next_free.saturating_sub(1)
    }

    /// Writes both keys atomically within the caller's active write
    /// transaction.
    pub fn flush(&self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        bucket.put(NEXT_FREE_KEY.to_vec(), self.next_free.to_le_bytes().to_vec());
        bucket.put(FREE_LIST_KEY.to_vec(), encode_id_list(&self.free_list));
        Ok(())
    }
}

fn dedupe(mut ids: Vec<u64>) -> Vec<u64> {
    let mut seen = rustc_hash::FxHashSet::default();
    ids.retain(|id| seen.insert(*id));
    ids
}

fn encode_id_list(ids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

fn decode_id_list(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn fresh_counter_starts_at_two_and_never_returns_zero_or_the_start_node_id() {
        let store = Store::open_in_memory();
        store
            .write(|txn| {
                let mut b = txn.bucket("internal");
                let mut counter = IdCounter::load(|k| b.get(k));
                assert_eq!(counter.next(), 2);
                assert_eq!(counter.next(), 3);
                counter.flush(&mut b)
            })
            .unwrap();
    }

    #[test]
    fn freed_ids_are_recycled_before_minting_new_ones() {
        let mut counter = IdCounter {
            next_free: 10,
            free_list: vec![],
        };
        let a = counter.next();
        counter.free(a);
        assert_eq!(counter.next(), a);
        assert_eq!(counter.max_id(), 10);
    }

    #[test]
    fn flush_then_load_round_trips_state() {
        let store = Store::open_in_memory();
        store
            .write(|txn| {
                let mut counter = IdCounter {
                    next_free: 5,
                    free_list: vec![2, 3],
                };
                let mut b = txn.bucket("internal");
                counter.flush(&mut b)
            })
            .unwrap();
        store
            .read(|txn| {
                let b = txn.bucket("internal");
                let counter = IdCounter::load(|k| b.get(k));
                assert_eq!(counter.max_id(), 4);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_frees_are_deduplicated_on_load() {
        let store = Store::open_in_memory();
        store
            .write(|txn| {
                let mut counter = IdCounter {
                    next_free: 5,
                    free_list: vec![2, 2, 3],
                };
                let mut b = txn.bucket("internal");
                counter.flush(&mut b)
            })
            .unwrap();
        store
            .read(|txn| {
                let b = txn.bucket("internal");
                let counter = IdCounter::load(|k| b.get(k));
                assert_eq!(counter.free_list.len(), 2);
                Ok(())
            })
            .unwrap();
    }
}
