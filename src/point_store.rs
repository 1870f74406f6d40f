//! Bidirectional point/node identity mapping and the opaque per-point data
//! blob (spec §4 "Point Store"), stored directly in the `points` bucket
//! (spec §6): `n<id>i → uuid`, `p<uuid>i → node id`, `n<id>d → data`.
//!
//! Unlike [`crate::cache::item_cache::ItemCache`] this module keeps no
//! decoded state of its own between calls — every lookup reads straight
//! through the bucket (itself already overlaid by the live write
//! transaction), mirroring `id_counter`'s direct-key style rather than the
//! generic `Storable` cache, since a point record spans three independent
//! keys rather than one.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::point::{NodeId, PointId};
use crate::store::WriteBucket;
use crate::value::Value;

fn node_to_point_key(id: NodeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.push(b'n');
    k.extend_from_slice(&id.to_le_bytes());
    k.push(b'i');
    k
}

fn node_to_data_key(id: NodeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.push(b'n');
    k.extend_from_slice(&id.to_le_bytes());
    k.push(b'd');
    k
}

fn point_to_node_key(id: PointId) -> Vec<u8> {
    let mut k = Vec::with_capacity(17);
    k.push(b'p');
    k.extend_from_slice(id.as_bytes());
    k.push(b'i');
    k
}

/// Stateless accessors over the `points` bucket's key layout.
pub struct PointStore;

impl PointStore {
    /// Records a new point. Fails with `already-exists` if `point_id` is
    /// already mapped to a node in this bucket.
    pub fn insert(bucket: &mut WriteBucket<'_, '_>, node_id: NodeId, point_id: PointId, data: &Value) -> Result<()> {
        if bucket.get(&point_to_node_key(point_id)).is_some() {
            return Err(Error::already_exists(format!("point {point_id}")));
        }
        bucket.put(node_to_point_key(node_id), point_id.as_bytes().to_vec());
        bucket.put(point_to_node_key(point_id), node_id.to_le_bytes().to_vec());
        bucket.put(node_to_data_key(node_id), data.encode()?);
        Ok(())
    }

    /// Looks up the internal node id for an external point id.
    #[must_use]
    pub fn node_id_for(get: &dyn Fn(&[u8]) -> Option<Vec<u8>>, point_id: PointId) -> Option<NodeId> {
        get(&point_to_node_key(point_id)).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes)
    }

    /// Looks up the external point id for an internal node id.
    #[must_use]
    pub fn point_id_for(get: &dyn Fn(&[u8]) -> Option<Vec<u8>>, node_id: NodeId) -> Option<PointId> {
        get(&node_to_point_key(node_id)).and_then(|b| Uuid::from_slice(&b).ok())
    }

    /// Fetches a point's opaque data blob.
    pub fn data_for(get: &dyn Fn(&[u8]) -> Option<Vec<u8>>, node_id: NodeId) -> Result<Value> {
        let bytes = get(&node_to_data_key(node_id)).ok_or_else(|| Error::not_found(format!("node {node_id}")))?;
        Value::decode(&bytes)
    }

    /// Overwrites a point's data blob in place (used by update, which
    /// keeps the same node id).
    pub fn set_data(bucket: &mut WriteBucket<'_, '_>, node_id: NodeId, data: &Value) -> Result<()> {
        bucket.put(node_to_data_key(node_id), data.encode()?);
        Ok(())
    }

    /// Removes every key associated with a point.
    pub fn delete(bucket: &mut WriteBucket<'_, '_>, node_id: NodeId, point_id: PointId) {
        bucket.delete(node_to_point_key(node_id));
        bucket.delete(point_to_node_key(point_id));
        bucket.delete(node_to_data_key(node_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn insert_then_lookup_round_trips_both_directions() {
        let store = Store::open_in_memory();
        let point_id = Uuid::new_v4();
        store
            .write(|txn| {
                let mut b = txn.bucket("points");
                PointStore::insert(&mut b, 2, point_id, &Value::String("hello".into()))?;
                let get = |k: &[u8]| b.get(k);
                assert_eq!(PointStore::node_id_for(&get, point_id), Some(2));
                assert_eq!(PointStore::point_id_for(&get, 2), Some(point_id));
                assert_eq!(PointStore::data_for(&get, 2).unwrap(), Value::String("hello".into()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_point_id_is_rejected() {
        let store = Store::open_in_memory();
        let point_id = Uuid::new_v4();
        store
            .write(|txn| {
                let mut b = txn.bucket("points");
                PointStore::insert(&mut b, 2, point_id, &Value::Null)?;
                let err = PointStore::insert(&mut b, 3, point_id, &Value::Null).unwrap_err();
                assert_eq!(err.kind(), "already-exists");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_removes_all_three_keys() {
        let store = Store::open_in_memory();
        let point_id = Uuid::new_v4();
        store
            .write(|txn| {
                let mut b = txn.bucket("points");
                PointStore::insert(&mut b, 2, point_id, &Value::Null)?;
                PointStore::delete(&mut b, 2, point_id);
                let get = |k: &[u8]| b.get(k);
                assert!(PointStore::node_id_for(&get, point_id).is_none());
                assert!(PointStore::point_id_for(&get, 2).is_none());
                assert!(PointStore::data_for(&get, 2).is_err());
                Ok(())
            })
            .unwrap();
    }
}
