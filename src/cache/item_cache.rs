//! Generic keyed cache of decoded items over a bucket (spec §4.3).
//!
//! Parameterised over a storable type via the [`Storable`] trait. Entries
//! are tracked dirty/tombstoned in memory and only reconciled with the
//! backing bucket on [`ItemCache::flush`]; reads merge the in-memory state
//! with a lazy read-through to the bucket, the same overlay idiom
//! `store::WriteTxn` uses for its own buffered mutations.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::store::WriteBucket;

/// A type that can be read from / written to a byte bucket, keyed by a
/// `u64` id encoded into the bucket key.
pub trait Storable: Clone {
    /// Parses `id` and a type discriminant out of a raw bucket key,
    /// returning `(id, true)` if the key belongs to this storable type.
    fn id_from_key(key: &[u8]) -> Option<(u64, bool)>;
    /// Reads the value for `id` directly from the bucket, bypassing the
    /// cache.
    fn read_from(id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Option<Self>;
    /// Writes `self` for `id` into the bucket.
    fn write_to(&self, id: u64, bucket: &mut WriteBucket<'_, '_>);
    /// Removes any bucket entries for `id`.
    fn delete_from(id: u64, bucket: &mut WriteBucket<'_, '_>);
    /// Best-effort estimate of this value's resident memory size in bytes.
    fn size_in_memory(&self) -> usize;
}

enum Slot<T> {
    Present { value: T, dirty: bool },
    Tombstone,
}

/// Generic decoded-item cache (spec §4.3).
pub struct ItemCache<T: Storable> {
    entries: FxHashMap<u64, Slot<T>>,
}

impl<T: Storable> Default for ItemCache<T> {
    fn default() -> Self {
        ItemCache {
            entries: FxHashMap::default(),
        }
    }
}

impl<T: Storable> ItemCache<T> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache hit (respecting tombstones) else read-through from the
    /// bucket.
    pub fn get(&mut self, id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Result<T> {
        if let Some(slot) = self.entries.get(&id) {
            return match slot {
                Slot::Present { value, .. } => Ok(value.clone()),
                Slot::Tombstone => Err(Error::not_found(format!("item {id}"))),
            };
        }
        match T::read_from(id, get) {
            Some(value) => {
                self.entries.insert(
                    id,
                    Slot::Present {
                        value: value.clone(),
                        dirty: false,
                    },
                );
                Ok(value)
            }
            None => Err(Error::not_found(format!("item {id}"))),
        }
    }

    /// Returns found items only, skipping any id that isn't present.
    pub fn get_many(&mut self, ids: &[u64], get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Vec<T> {
        ids.iter()
            .filter_map(|id| self.get(*id, get).ok())
            .collect()
    }

    /// Inserts or replaces an item, marking it dirty.
    pub fn put(&mut self, id: u64, item: T) {
        self.entries.insert(id, Slot::Present { value: item, dirty: true });
    }

    /// Marks each id tombstoned, reading through first if not yet cached so
    /// the deletion survives flush even if the item was never loaded.
    pub fn delete(&mut self, ids: &[u64], get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) {
        for &id in ids {
            if !self.entries.contains_key(&id) {
                let _ = T::read_from(id, get);
            }
            self.entries.insert(id, Slot::Tombstone);
        }
    }

    /// Merges the cache's in-memory state with a bucket scan, invoking `f`
    /// once per live item (tombstones skipped).
    pub fn for_each(
        &mut self,
        scan: impl Fn(&mut dyn FnMut(u64) -> Result<()>) -> Result<()>,
        mut f: impl FnMut(u64, &T) -> Result<()>,
        get: &dyn Fn(&[u8]) -> Option<Vec<u8>>,
    ) -> Result<()> {
        let mut seen = rustc_hash::FxHashSet::default();
        for (&id, slot) in &self.entries {
            seen.insert(id);
            if let Slot::Present { value, .. } = slot {
                f(id, value)?;
            }
        }
        scan(&mut |id| {
            if seen.contains(&id) {
                return Ok(());
            }
            if let Some(value) = T::read_from(id, get) {
                f(id, &value)?;
            }
            Ok(())
        })
    }

    /// Number of live items: cache entries present, plus bucket entries
    /// not shadowed, minus tombstones. `bucket_ids` should enumerate every
    /// id present in the bucket (typically via a prefix scan).
    #[must_use]
    pub fn count(&self, bucket_ids: &[u64]) -> usize {
        let mut ids: rustc_hash::FxHashSet<u64> = bucket_ids.iter().copied().collect();
        for (&id, slot) in &self.entries {
            match slot {
                Slot::Present { .. } => {
                    ids.insert(id);
                }
                Slot::Tombstone => {
                    ids.remove(&id);
                }
            }
        }
        ids.len()
    }

    /// Writes dirty entries, deletes tombstones (removing them from the
    /// cache), and clears dirty bits.
    pub fn flush(&mut self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        let mut to_remove = Vec::new();
        for (&id, slot) in &mut self.entries {
            match slot {
                Slot::Present { value, dirty } => {
                    if *dirty {
                        value.write_to(id, bucket);
                        *dirty = false;
                    }
                }
                Slot::Tombstone => {
                    T::delete_from(id, bucket);
                    to_remove.push(id);
                }
            }
        }
        for id in to_remove {
            self.entries.remove(&id);
        }
        Ok(())
    }

    /// Sum of `size_in_memory` across every present (non-tombstoned) item.
    #[must_use]
    pub fn size_in_memory(&self) -> usize {
        self.entries
            .values()
            .map(|slot| match slot {
                Slot::Present { value, .. } => value.size_in_memory(),
                Slot::Tombstone => 0,
            })
            .sum()
    }

    /// Returns whether any entry is dirty, optionally clearing dirty bits
    /// as a side effect (mirrors the generic `check_and_clear_dirty`
    /// contract storables implement for their own fields).
    pub fn check_and_clear_dirty(&mut self) -> bool {
        let mut any = false;
        for slot in self.entries.values_mut() {
            if let Slot::Present { dirty, .. } = slot {
                if *dirty {
                    any = true;
                    *dirty = false;
                }
            }
        }
        any
    }
}
