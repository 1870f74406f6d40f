//! Transactional byte-bucket key/value store (spec §4.1).
//!
//! A [`Store`] holds a set of named buckets, each an ordered byte-key to
//! byte-value map. Readers and writers never block each other except that
//! only one write transaction runs at a time; a write transaction buffers
//! its mutations in an overlay (the same merge-overlay idiom the Item Cache
//! uses over its bucket, see `cache::item_cache`) and only applies them to
//! the live bucket map, and to the durable log, once the caller's closure
//! returns `Ok`.
//!
//! Durability is grounded on the teacher's `storage/log_payload.rs`:
//! a CRC32-checked binary snapshot plus a WAL of operations appended since
//! the snapshot, replayed on open.

mod durable;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

type BucketMap = BTreeMap<Vec<u8>, Vec<u8>>;
type Buckets = HashMap<String, BucketMap>;

/// A single buffered write operation, used both to apply a transaction's
/// overlay onto the live map and to append to the durable WAL.
#[derive(Clone)]
pub(crate) enum WalOp {
    Put {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: String,
        key: Vec<u8>,
    },
}

/// A durable or in-memory transactional byte-bucket store.
pub struct Store {
    buckets: RwLock<Buckets>,
    durable: Option<Arc<durable::DurableLog>>,
}

impl Store {
    /// Opens (or creates) a store. An empty path means in-memory only.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::open_in_memory()),
            Some(path) => {
                let log = durable::DurableLog::open(path)?;
                let buckets = log.replay()?;
                Ok(Store {
                    buckets: RwLock::new(buckets),
                    durable: Some(Arc::new(log)),
                })
            }
        }
    }

    /// Opens a purely in-memory store, used by tests and full-RAM shards.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Store {
            buckets: RwLock::new(Buckets::new()),
            durable: None,
        }
    }

    /// Runs `f` inside a read-only transaction. Concurrent read
    /// transactions are permitted.
    pub fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ReadTxn) -> Result<R>,
    {
        let guard = self.buckets.read();
        let txn = ReadTxn { buckets: &guard };
        f(&txn)
    }

    /// Runs `f` inside a read-write transaction. Only one write transaction
    /// runs at a time. Returning `Err` from `f` aborts the transaction: no
    /// mutation is visible afterwards.
    pub fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut WriteTxn) -> Result<R>,
    {
        let mut guard = self.buckets.write();
        let (result, ops) = {
            let mut txn = WriteTxn {
                base: &guard,
                overlay: Buckets::new(),
                deleted: HashMap::new(),
                ops: Vec::new(),
            };
            let result = f(&mut txn)?;
            (result, txn.ops)
        };
        if let Some(durable) = &self.durable {
            durable.append(&ops)?;
        }
        for op in ops {
            match op {
                WalOp::Put { bucket, key, value } => {
                    guard.entry(bucket).or_default().insert(key, value);
                }
                WalOp::Delete { bucket, key } => {
                    if let Some(target) = guard.get_mut(&bucket) {
                        target.remove(&key);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Writes a consistent snapshot of the live state to `dest`.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        let guard = self.buckets.read();
        durable::write_snapshot(dest, &guard)
    }

    /// Releases resources held by this store. Idempotent.
    pub fn close(&self) -> Result<()> {
        if let Some(durable) = &self.durable {
            durable.flush()?;
        }
        Ok(())
    }
}

/// Read-only view over a [`Store`]'s buckets.
pub struct ReadTxn<'a> {
    buckets: &'a Buckets,
}

impl<'a> ReadTxn<'a> {
    /// Returns a read-only handle to a named bucket. Buckets that don't yet
    /// exist behave as empty.
    #[must_use]
    pub fn bucket(&self, name: &str) -> ReadBucket<'_> {
        ReadBucket {
            map: self.buckets.get(name),
        }
    }
}

/// Read-only handle to a single bucket.
pub struct ReadBucket<'a> {
    map: Option<&'a BucketMap>,
}

impl<'a> ReadBucket<'a> {
    /// Fetches a value by key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.and_then(|m| m.get(key)).cloned()
    }

    /// Iterates every key/value pair.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        if let Some(map) = self.map {
            for (k, v) in map {
                f(k, v)?;
            }
        }
        Ok(())
    }

    /// Iterates every key/value pair whose key starts with `prefix`.
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        if let Some(map) = self.map {
            for (k, v) in map.range(prefix.to_vec()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                f(k, v)?;
            }
        }
        Ok(())
    }

    /// Always `true` for a read transaction's bucket view.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        true
    }
}

/// A write transaction. Holds a reference to the committed state (`base`)
/// plus an overlay of this transaction's own buffered mutations, so reads
/// within the transaction see its own writes (spec §5's ordering
/// guarantee) without disturbing any other transaction.
pub struct WriteTxn<'a> {
    base: &'a Buckets,
    overlay: Buckets,
    deleted: HashMap<String, HashSet<Vec<u8>>>,
    ops: Vec<WalOp>,
}

impl<'a> WriteTxn<'a> {
    /// Returns a read-write handle to a named bucket.
    pub fn bucket<'b>(&'b mut self, name: &str) -> WriteBucket<'b, 'a> {
        WriteBucket {
            txn: self,
            name: name.to_string(),
        }
    }
}

/// Read-write handle to a single bucket within a [`WriteTxn`].
pub struct WriteBucket<'b, 'a> {
    txn: &'b mut WriteTxn<'a>,
    name: String,
}

impl<'b, 'a> WriteBucket<'b, 'a> {
    /// Fetches a value, preferring this transaction's own uncommitted
    /// writes over committed state.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self
            .txn
            .deleted
            .get(&self.name)
            .is_some_and(|d| d.contains(key))
        {
            return None;
        }
        if let Some(v) = self.txn.overlay.get(&self.name).and_then(|m| m.get(key)) {
            return Some(v.clone());
        }
        self.txn.base.get(&self.name).and_then(|m| m.get(key)).cloned()
    }

    /// Buffers a put, visible to later reads of this same bucket within
    /// this transaction.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if let Some(deleted) = self.txn.deleted.get_mut(&self.name) {
            deleted.remove(&key);
        }
        self.txn
            .overlay
            .entry(self.name.clone())
            .or_default()
            .insert(key.clone(), value.clone());
        self.txn.ops.push(WalOp::Put {
            bucket: self.name.clone(),
            key,
            value,
        });
    }

    /// Buffers a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        if let Some(overlay) = self.txn.overlay.get_mut(&self.name) {
            overlay.remove(&key);
        }
        self.txn
            .deleted
            .entry(self.name.clone())
            .or_default()
            .insert(key.clone());
        self.txn.ops.push(WalOp::Delete {
            bucket: self.name.clone(),
            key,
        });
    }

    /// Iterates every key/value pair, merging this transaction's overlay
    /// over the base state and skipping deleted keys.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(overlay) = self.txn.overlay.get(&self.name) {
            for (k, v) in overlay {
                seen.insert(k.clone());
                f(k, v)?;
            }
        }
        if let Some(base) = self.txn.base.get(&self.name) {
            let deleted = self.txn.deleted.get(&self.name);
            for (k, v) in base {
                if seen.contains(k) || deleted.is_some_and(|d| d.contains(k)) {
                    continue;
                }
                f(k, v)?;
            }
        }
        Ok(())
    }

    /// Iterates every key/value pair whose key starts with `prefix`.
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.for_each(|k, v| {
            if k.starts_with(prefix) {
                f(k, v)?;
            }
            Ok(())
        })
    }

    /// A write bucket is never read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        false
    }
}
