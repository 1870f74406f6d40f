//! Shard-scoped registry of shared, concurrently readable in-memory
//! workspaces (spec §4.6).
//!
//! A [`SharedWorkspace`] holds the decoded state for one named bucket (in
//! practice, one graph's node map) behind a [`DashMap`] so that concurrent
//! readers can read-through and populate entries without taking a global
//! lock on the workspace's contents. The coarser per-workspace
//! `RwLock<Arc<SharedWorkspace<T>>>` held by the [`SharedCacheManager`]
//! implements the try-read / blocking-write acquisition policy spec §4.6
//! describes: it gates whether a caller gets to *share* the live workspace
//! at all, not whether individual entries can be read concurrently.
//!
//! Grounded on the teacher's `cache/lockfree.rs` two-tier `DashMap`
//! registry shape; the try-lock cold-fallback itself has no teacher
//! precedent and is spec-original.

use dashmap::DashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::item_cache::Storable;
use crate::error::Result;
use crate::store::WriteBucket;

enum Slot<T> {
    Present { value: T, dirty: bool },
    Tombstone,
}

/// Decoded, in-memory state for one named workspace. Safe to share across
/// concurrent readers: every method takes `&self`, backed by a lock-free
/// map.
pub struct SharedWorkspace<T: Storable> {
    entries: DashMap<u64, Slot<T>>,
    scrapped: AtomicBool,
}

impl<T: Storable> Default for SharedWorkspace<T> {
    fn default() -> Self {
        SharedWorkspace {
            entries: DashMap::new(),
            scrapped: AtomicBool::new(false),
        }
    }
}

impl<T: Storable> SharedWorkspace<T> {
    fn new() -> Self {
        Self::default()
    }

    /// Cache hit (respecting tombstones) else read-through from the bucket.
    pub fn get(&self, id: u64, get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Result<T> {
        if let Some(slot) = self.entries.get(&id) {
            return match &*slot {
                Slot::Present { value, .. } => Ok(value.clone()),
                Slot::Tombstone => Err(crate::error::Error::not_found(format!("node {id}"))),
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
            None => Err(crate::error::Error::not_found(format!("node {id}"))),
        }
    }

    /// Returns found items only, skipping any id that isn't present.
    pub fn get_many(&self, ids: &[u64], get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) -> Vec<T> {
        ids.iter().filter_map(|id| self.get(*id, get).ok()).collect()
    }

    /// Inserts or replaces an item, marking it dirty. Also used to flag an
    /// already-present entry dirty again after mutating it in place through
    /// a shared handle (e.g. an edge list behind an `Arc<RwLock<..>>>`).
    pub fn put(&self, id: u64, item: T) {
        self.entries.insert(id, Slot::Present { value: item, dirty: true });
    }

    /// Marks each id tombstoned, reading through first if not yet cached.
    pub fn delete(&self, ids: &[u64], get: &dyn Fn(&[u8]) -> Option<Vec<u8>>) {
        for &id in ids {
            if !self.entries.contains_key(&id) {
                let _ = T::read_from(id, get);
            }
            self.entries.insert(id, Slot::Tombstone);
        }
    }

    /// Merges in-memory state with a bucket scan, skipping tombstones.
    pub fn for_each(
        &self,
        scan: impl Fn(&mut dyn FnMut(u64) -> Result<()>) -> Result<()>,
        mut f: impl FnMut(u64, &T) -> Result<()>,
        get: &dyn Fn(&[u8]) -> Option<Vec<u8>>,
    ) -> Result<()> {
        let mut seen = rustc_hash::FxHashSet::default();
        for entry in &self.entries {
            seen.insert(*entry.key());
            if let Slot::Present { value, .. } = entry.value() {
                f(*entry.key(), value)?;
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

    /// Number of live entries: in-memory presence, plus bucket ids not
    /// shadowed, minus tombstones.
    #[must_use]
    pub fn count(&self, bucket_ids: &[u64]) -> usize {
        let mut ids: rustc_hash::FxHashSet<u64> = bucket_ids.iter().copied().collect();
        for entry in &self.entries {
            match entry.value() {
                Slot::Present { .. } => {
                    ids.insert(*entry.key());
                }
                Slot::Tombstone => {
                    ids.remove(entry.key());
                }
            }
        }
        ids.len()
    }

    /// Writes dirty entries, deletes tombstones, clears dirty bits.
    pub fn flush(&self, bucket: &mut WriteBucket<'_, '_>) -> Result<()> {
        let mut to_remove = Vec::new();
        for mut entry in self.entries.iter_mut() {
            let id = *entry.key();
            match entry.value_mut() {
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

    /// Best-effort resident memory estimate, fed to the manager's LRU
    /// eviction.
    #[must_use]
    pub fn size_in_memory(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry.value() {
                Slot::Present { value, .. } => value.size_in_memory(),
                Slot::Tombstone => 0,
            })
            .sum()
    }

    fn mark_scrapped(&self) {
        self.scrapped.store(true, Ordering::Relaxed);
    }

    fn is_scrapped(&self) -> bool {
        self.scrapped.load(Ordering::Relaxed)
    }
}

type Registered<T> = Arc<RwLock<Arc<SharedWorkspace<T>>>>;

/// Per-shard registry mapping a workspace name (in practice, a graph's
/// bucket name) to its shared in-memory state.
pub struct SharedCacheManager<T: Storable> {
    workspaces: DashMap<String, Registered<T>>,
    last_access: DashMap<String, u64>,
    clock: AtomicU64,
    /// `-1` disables eviction, `0` disables sharing entirely.
    memory_cap: i64,
}

impl<T: Storable> SharedCacheManager<T> {
    /// Creates a manager with the given memory cap, in bytes (`-1` disables
    /// eviction, `0` disables sharing: every request gets a cold
    /// workspace).
    #[must_use]
    pub fn new(memory_cap: i64) -> Self {
        SharedCacheManager {
            workspaces: DashMap::new(),
            last_access: DashMap::new(),
            clock: AtomicU64::new(0),
            memory_cap,
        }
    }

    fn touch(&self, name: &str) {
        let t = self.clock.fetch_add(1, Ordering::Relaxed);
        self.last_access.insert(name.to_string(), t);
    }

    fn slot(&self, name: &str) -> Registered<T> {
        self.workspaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Arc::new(SharedWorkspace::new()))))
            .clone()
    }

    /// Begins a read-only cache transaction. Every workspace it touches is
    /// acquired via try-lock; on contention the caller gets a private cold
    /// workspace instead of waiting.
    #[must_use]
    pub fn begin_read(&self) -> Transaction<'_, T> {
        Transaction {
            manager: self,
            write: false,
            held: Vec::new(),
        }
    }

    /// Begins a write cache transaction. Every workspace it touches is
    /// acquired exclusively, blocking until granted.
    #[must_use]
    pub fn begin_write(&self) -> Transaction<'_, T> {
        Transaction {
            manager: self,
            write: true,
            held: Vec::new(),
        }
    }

    /// Drops every registered workspace, scrapping each one first so any
    /// transaction still holding a guard observes it as unusable rather
    /// than silently resurrecting state a closing shard no longer owns.
    pub fn clear(&self) {
        for entry in &self.workspaces {
            entry.value().read().mark_scrapped();
        }
        self.workspaces.clear();
        self.last_access.clear();
    }

    /// Evicts workspaces in ascending last-access order until total
    /// estimated memory is under the configured cap. No-op if eviction is
    /// disabled (`memory_cap < 0`).
    fn evict_if_over_cap(&self) {
        if self.memory_cap < 0 {
            return;
        }
        loop {
            let mut total = 0usize;
            let mut by_age: Vec<(String, u64, usize)> = Vec::new();
            for entry in &self.workspaces {
                let name = entry.key().clone();
                let Some(guard) = entry.value().try_read() else {
                    continue;
                };
                let size = guard.size_in_memory();
                total += size;
                let age = self.last_access.get(&name).map_or(0, |a| *a);
                by_age.push((name, age, size));
            }
            if total <= self.memory_cap as usize {
                return;
            }
            by_age.sort_by_key(|(_, age, _)| *age);
            let Some((oldest, _, size)) = by_age.into_iter().next() else {
                return;
            };
            tracing::debug!(bucket = %oldest, bytes = size, "evicting cold workspace");
            self.workspaces.remove(&oldest);
            self.last_access.remove(&oldest);
            if size == 0 {
                // Nothing left to shrink; avoid spinning forever.
                return;
            }
        }
    }
}

enum Held<T: Storable> {
    Write {
        name: String,
        guard: ArcRwLockWriteGuard<RawRwLock, Arc<SharedWorkspace<T>>>,
    },
    Read {
        name: String,
        guard: ArcRwLockReadGuard<RawRwLock, Arc<SharedWorkspace<T>>>,
    },
    Cold {
        name: String,
        workspace: Arc<SharedWorkspace<T>>,
    },
}

impl<T: Storable> Held<T> {
    fn name(&self) -> &str {
        match self {
            Held::Write { name, .. } | Held::Read { name, .. } | Held::Cold { name, .. } => name,
        }
    }

    fn workspace(&self) -> &SharedWorkspace<T> {
        match self {
            Held::Write { guard, .. } => guard,
            Held::Read { guard, .. } => guard,
            Held::Cold { workspace, .. } => workspace,
        }
    }
}

/// The caller's view of the cache across one Disk Store transaction. May
/// hold several workspaces' locks simultaneously; re-entering an already
/// held workspace by name is a no-op re-acquisition.
pub struct Transaction<'a, T: Storable> {
    manager: &'a SharedCacheManager<T>,
    write: bool,
    held: Vec<Held<T>>,
}

impl<'a, T: Storable> Transaction<'a, T> {
    /// Acquires (or returns the already-held) workspace for `name`.
    pub fn workspace(&mut self, name: &str) -> &SharedWorkspace<T> {
        if let Some(idx) = self.held.iter().position(|h| h.name() == name) {
            return self.held[idx].workspace();
        }
        self.manager.touch(name);
        let held = if self.manager.memory_cap == 0 {
            Held::Cold {
                name: name.to_string(),
                workspace: Arc::new(SharedWorkspace::new()),
            }
        } else if self.write {
            let slot = self.manager.slot(name);
            let mut guard = slot.write_arc();
            if guard.is_scrapped() {
                *guard = Arc::new(SharedWorkspace::new());
            }
            Held::Write {
                name: name.to_string(),
                guard,
            }
        } else {
            let slot = self.manager.slot(name);
            match slot.try_read_arc() {
                Some(guard) if !guard.is_scrapped() => Held::Read {
                    name: name.to_string(),
                    guard,
                },
                _ => Held::Cold {
                    name: name.to_string(),
                    workspace: Arc::new(SharedWorkspace::new()),
                },
            }
        };
        self.held.push(held);
        self.held.last().unwrap().workspace()
    }

    /// Commits the transaction. `failed` decides the fate of every
    /// workspace this transaction touched: if `true`, each is scrapped
    /// (marked unusable and dropped from the registry); otherwise the
    /// manager runs its LRU eviction pass.
    pub fn commit(self, failed: bool) {
        if failed {
            for held in &self.held {
                if let Held::Write { name, guard } = held {
                    guard.mark_scrapped();
                    self.manager.workspaces.remove(name);
                }
            }
            return;
        }
        drop(self.held);
        if self.write {
            self.manager.evict_if_over_cap();
        }
    }
}
