//! kreflect store: keyed in-RAM mirror of the remote collection.
//!
//! A single writer mutates a working table under a mutex and publishes an
//! immutable snapshot after every operation; readers only ever load the
//! published snapshot, so an enumeration never sees a half-applied change.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use kreflect_core::{MirroredObject, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Immutable view of the store at one epoch.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    /// Set once the first full replace has been applied.
    pub synced: bool,
    entries: FxHashMap<ObjectKey, Arc<MirroredObject>>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<MirroredObject>> { self.entries.get(key).cloned() }
    pub fn contains(&self, key: &ObjectKey) -> bool { self.entries.contains_key(key) }

    /// Keys in table iteration order (not meaningful).
    pub fn keys(&self) -> Vec<ObjectKey> { self.entries.keys().cloned().collect() }

    pub fn items(&self) -> Vec<Arc<MirroredObject>> { self.entries.values().cloned().collect() }
}

/// Writer-side table. Mutated in place, then frozen into a snapshot.
#[derive(Default)]
struct Table {
    epoch: u64,
    synced: bool,
    entries: FxHashMap<ObjectKey, Arc<MirroredObject>>,
}

impl Table {
    fn freeze(&self) -> Arc<StoreSnapshot> {
        Arc::new(StoreSnapshot { epoch: self.epoch, synced: self.synced, entries: self.entries.clone() })
    }
}

/// Thread-safe keyed mirror. Create once and share behind an `Arc`.
pub struct Store {
    table: Mutex<Table>,
    snap: ArcSwap<StoreSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for Store {
    fn default() -> Self { Self::new() }
}

impl Store {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            table: Mutex::new(Table::default()),
            snap: ArcSwap::from_pointee(StoreSnapshot::default()),
            epoch_tx,
        }
    }

    /// Atomically swap the whole contents for `items`. Later duplicates of a key win.
    pub fn replace<I>(&self, items: I)
    where
        I: IntoIterator<Item = MirroredObject>,
    {
        let mut entries = FxHashMap::default();
        for obj in items {
            entries.insert(obj.key(), Arc::new(obj));
        }
        let mut table = self.lock();
        let prev = table.entries.len();
        table.entries = entries;
        table.synced = true;
        debug!(prev, next = table.entries.len(), "store replaced");
        self.publish(&mut table);
    }

    /// Insert or overwrite the entry at the object's key.
    pub fn upsert(&self, obj: MirroredObject) {
        let key = obj.key();
        let mut table = self.lock();
        trace!(key = %key, "store upsert");
        table.entries.insert(key, Arc::new(obj));
        self.publish(&mut table);
    }

    /// Remove the entry if present. Absent keys are a no-op; returns whether anything was removed.
    pub fn delete(&self, key: &ObjectKey) -> bool {
        let mut table = self.lock();
        if table.entries.remove(key).is_none() {
            trace!(key = %key, "store delete of absent key");
            return false;
        }
        trace!(key = %key, "store delete");
        self.publish(&mut table);
        true
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> { self.snap.load().keys() }

    pub fn list(&self) -> Vec<Arc<MirroredObject>> { self.snap.load().items() }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<MirroredObject>> { self.snap.load().get(key) }

    pub fn len(&self) -> usize { self.snap.load().len() }

    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }

    /// Consistent view for callers that need several reads against one state.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> { self.snap.load_full() }

    pub fn has_synced(&self) -> bool { self.snap.load().synced }

    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    /// Receiver that changes whenever a new snapshot is published.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Each mutation is a single map operation, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, table: &mut Table) {
        table.epoch = table.epoch.saturating_add(1);
        let next = table.freeze();
        let epoch = next.epoch;
        metrics::gauge!("store_objects", next.len() as f64);
        self.snap.store(next);
        self.epoch_tx.send_replace(epoch);
    }
}
