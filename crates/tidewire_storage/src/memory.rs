//! In-memory offline store.

use crate::backend::{OfflineStore, Snapshot};
use crate::error::StorageResult;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// An in-memory offline store.
///
/// Snapshots live as long as the store. Suitable for tests and for clients
/// that only need to survive reconnects, not restarts.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use tidewire_storage::{InMemoryStore, OfflineStore};
///
/// let store = InMemoryStore::new();
/// store.set("user/1", 3, &json!({"name": "Ada"})).unwrap();
/// assert_eq!(store.get("user/1").unwrap().unwrap().version, 3);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }

    /// Returns the stored names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshots.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl OfflineStore for InMemoryStore {
    fn get(&self, name: &str) -> StorageResult<Option<Snapshot>> {
        Ok(self.snapshots.read().get(name).cloned())
    }

    fn set(&self, name: &str, version: i64, data: &Value) -> StorageResult<()> {
        self.snapshots
            .write()
            .insert(name.to_string(), Snapshot::new(version, data.clone()));
        Ok(())
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        self.snapshots.write().remove(name);
        Ok(())
    }

    fn reset(&self) -> StorageResult<()> {
        self.snapshots.write().clear();
        Ok(())
    }
}
