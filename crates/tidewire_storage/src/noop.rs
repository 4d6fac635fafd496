//! Offline store used when offline support is disabled.

use crate::backend::{OfflineStore, Snapshot};
use crate::error::StorageResult;
use serde_json::Value;

/// A store that keeps nothing.
///
/// Every read reports "no snapshot" and every write succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl NoopStore {
    /// Creates a no-op store.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl OfflineStore for NoopStore {
    fn get(&self, _name: &str) -> StorageResult<Option<Snapshot>> {
        Ok(None)
    }

    fn set(&self, _name: &str, _version: i64, _data: &Value) -> StorageResult<()> {
        Ok(())
    }

    fn delete(&self, _name: &str) -> StorageResult<()> {
        Ok(())
    }

    fn reset(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_are_forgotten() {
        let store = NoopStore::new();
        store.set("a", 4, &json!({"k": "v"})).unwrap();
        assert!(store.get("a").unwrap().is_none());
    }
}
