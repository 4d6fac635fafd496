//! Offline store trait definition.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version reported for a record that has no snapshot.
pub const NO_VERSION: i64 = -1;

/// A persisted copy of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Record version at the time of the snapshot.
    pub version: i64,
    /// Record data.
    pub data: Value,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(version: i64, data: Value) -> Self {
        Self { version, data }
    }
}

/// Local persistence for record snapshots.
///
/// Stores are keyed by record name and hold at most one snapshot per name.
/// They do not interpret the data they store.
///
/// # Invariants
///
/// - `get` returns exactly the snapshot last passed to `set` for that name
/// - `get` returns `None` after `delete` or `reset`
/// - Stores must be `Send + Sync` so one store can back a shared client
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing and ephemeral clients
/// - [`super::FileStore`] - One JSON document per record in a directory
/// - [`super::NoopStore`] - Offline support disabled
pub trait OfflineStore: Send + Sync {
    /// Reads the snapshot stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read or decoded.
    fn get(&self, name: &str) -> StorageResult<Option<Snapshot>>;

    /// Stores a snapshot under `name`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be encoded or written.
    fn set(&self, name: &str, version: i64, data: &Value) -> StorageResult<()>;

    /// Removes the snapshot stored under `name`. Missing snapshots are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be removed.
    fn delete(&self, name: &str) -> StorageResult<()>;

    /// Removes every snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be cleared.
    fn reset(&self) -> StorageResult<()>;

    /// Returns the version stored under `name`, or [`NO_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read.
    fn version_of(&self, name: &str) -> StorageResult<i64> {
        Ok(self.get(name)?.map_or(NO_VERSION, |s| s.version))
    }
}
