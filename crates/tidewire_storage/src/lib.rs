//! # Tidewire Storage
//!
//! Offline persistence for tidewire record snapshots.
//!
//! A store keeps the last known version and data of each record by name so a
//! client can keep working while disconnected and reconcile on reconnect.
//! Stores are opaque: they never interpret record data.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral clients
//! - [`FileStore`] - One JSON document per record in a directory
//! - [`NoopStore`] - Offline support disabled
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use tidewire_storage::{InMemoryStore, OfflineStore, NO_VERSION};
//!
//! let store = InMemoryStore::new();
//! assert_eq!(store.version_of("user/1").unwrap(), NO_VERSION);
//! store.set("user/1", 1, &json!({})).unwrap();
//! assert_eq!(store.version_of("user/1").unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod noop;

pub use backend::{OfflineStore, Snapshot, NO_VERSION};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use noop::NoopStore;
