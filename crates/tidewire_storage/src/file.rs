//! File-based offline store.

use crate::backend::{OfflineStore, Snapshot};
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

/// Names longer than this are stored under their SHA-256 digest, keeping
/// file names well below common file system limits.
const MAX_ENCODED_NAME: usize = 100;

/// An offline store keeping one JSON document per record in a directory.
///
/// Record names are hex-encoded to form file names, so any name is a valid
/// key. Long names are replaced by an `h`-prefixed SHA-256 digest, which
/// cannot collide with a hex-encoded name. Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written snapshot behind.
///
/// # Thread Safety
///
/// Writers are serialized by an internal lock. Reads do not take the lock;
/// the rename makes each snapshot replacement atomic.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use std::path::Path;
/// use tidewire_storage::{FileStore, OfflineStore};
///
/// let store = FileStore::open(Path::new("offline")).unwrap();
/// store.set("user/1", 2, &json!({"name": "Ada"})).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the directory holding the snapshots.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> StorageResult<PathBuf> {
        if name.is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        let mut file_name = String::with_capacity(MAX_ENCODED_NAME * 2 + EXTENSION.len() + 2);
        if name.len() > MAX_ENCODED_NAME {
            file_name.push('h');
            hex_into(&mut file_name, &Sha256::digest(name.as_bytes()));
        } else {
            hex_into(&mut file_name, name.as_bytes());
        }
        file_name.push('.');
        file_name.push_str(EXTENSION);
        Ok(self.dir.join(file_name))
    }
}

fn hex_into(out: &mut String, bytes: &[u8]) {
    for byte in bytes {
        // Writing into a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
}

impl OfflineStore for FileStore {
    fn get(&self, name: &str) -> StorageResult<Option<Snapshot>> {
        let path = self.path_for(name)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupted {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    fn set(&self, name: &str, version: i64, data: &Value) -> StorageResult<()> {
        let path = self.path_for(name)?;
        let snapshot = Snapshot::new(version, data.clone());
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| StorageError::Encoding {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let _guard = self.write_lock.lock();
        let temp = path.with_extension(TEMP_EXTENSION);
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn reset(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("user/1", 4, &json!({"name": "Ada"})).unwrap();
        let snapshot = store.get("user/1").unwrap().unwrap();
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.data, json!({"name": "Ada"}));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("cart", 9, &json!([1, 2, 3])).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.version_of("cart").unwrap(), 9);
    }

    #[test]
    fn missing_and_deleted() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.get("ghost").unwrap().is_none());

        store.set("ghost", 1, &json!(null)).unwrap();
        store.delete("ghost").unwrap();
        store.delete("ghost").unwrap();
        assert!(store.get("ghost").unwrap().is_none());
    }

    #[test]
    fn reset_only_removes_snapshots() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("a", 1, &json!(1)).unwrap();
        store.set("b", 1, &json!(2)).unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        store.reset().unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(store.get("b").unwrap().is_none());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn corrupted_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(store.path_for("bad").unwrap(), b"{not json").unwrap();

        let err = store.get("bad").unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[test]
    fn long_names_are_stored_under_a_digest() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let long = format!("users/{}", "x".repeat(400));
        let other = format!("users/{}", "y".repeat(400));
        store.set(&long, 3, &json!({"n": 1})).unwrap();
        store.set(&other, 4, &json!({"n": 2})).unwrap();

        let file_name = store.path_for(&long).unwrap();
        let file_name = file_name.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with('h'));
        assert_eq!(file_name.len(), 1 + 64 + 1 + EXTENSION.len());
        assert_eq!(store.version_of(&long).unwrap(), 3);
        assert_eq!(store.get(&other).unwrap().unwrap().data, json!({"n": 2}));
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.set("", 1, &json!(1)),
            Err(StorageError::InvalidName(_))
        ));
    }
}
