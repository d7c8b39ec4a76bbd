//! Local key-value storage for the client cache and sync watermark

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::Payload;

/// Key under which the pull watermark is kept
pub const WATERMARK_KEY: &str = "lastSyncTimestamp";

/// Storage capability injected into the sync driver
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Read a typed value; entries that fail to decode read as absent
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>
    where
        Self: Sized,
    {
        Ok(self
            .get(key)?
            .and_then(|value| serde_json::from_value(value).ok()))
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        self.set(key, serde_json::to_value(value)?)
    }
}

/// Cached copy of one record on this device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub data: Payload,
    /// Local write or server write time (Unix ms)
    pub timestamp: i64,
    /// Whether the server has confirmed this content
    pub synced: bool,
    /// Last server version seen for this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}

/// JSON file store.
///
/// Every mutation rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new content on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|error| {
                Error::Storage(format!("{} is not a valid store: {error}", path.display()))
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let encoded = serde_json::to_string_pretty(entries)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, encoded)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn memory_store_is_shared_between_clones() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.set("a", json!(1)).unwrap();
        assert_eq!(clone.get("a").unwrap(), Some(json!(1)));

        clone.remove("a").unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn typed_helpers_skip_undecodable_entries() {
        let store = MemoryStore::new();
        store.set(WATERMARK_KEY, json!("not a number")).unwrap();
        assert_eq!(store.get_as::<i64>(WATERMARK_KEY).unwrap(), None);

        store.set_as(WATERMARK_KEY, &42_i64).unwrap();
        assert_eq!(store.get_as::<i64>(WATERMARK_KEY).unwrap(), Some(42));
    }

    #[test]
    fn local_entry_omits_missing_version() {
        let entry = LocalEntry {
            data: Payload::new(json!({"theme": "dark"})),
            timestamp: 10,
            synced: false,
            version: None,
            deleted: false,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("version").is_none());
        assert_eq!(value["synced"], false);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("sync_notes_1", json!({"x": 1})).unwrap();
            store.set("other", json!(true)).unwrap();
            store.remove("other").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["sync_notes_1".to_string()]);
        assert_eq!(store.get("sync_notes_1").unwrap(), Some(json!({"x": 1})));
        assert!(!tmp.path().join("nested").join("store.json.tmp").exists());
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("store.json");
        fs::write(&path, "{not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
