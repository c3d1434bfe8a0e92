//! # RetryStore
//!
//! Pending redeliveries keyed by content key, shared between delivery tasks and persisted as a
//! single JSON object between runs.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::retry::RetryEntry;

#[derive(Error, Debug)]
pub enum RetryStoreError {
    #[error("failed to access retry store file {path}: {error}")]
    IoError {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("retry store file {path} is not valid JSON: {error}")]
    SerdeError {
        path: PathBuf,
        error: serde_json::Error,
    },
}

/// A cheaply cloneable handle to a shared map of `RetryEntry` values.
#[derive(Clone, Default, Debug)]
pub struct RetryStore {
    entries: Arc<Mutex<HashMap<String, RetryEntry>>>,
}

impl RetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RetryEntry>> {
        // Every critical section is a single map operation, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite the entry stored under `key`.
    pub fn store(&self, key: String, entry: RetryEntry) {
        self.lock().insert(key, entry);
    }

    /// Take every entry out of the store.
    pub fn remove_and_return_all(&self) -> Vec<RetryEntry> {
        self.lock().drain().map(|(_, entry)| entry).collect()
    }

    /// Copy every entry, leaving the store untouched.
    pub fn snapshot_all(&self) -> Vec<RetryEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replace the contents of the store with those of the file at `path`.
    /// On error the store is left as it was.
    pub async fn load(&self, path: &Path) -> Result<usize, RetryStoreError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|error| RetryStoreError::IoError {
                path: path.to_owned(),
                error,
            })?;

        let entries: HashMap<String, RetryEntry> =
            serde_json::from_slice(&contents).map_err(|error| RetryStoreError::SerdeError {
                path: path.to_owned(),
                error,
            })?;
        let loaded = entries.len();

        *self.lock() = entries;

        Ok(loaded)
    }

    /// Rewrite the file at `path` with every entry currently in the store.
    pub async fn persist(&self, path: &Path) -> Result<usize, RetryStoreError> {
        let io_error = |error| RetryStoreError::IoError {
            path: path.to_owned(),
            error,
        };

        let snapshot: BTreeMap<String, RetryEntry> = self
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        let contents =
            serde_json::to_vec(&snapshot).map_err(|error| RetryStoreError::SerdeError {
                path: path.to_owned(),
                error,
            })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(path, contents).await.map_err(io_error)?;

        Ok(snapshot.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{decode, RECORD_LEN};
    use crate::retry::content_key;
    use chrono::{DateTime, Utc};

    fn entry(attempt_count: u32) -> RetryEntry {
        let mut raw = [0u8; RECORD_LEN];
        raw[20] = attempt_count as u8;
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        RetryEntry {
            event: decode(&raw).unwrap(),
            attempt_count,
            last_attempt_at: now,
        }
    }

    fn keyed(attempt_count: u32) -> (String, RetryEntry) {
        let entry = entry(attempt_count);
        (content_key(&entry.to_payload().unwrap()), entry)
    }

    #[test]
    fn test_store_overwrites_same_key() {
        let store = RetryStore::new();
        let (key, first) = keyed(1);

        store.store(key.clone(), first);
        store.store(key, entry(2));

        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot_all()[0].attempt_count, 2);
    }

    #[test]
    fn test_remove_and_return_all_empties_the_store() {
        let store = RetryStore::new();
        for attempt_count in 1..=3 {
            let (key, value) = keyed(attempt_count);
            store.store(key, value);
        }

        let snapshot = store.snapshot_all();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(store.len(), 3);

        let mut removed = store.remove_and_return_all();
        removed.sort_by_key(|e| e.attempt_count);
        assert_eq!(
            removed.iter().map(|e| e.attempt_count).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_stores() {
        let store = RetryStore::new();
        let mut handles = Vec::new();

        for attempt_count in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (key, value) = keyed(attempt_count);
                store.store(key, value);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 32);
    }

    #[tokio::test]
    async fn test_persist_and_load_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("reserveList.save");

        let store = RetryStore::new();
        let (key, value) = keyed(1);
        store.store(key.clone(), value.clone());
        assert_eq!(store.persist(&path).await.unwrap(), 1);

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk[&key]["ReserveTimes"], 1);

        let restored = RetryStore::new();
        let (stale_key, stale) = keyed(4);
        restored.store(stale_key, stale);

        assert_eq!(restored.load(&path).await.unwrap(), 1);
        assert_eq!(restored.snapshot_all(), vec![value]);
    }

    #[tokio::test]
    async fn test_load_errors_leave_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.save");
        let garbage = dir.path().join("garbage.save");
        std::fs::write(&garbage, b"not json").unwrap();

        let store = RetryStore::new();
        let (key, value) = keyed(1);
        store.store(key, value);

        assert!(matches!(
            store.load(&missing).await,
            Err(RetryStoreError::IoError { .. })
        ));
        assert!(matches!(
            store.load(&garbage).await,
            Err(RetryStoreError::SerdeError { .. })
        ));
        assert_eq!(store.len(), 1);
    }
}
