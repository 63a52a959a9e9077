use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{DatasetType, SessionId};
use crate::error::OneError;

/// Local on-disk cache of downloaded datasets, keyed by
/// (session id, dataset type). An entry exists only for a fully completed
/// transfer; the data file and its sidecar are published atomically.
pub struct CacheStore {
    cache_root: Utf8PathBuf,
    key_locks: Mutex<HashMap<(SessionId, DatasetType), Arc<Mutex<()>>>>,
}

/// Sidecar record for one cached dataset. `retrieved_at` is the freshness
/// marker a future expiry policy would read; nothing expires entries today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub local_path: Utf8PathBuf,
    pub retrieved_at: String,
}

impl CacheStore {
    pub fn new(cache_root: Utf8PathBuf) -> Self {
        Self {
            cache_root,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn ensure_root(&self) -> Result<(), OneError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))
    }

    /// Pure function of the key: identical inputs always derive the same
    /// path, so a warm cache is hit without any remote round trip.
    pub fn dataset_path(&self, session: &SessionId, dataset_type: &DatasetType) -> Utf8PathBuf {
        self.cache_root
            .join(session.as_str())
            .join(dataset_type.file_name())
    }

    fn entry_path(&self, session: &SessionId, dataset_type: &DatasetType) -> Utf8PathBuf {
        self.cache_root
            .join(session.as_str())
            .join("metadata")
            .join(format!("{}.json", dataset_type.file_name()))
    }

    /// Serialization point for concurrent fetches of the same key. Callers
    /// hold the returned lock across lookup-fetch-put so a second requester
    /// blocks on the first transfer instead of duplicating it. Distinct
    /// keys never contend.
    pub fn key_lock(&self, session: &SessionId, dataset_type: &DatasetType) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry((session.clone(), dataset_type.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn lookup(
        &self,
        session: &SessionId,
        dataset_type: &DatasetType,
    ) -> Result<Option<CacheEntry>, OneError> {
        let entry_path = self.entry_path(session, dataset_type);
        if !entry_path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(entry_path.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        let entry: CacheEntry =
            serde_json::from_str(&content).map_err(|err| OneError::Filesystem(err.to_string()))?;
        // A sidecar without its data file is a broken entry, not a hit.
        if !entry.local_path.as_std_path().exists() {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Registers a completed download. `source` must be a fully written
    /// file; it is moved into place atomically and the sidecar is written
    /// only after the data file rename lands.
    pub fn put(
        &self,
        session: &SessionId,
        dataset_type: &DatasetType,
        source: &Utf8Path,
    ) -> Result<CacheEntry, OneError> {
        let destination = self.dataset_path(session, dataset_type);
        copy_file_atomic(source, &destination)?;

        let entry = CacheEntry {
            local_path: destination,
            retrieved_at: chrono::Utc::now().to_rfc3339(),
        };
        let entry_path = self.entry_path(session, dataset_type);
        let content = serde_json::to_vec_pretty(&entry)
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&entry_path, &content)?;
        debug!(session = %session, dataset_type = %dataset_type, "cache entry recorded");
        Ok(entry)
    }

    pub fn invalidate(
        &self,
        session: &SessionId,
        dataset_type: &DatasetType,
    ) -> Result<(), OneError> {
        let entry_path = self.entry_path(session, dataset_type);
        let data_path = self.dataset_path(session, dataset_type);
        // Sidecar first: a data file without a sidecar is a miss, the
        // reverse would be a dangling entry.
        for path in [entry_path, data_path] {
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| OneError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Directory a resolver should stage in-progress downloads under, on
    /// the same filesystem as the final path so the publish rename is
    /// atomic.
    pub fn staging_dir(&self, session: &SessionId) -> Result<Utf8PathBuf, OneError> {
        let dir = self.cache_root.join(session.as_str());
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
        Ok(dir)
    }
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), OneError> {
    let parent = dest
        .parent()
        .ok_or_else(|| OneError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path()).map_err(|err| OneError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("one-client-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    if dest.as_std_path().exists() {
        fs::remove_file(dest.as_std_path()).map_err(|err| OneError::Filesystem(err.to_string()))?;
    }
    temp.persist(dest.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), OneError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| OneError::Filesystem(err.to_string()))?;
    Ok(())
}
