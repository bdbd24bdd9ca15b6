//! Persistent upload offsets.
//!
//! One JSON object keyed by the absolute path of each file being uploaded:
//!
//! ```json
//! { "/home/me/video.mp4": { "savedAtEpochMs": 1700000000000, "state": "WasPaused", "lastSuccessfulByte": 3999999 } }
//! ```
//!
//! Entries are cached in memory; every mutation rewrites the file through a
//! temporary sibling and a rename, so a crash leaves either the old or the
//! new map on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use chunkup_protocol::{PersistedState, PersistenceEntry};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Value stored under each key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    saved_at_epoch_ms: i64,
    state: PersistedState,
    last_successful_byte: i64,
}

impl Record {
    fn into_entry(self, key: &str) -> PersistenceEntry {
        PersistenceEntry {
            key: key.to_string(),
            saved_at_epoch_ms: self.saved_at_epoch_ms,
            state: self.state,
            last_successful_byte: self.last_successful_byte,
        }
    }
}

impl From<&PersistenceEntry> for Record {
    fn from(entry: &PersistenceEntry) -> Self {
        Self {
            saved_at_epoch_ms: entry.saved_at_epoch_ms,
            state: entry.state,
            last_successful_byte: entry.last_successful_byte,
        }
    }
}

/// Durable map from file key to upload progress.
pub struct UploadStore {
    path: Option<PathBuf>,
    records: Mutex<HashMap<String, Record>>,
}

impl UploadStore {
    /// Opens the store at `path`, loading existing entries.
    ///
    /// A missing file is an empty store; it is created on first write.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = load_records(&path)?;
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Creates a store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Inserts or replaces the entry for `entry.key`.
    pub fn write(&self, entry: &PersistenceEntry) -> Result<(), StoreError> {
        let mut records = self.lock();
        let mut next = records.clone();
        next.insert(entry.key.clone(), Record::from(entry));
        self.persist(&next)?;
        *records = next;
        debug!(
            file = %entry.key,
            state = ?entry.state,
            last_byte = entry.last_successful_byte,
            "upload offset saved"
        );
        Ok(())
    }

    /// Deletes the entry for `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut records = self.lock();
        if records.contains_key(key) {
            let mut next = records.clone();
            next.remove(key);
            self.persist(&next)?;
            *records = next;
            debug!(file = %key, "upload offset removed");
        }
        Ok(())
    }

    /// Returns the entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<PersistenceEntry> {
        self.lock().get(key).map(|r| r.into_entry(key))
    }

    /// Returns every entry, sorted by key.
    pub fn read_all(&self) -> Vec<PersistenceEntry> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, r)| r.into_entry(key))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Last acknowledged byte for `key`, or `-1` when nothing is stored.
    pub fn read_last_byte(&self, key: &str) -> i64 {
        self.lock()
            .get(key)
            .map_or(-1, |r| r.last_successful_byte)
    }

    /// Drops entries saved more than `max_age` ago. Returns how many were
    /// removed.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(max_age_ms);

        let mut records = self.lock();
        let mut next = records.clone();
        next.retain(|_, r| r.saved_at_epoch_ms >= cutoff);
        let pruned = records.len() - next.len();
        if pruned > 0 {
            self.persist(&next)?;
            *records = next;
            info!(pruned, "dropped stale upload offsets");
        }
        Ok(pruned)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes `records` to disk. Called with the lock held so concurrent
    /// writers cannot interleave file replacements; the cache is only
    /// updated once this succeeds.
    fn persist(&self, records: &HashMap<String, Record>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(records)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Loads entries from a JSON file on disk.
fn load_records(path: &Path) -> Result<HashMap<String, Record>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let records: HashMap<String, Record> = serde_json::from_str(&data)?;
    debug!("loaded {} upload offset(s) from {:?}", records.len(), path);
    Ok(records)
}

/// Returns the default store path.
pub fn default_store_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("chunkup").join("uploads.json"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
