//! Recovery stores for progress records

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use super::record::ProgressRecord;
use crate::error::RecorderError;

/// Where an upload's progress is filed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub bucket: String,
    pub key: String,
    pub source_identity: Option<String>,
}

impl DestinationKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source_identity: None,
        }
    }

    pub fn with_source_identity(mut self, identity: impl Into<String>) -> Self {
        self.source_identity = Some(identity.into());
        self
    }

    /// Stable storage name (SHA-256 hex of bucket, key and source identity)
    pub fn storage_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bucket.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.as_bytes());
        hasher.update([0u8]);
        if let Some(identity) = &self.source_identity {
            hasher.update(identity.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Identity of a local file: path, length and modification time.
///
/// Editing the file changes the identity, so stale progress is never reused.
pub fn file_identity(path: &Path) -> std::io::Result<String> {
    let canonical = fs::canonicalize(path)?;
    let metadata = fs::metadata(&canonical)?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(format!(
        "{}:{}:{}",
        canonical.to_string_lossy(),
        metadata.len(),
        modified
    ))
}

/// Durable home for progress records.
///
/// `load` returns `Ok(None)` for missing and undecodable records alike; `Err`
/// is reserved for the store itself malfunctioning.
pub trait RecoveryStore: Send + Sync {
    fn load(&self, key: &DestinationKey) -> Result<Option<ProgressRecord>, RecorderError>;
    fn save(&self, key: &DestinationKey, record: &ProgressRecord) -> Result<(), RecorderError>;
    fn delete(&self, key: &DestinationKey) -> Result<(), RecorderError>;
}

fn decode_record(key: &DestinationKey, raw: &[u8]) -> Option<ProgressRecord> {
    match serde_json::from_slice(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(
                "Discarding unreadable progress record for {}/{}: {}",
                key.bucket, key.key, e
            );
            None
        }
    }
}

/// One JSON file per destination inside a directory
#[derive(Debug, Clone)]
pub struct FileRecoveryStore {
    dir: PathBuf,
}

impl FileRecoveryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store under the system temp directory
    pub fn in_temp_dir() -> Result<Self, RecorderError> {
        Self::new(std::env::temp_dir().join("qiniu-uploader").join("records"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, key: &DestinationKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.storage_name()))
    }
}

impl RecoveryStore for FileRecoveryStore {
    fn load(&self, key: &DestinationKey) -> Result<Option<ProgressRecord>, RecorderError> {
        match fs::read(self.record_path(key)) {
            Ok(raw) => Ok(decode_record(key, &raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &DestinationKey, record: &ProgressRecord) -> Result<(), RecorderError> {
        let content = serde_json::to_vec(record)?;
        let path = self.record_path(key);
        // Readers only ever see a complete record
        let tmp_path = self
            .dir
            .join(format!("{}.{}.tmp", key.storage_name(), Uuid::new_v4()));
        fs::write(&tmp_path, content)?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, key: &DestinationKey) -> Result<(), RecorderError> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store keeping encoded records in memory
#[derive(Debug, Default)]
pub struct MemoryRecoveryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes, bypassing encoding (e.g. to plant a corrupt record)
    pub fn insert_raw(&self, key: &DestinationKey, raw: impl Into<Vec<u8>>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(key.storage_name(), raw.into());
    }

    pub fn contains(&self, key: &DestinationKey) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.contains_key(&key.storage_name())
    }
}

impl RecoveryStore for MemoryRecoveryStore {
    fn load(&self, key: &DestinationKey) -> Result<Option<ProgressRecord>, RecorderError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(&key.storage_name())
            .and_then(|raw| decode_record(key, raw)))
    }

    fn save(&self, key: &DestinationKey, record: &ProgressRecord) -> Result<(), RecorderError> {
        let content = serde_json::to_vec(record)?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(key.storage_name(), content);
        Ok(())
    }

    fn delete(&self, key: &DestinationKey) -> Result<(), RecorderError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(&key.storage_name());
        Ok(())
    }
}

/// Store that keeps nothing, disabling resume
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecoveryStore;

impl RecoveryStore for NoopRecoveryStore {
    fn load(&self, _key: &DestinationKey) -> Result<Option<ProgressRecord>, RecorderError> {
        Ok(None)
    }

    fn save(&self, _key: &DestinationKey, _record: &ProgressRecord) -> Result<(), RecorderError> {
        Ok(())
    }

    fn delete(&self, _key: &DestinationKey) -> Result<(), RecorderError> {
        Ok(())
    }
}
