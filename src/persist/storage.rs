//! Durable key-value storage backends.
//!
//! The cache treats durable storage as a synchronous, origin-scoped string
//! store with a finite quota. Every operation returns a `Result`; whether an
//! error matters is the caller's decision.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Synchronous string key-value storage.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;

    fn keys(&self) -> Result<Vec<String>, PersistenceError>;
}

fn check_quota(
    quota: Option<usize>,
    used: usize,
    replaced: usize,
    incoming: usize,
) -> Result<(), PersistenceError> {
    if let Some(quota) = quota {
        let available = quota.saturating_sub(used.saturating_sub(replaced));
        if incoming > available {
            return Err(PersistenceError::QuotaExceeded {
                needed: incoming,
                available,
            });
        }
    }
    Ok(())
}

/// In-process storage with an optional byte quota (keys + values).
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            quota: Some(quota_bytes),
        }
    }

    /// Bytes currently used.
    pub fn used_bytes(&self) -> usize {
        self.records
            .lock()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut records = self.records.lock();
        let used: usize = records.iter().map(|(k, v)| k.len() + v.len()).sum();
        let replaced = records.get(key).map_or(0, |v| key.len() + v.len());
        check_quota(self.quota, used, replaced, key.len() + value.len())?;
        records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.records.lock().keys().cloned().collect())
    }
}

const RECORD_EXT: &str = "json";

/// One file per record under a directory. File names are the hex-encoded key.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    quota: Option<usize>,
    used: Mutex<usize>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, quota: Option<usize>) -> Result<Self, PersistenceError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut used = 0usize;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                used += meta.len() as usize;
            }
        }

        debug!(path = %root.display(), used, "Opened file store");
        Ok(Self {
            root,
            quota,
            used: Mutex::new(used),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn used_bytes(&self) -> usize {
        *self.used.lock()
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{RECORD_EXT}", hex_encode(key.as_bytes())))
    }

    fn file_len(path: &Path) -> usize {
        std::fs::metadata(path).map_or(0, |m| m.len() as usize)
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match std::fs::read_to_string(self.record_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let path = self.record_path(key);
        let mut used = self.used.lock();
        let replaced = Self::file_len(&path);
        check_quota(self.quota, *used, replaced, value.len())?;

        std::fs::write(&path, value)?;
        *used = used.saturating_sub(replaced) + value.len();
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.record_path(key);
        let mut used = self.used.lock();
        let len = Self::file_len(&path);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                *used = used.saturating_sub(len);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(hex_decode)
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(key) = decoded {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
