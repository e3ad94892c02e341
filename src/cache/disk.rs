use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::namespace_of;
use crate::error::{HubError, Result};

/// What lands on disk for each key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub created_at: f64,
    pub value: Value,
}

/// One JSON file per key, swapped in atomically through a temp file.
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl DiskTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `Ok(None)` when absent; `CacheCorruption` when present but unreadable as a record.
    pub fn read(&self, key: &str) -> Result<Option<DiskRecord>> {
        let raw = match fs::read_to_string(self.path(key)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str::<DiskRecord>(&raw)
            .map(Some)
            .map_err(|err| HubError::CacheCorruption {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn write(&self, key: &str, record: &DiskRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string(record)
            .map_err(|err| HubError::json(format!("disk cache entry {key}"), err))?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!("{key}.{}.{seq}.tmp", std::process::id()));
        fs::write(&tmp, json)?;
        if let Err(err) = fs::rename(&tmp, self.path(key)) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn remove_namespace(&self, namespace: &str) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys()? {
            if namespace_of(&key) == Some(namespace) && self.remove(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}
