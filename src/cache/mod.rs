//! Two-tier cache for aggregated views.
//!
//! MEMORY is a bounded map behind one mutex and is the source of truth for
//! correctness. DISK is a directory of JSON records that survives restarts;
//! writes to it are best-effort. Expiry is checked lazily at read time.

mod clock;
mod disk;
mod key;
mod memory;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::{DiskRecord, DiskTier};
pub use key::{CacheParams, cache_key, namespace_of, sanitize_namespace};
pub use memory::{MemoryEntry, MemoryTier};

use crate::config::CacheConfig;
use crate::error::{HubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Disk,
}

/// A value read past its TTL.
#[derive(Debug, Clone)]
pub struct StaleValue<T> {
    pub value: T,
    pub age: Duration,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub disk_write_failures: u64,
    pub corrupt_entries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    disk_write_failures: AtomicU64,
    corrupt_entries: AtomicU64,
}

pub struct TieredCache {
    memory: Mutex<MemoryTier>,
    disk: DiskTier,
    clock: Arc<dyn Clock>,
    memory_ttl: f64,
    disk_ttl: f64,
    stale_max_age: f64,
    counters: Counters,
}

impl TieredCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(config.memory_capacity)),
            disk: DiskTier::new(config.dir.clone()),
            clock,
            memory_ttl: config.memory_ttl.as_secs_f64(),
            disk_ttl: config.disk_ttl.as_secs_f64(),
            stale_max_age: config
                .stale_max_age
                .max(config.disk_ttl)
                .as_secs_f64(),
            counters: Counters::default(),
        }
    }

    pub fn disk_dir(&self) -> PathBuf {
        self.disk.dir().to_path_buf()
    }

    /// Fresh value from MEMORY, else from DISK (promoted to MEMORY), else `None`.
    pub fn get<T: DeserializeOwned>(&self, namespace: &str, params: &CacheParams) -> Option<T> {
        let key = cache_key(namespace, params);
        let now = self.clock.now();

        if let Some(value) = self.fresh_memory_value(&key, now) {
            match serde_json::from_value::<T>(value) {
                Ok(value) => {
                    self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, tier = "memory", "cache hit");
                    return Some(value);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "memory entry has unexpected shape, dropping");
                    self.lock_memory().remove(&key);
                }
            }
        }

        let record = self.read_disk(&key)?;
        let age = now - record.created_at;
        if age > self.disk_ttl {
            if age > self.stale_max_age {
                debug!(key = %key, age_secs = age, "disk entry past stale horizon, deleting");
                let _ = self.disk.remove(&key);
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache miss (expired)");
            return None;
        }

        let value = match serde_json::from_value::<T>(record.value.clone()) {
            Ok(value) => value,
            Err(err) => {
                self.discard_corrupt(&key, &err.to_string());
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        self.promote(&key, record, now);
        self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, tier = "disk", "cache hit, promoted");
        Some(value)
    }

    /// Read-through: on a miss, `loader` runs and its result is stored in both tiers.
    pub fn get_or_load<T, F>(&self, namespace: &str, params: &CacheParams, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get(namespace, params) {
            return Ok(value);
        }
        let value = loader()?;
        self.set(namespace, params, &value)?;
        Ok(value)
    }

    /// Stores in MEMORY, then DISK. A DISK failure is logged, not returned.
    pub fn set<T: Serialize>(&self, namespace: &str, params: &CacheParams, value: &T) -> Result<()> {
        let key = cache_key(namespace, params);
        let value = serde_json::to_value(value)
            .map_err(|err| HubError::json(format!("cache value {key}"), err))?;
        let created_at = self.clock.now();

        let evicted = self.lock_memory().insert(
            key.clone(),
            MemoryEntry {
                created_at,
                expires_at: created_at + self.memory_ttl,
                value: value.clone(),
            },
        );
        self.note_evictions(&evicted);

        if let Err(err) = self.disk.write(&key, &DiskRecord { created_at, value }) {
            self.counters
                .disk_write_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %err, "disk cache write failed");
        }
        Ok(())
    }

    /// Newest copy from either tier regardless of TTL, up to the stale horizon.
    pub fn get_stale<T: DeserializeOwned>(
        &self,
        namespace: &str,
        params: &CacheParams,
    ) -> Option<StaleValue<T>> {
        let key = cache_key(namespace, params);
        let now = self.clock.now();

        let memory = self
            .lock_memory()
            .get(&key)
            .map(|entry| (entry.created_at, entry.value.clone(), Tier::Memory));
        let disk = self
            .read_disk(&key)
            .map(|record| (record.created_at, record.value, Tier::Disk));

        let newest = match (memory, disk) {
            (Some(m), Some(d)) => Some(if d.0 > m.0 { d } else { m }),
            (m, d) => m.or(d),
        };
        let (created_at, value, tier) = newest?;
        let age = (now - created_at).max(0.0);
        if age > self.stale_max_age {
            return None;
        }
        let value = serde_json::from_value::<T>(value).ok()?;
        Some(StaleValue {
            value,
            age: Duration::from_secs_f64(age),
            tier,
        })
    }

    /// Drops one key, or every key of `namespace` when `params` is `None`.
    /// Missing keys are not an error.
    pub fn invalidate(&self, namespace: &str, params: Option<&CacheParams>) {
        match params {
            Some(params) => {
                let key = cache_key(namespace, params);
                self.lock_memory().remove(&key);
                if let Err(err) = self.disk.remove(&key) {
                    warn!(key = %key, error = %err, "disk cache invalidate failed");
                }
                debug!(key = %key, "cache key invalidated");
            }
            None => {
                let ns = sanitize_namespace(namespace);
                let from_memory = self.lock_memory().remove_namespace(&ns);
                let from_disk = self.disk.remove_namespace(&ns).unwrap_or_else(|err| {
                    warn!(namespace = %ns, error = %err, "disk cache namespace invalidate failed");
                    0
                });
                debug!(namespace = %ns, from_memory, from_disk, "cache namespace invalidated");
            }
        }
    }

    pub fn clear(&self) {
        self.lock_memory().clear();
        if let Ok(keys) = self.disk.keys() {
            for key in keys {
                let _ = self.disk.remove(&key);
            }
        }
    }

    pub fn memory_len(&self) -> usize {
        self.lock_memory().len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            disk_write_failures: c.disk_write_failures.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
        }
    }

    fn fresh_memory_value(&self, key: &str, now: f64) -> Option<Value> {
        let mut memory = self.lock_memory();
        let entry = memory.get(key)?;
        if now <= entry.expires_at {
            return Some(entry.value.clone());
        }
        memory.remove(key);
        debug!(key = %key, "memory entry expired");
        None
    }

    /// `None` when absent or corrupt; corrupt files are deleted.
    fn read_disk(&self, key: &str) -> Option<DiskRecord> {
        match self.disk.read(key) {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(HubError::CacheCorruption { reason, .. }) => {
                self.discard_corrupt(key, &reason);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "disk cache read failed");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// The promoted copy keeps its `created_at` but gets a MEMORY lifetime
    /// from now, never past the DISK expiry.
    fn promote(&self, key: &str, record: DiskRecord, now: f64) {
        let disk_expiry = record.created_at + self.disk_ttl;
        let expires_at = (now + self.memory_ttl).min(disk_expiry);
        let mut memory = self.lock_memory();
        // Never replace a newer MEMORY copy with an older DISK one.
        if memory
            .get(key)
            .is_some_and(|entry| entry.created_at >= record.created_at)
        {
            return;
        }
        let evicted = memory.insert(
            key.to_string(),
            MemoryEntry {
                created_at: record.created_at,
                expires_at,
                value: record.value,
            },
        );
        drop(memory);
        self.note_evictions(&evicted);
    }

    fn discard_corrupt(&self, key: &str, reason: &str) {
        self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, reason = %reason, "corrupted disk cache entry, deleting");
        let _ = self.disk.remove(key);
    }

    fn note_evictions(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(count = evicted.len(), "memory tier evicted oldest entries");
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }
}
