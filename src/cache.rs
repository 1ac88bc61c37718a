// Persistent transform cache
// fingerprint → transform result, with a hot in-memory tier and debounced sled writes

use crate::config::BuildConfig;
use crate::core::models::{Contents, ImportRequest};
use crate::utils::{KilnError, Logger, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// What a cache hit hands back in place of running the transform stages.
///
/// Imports and chunk memberships registered by the stages are stored next to
/// the contents so a hit reproduces the whole pipeline result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub contents: Contents,
    pub source_map: Option<String>,
    pub imports: Vec<ImportRequest>,
    pub chunk_memberships: BTreeSet<String>,
}

/// Cheap to clone; every clone shares the same store and pending buffer.
#[derive(Clone)]
pub struct TransformCache {
    inner: Option<Arc<CacheInner>>,
}

struct CacheInner {
    memory: DashMap<String, CacheEntry>,
    pending: Mutex<HashMap<String, CacheEntry>>,
    db: sled::Db,
    debounce: Duration,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    // physical writes are serialized through this lock
    write_lock: Mutex<()>,
}

impl TransformCache {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Open the store named by the build config. An unusable store degrades
    /// to a disabled cache with a warning.
    pub fn open(config: &BuildConfig) -> Self {
        if !config.cache.enabled {
            return Self::disabled();
        }

        let debounce = Duration::from_millis(config.cache.flush_debounce_ms);
        match Self::open_store(&config.cache_dir(), debounce) {
            Ok(cache) => cache,
            Err(err) => {
                Logger::warn(&format!("{}; continuing without a persistent cache", err));
                Self::disabled()
            }
        }
    }

    fn open_store(dir: &Path, debounce: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| KilnError::Cache(format!("{}: {}", dir.display(), e)))?;
        let db = sled::open(dir.join("transforms.sled"))
            .map_err(|e| KilnError::Cache(format!("cannot open {}: {}", dir.display(), e)))?;

        debug!("💾 Transform cache opened at {}", dir.display());
        Ok(Self {
            inner: Some(Arc::new(CacheInner {
                memory: DashMap::new(),
                pending: Mutex::new(HashMap::new()),
                db,
                debounce,
                flush_task: Mutex::new(None),
                write_lock: Mutex::new(()),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let inner = self.inner.as_ref()?;

        if let Some(hit) = inner.memory.get(fingerprint) {
            return Some(hit.clone());
        }

        let bytes = match inner.db.get(fingerprint) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                Logger::warn(&format!("Cache read failed: {}", err));
                return None;
            }
        };

        match bincode::deserialize::<CacheEntry>(&bytes) {
            Ok(entry) => {
                inner.memory.insert(fingerprint.to_string(), entry.clone());
                Some(entry)
            }
            Err(err) => {
                debug!("Discarding undecodable cache entry {}: {}", fingerprint, err);
                None
            }
        }
    }

    /// Buffer a write; it reaches the store on the trailing debounce or on `flush`
    pub fn set(&self, fingerprint: String, entry: CacheEntry) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };

        inner.memory.insert(fingerprint.clone(), entry.clone());
        inner.pending.lock().insert(fingerprint, entry);
        self.schedule_flush(inner);
    }

    fn schedule_flush(&self, inner: &Arc<CacheInner>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Err(err) = inner.write_pending() {
                Logger::warn(&err.to_string());
            }
            return;
        };

        let weak: Weak<CacheInner> = Arc::downgrade(inner);
        let delay = inner.debounce;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.write_pending() {
                    Logger::warn(&err.to_string());
                }
            }
        });

        // restarting the timer makes the window trailing
        if let Some(previous) = inner.flush_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Cancel the pending debounce and write everything buffered, synchronously
    pub fn flush(&self) -> Result<()> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };

        if let Some(task) = inner.flush_task.lock().take() {
            task.abort();
        }
        inner.write_pending()
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.pending.lock().len())
    }
}

impl CacheInner {
    fn write_pending(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }

        let written = store_batch(batch, &self.pending, |fingerprint, entry| {
            let bytes = bincode::serialize(entry).map_err(|e| KilnError::Cache(e.to_string()))?;
            self.db
                .insert(fingerprint.as_bytes(), bytes)
                .map(|_| ())
                .map_err(|e| KilnError::Cache(e.to_string()))
        })?;
        self.db.flush().map_err(|e| KilnError::Cache(e.to_string()))?;

        debug!("💾 Flushed {} cache entries", written);
        Ok(())
    }
}

/// Store `batch` entry by entry. On the first failure every entry not yet
/// stored goes back into `pending`, unless a newer write for the same
/// fingerprint was queued meanwhile.
fn store_batch(
    batch: HashMap<String, CacheEntry>,
    pending: &Mutex<HashMap<String, CacheEntry>>,
    mut store: impl FnMut(&str, &CacheEntry) -> Result<()>,
) -> Result<usize> {
    let mut remaining = batch.into_iter();
    let mut written = 0;
    while let Some((fingerprint, entry)) = remaining.next() {
        if let Err(err) = store(&fingerprint, &entry) {
            let mut pending = pending.lock();
            for (fingerprint, entry) in std::iter::once((fingerprint, entry)).chain(remaining) {
                pending.entry(fingerprint).or_insert(entry);
            }
            return Err(err);
        }
        written += 1;
    }
    Ok(written)
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        if let Err(err) = self.write_pending() {
            Logger::warn(&format!("Cache flush on shutdown failed: {}", err));
        }
    }
}
