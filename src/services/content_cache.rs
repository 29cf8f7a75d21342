use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::utils::fs::write_atomic;
use crate::utils::hash::is_sha1_hex;

const INDEX_FILE: &str = "index.json";
const PREFIX_LEN: usize = 2;

#[derive(Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    hashes: Vec<String>,
}

struct CacheIndex {
    hashes: HashSet<String>,
    dirty: bool,
    suspend_depth: u32,
}

struct CacheInner {
    root: PathBuf,
    index: Mutex<CacheIndex>,
}

/// Local content-addressed store keyed by SHA-1, shared across instances so
/// two installs never download the same bytes twice. Layout mirrors the
/// Minecraft assets convention: `<root>/<hash[0:2]>/<hash>`.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<CacheInner>,
}

impl ContentCache {
    /// Opens the cache, dropping index entries whose backing file is gone
    /// and persisting the cleaned index right away.
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;

        let index_path = root.join(INDEX_FILE);
        let mut hashes = HashSet::new();
        let mut dirty = false;
        if index_path.is_file() {
            let raw = fs::read_to_string(&index_path)?;
            let parsed: IndexFile = serde_json::from_str(&raw).unwrap_or_default();
            for hash in parsed.hashes {
                if artifact_path(&root, &hash).is_file() {
                    hashes.insert(hash);
                } else {
                    tracing::debug!("dropping stale cache index entry {hash}");
                    dirty = true;
                }
            }
        } else {
            dirty = true;
        }

        let cache = Self {
            inner: Arc::new(CacheInner {
                root,
                index: Mutex::new(CacheIndex {
                    hashes,
                    dirty,
                    suspend_depth: 0,
                }),
            }),
        };
        cache.flush()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.lock().hashes.contains(hash)
    }

    /// Returns the cached path for a hash, or None on a miss. Detecting a
    /// missing backing file here self-heals the index; cache corruption is
    /// never surfaced to the caller.
    pub fn get(&self, hash: &str) -> Option<PathBuf> {
        if !self.exists(hash) {
            return None;
        }
        let path = artifact_path(&self.inner.root, hash);
        if path.is_file() {
            return Some(path);
        }

        tracing::warn!("cache entry {hash} lost its backing file, dropping");
        {
            let mut index = self.lock();
            index.hashes.remove(hash);
            index.dirty = true;
        }
        self.save_if_allowed();
        None
    }

    /// Copies a file into the cache. Additive only: an existing entry or a
    /// missing source is a no-op.
    pub fn put(&self, file: &Path, hash: &str) -> Result<()> {
        self.insert(file, hash, false)
    }

    /// Moves a file into the cache, falling back to copy-and-remove across
    /// filesystem boundaries.
    pub fn ingest(&self, file: &Path, hash: &str) -> Result<()> {
        self.insert(file, hash, true)
    }

    fn insert(&self, file: &Path, hash: &str, take: bool) -> Result<()> {
        if !is_sha1_hex(hash) {
            return Err(EngineError::illegal_state(format!(
                "content cache keys must be 160-bit SHA-1 hashes, got '{hash}'"
            )));
        }
        if !file.is_file() {
            return Ok(());
        }
        if self.exists(hash) {
            return Ok(());
        }

        let dest = artifact_path(&self.inner.root, hash);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if take {
            if fs::rename(file, &dest).is_err() {
                fs::copy(file, &dest)?;
                fs::remove_file(file)?;
            }
        } else {
            fs::copy(file, &dest)?;
        }

        {
            let mut index = self.lock();
            index.hashes.insert(hash.to_string());
            index.dirty = true;
        }
        self.save_if_allowed();
        Ok(())
    }

    /// Evicts entries older than `max_age`, judged by last access time with
    /// creation time as the fallback. Returns the number of evicted files.
    pub fn clean(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let candidates: Vec<String> = self.lock().hashes.iter().cloned().collect();

        let mut evicted = Vec::new();
        for hash in candidates {
            let path = artifact_path(&self.inner.root, &hash);
            let Ok(metadata) = fs::metadata(&path) else {
                evicted.push(hash);
                continue;
            };
            let stamp = metadata.accessed().or_else(|_| metadata.created());
            let Ok(stamp) = stamp else { continue };
            let Ok(age) = now.duration_since(stamp) else { continue };
            if age > max_age {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::warn!("failed to evict cache entry {hash}: {err}");
                    continue;
                }
                evicted.push(hash);
            }
        }

        let count = evicted.len();
        if count > 0 {
            let mut index = self.lock();
            for hash in &evicted {
                index.hashes.remove(hash);
            }
            index.dirty = true;
        }
        self.save_if_allowed();
        tracing::info!("content cache clean evicted {count} entries");
        Ok(count)
    }

    /// Startup eviction runs off the caller's thread; failures are logged
    /// and swallowed.
    pub fn start_background_clean(&self, max_age: Duration) {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = cache.clean(max_age) {
                tracing::warn!("background cache clean failed: {err}");
            }
        });
    }

    /// Suspends index persistence for bulk ingestion; the returned guard
    /// flushes once on drop.
    pub fn suspend_saving(&self) -> CacheSaveGuard {
        self.lock().suspend_depth += 1;
        CacheSaveGuard {
            cache: self.clone(),
        }
    }

    pub fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut index = self.lock();
            if !index.dirty {
                return Ok(());
            }
            index.dirty = false;
            let mut hashes: Vec<String> = index.hashes.iter().cloned().collect();
            hashes.sort();
            hashes
        };
        write_atomic(
            &self.inner.root.join(INDEX_FILE),
            &serde_json::to_vec_pretty(&IndexFile { hashes: snapshot })?,
        )
    }

    fn save_if_allowed(&self) {
        let suspended = self.lock().suspend_depth > 0;
        if suspended {
            return;
        }
        if let Err(err) = self.flush() {
            tracing::warn!("failed to persist cache index: {err}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheIndex> {
        // A poisoned cache index only ever holds a hash set; continuing with
        // the inner value is safe.
        self.inner
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn artifact_path(root: &Path, hash: &str) -> PathBuf {
    let prefix = if hash.len() >= PREFIX_LEN {
        &hash[..PREFIX_LEN]
    } else {
        hash
    };
    root.join(prefix).join(hash)
}

pub struct CacheSaveGuard {
    cache: ContentCache,
}

impl Drop for CacheSaveGuard {
    fn drop(&mut self) {
        self.cache.lock().suspend_depth -= 1;
        self.cache.save_if_allowed();
    }
}
