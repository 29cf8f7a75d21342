use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{EngineError, Result};
use crate::models::{SyncManifest, SyncState};
use crate::services::download_task::TEMP_PREFIX;
use crate::services::task_runner::{CancellationToken, ParallelTaskRunner};
use crate::utils::fs::{move_replace, write_json_atomic};
use crate::utils::hash::compute_sha256_file;
use crate::utils::paths::normalize_relative_path;

/// Per-side sync bookkeeping record, stored next to the data it covers.
pub const SYNC_MANIFEST_FILE: &str = "sync_manifest.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    Upload,
    Download,
}

/// Metadata carried alongside every stored object. The store is expected
/// to persist and echo these back verbatim on head requests.
#[derive(Clone, Debug, Default)]
pub struct ObjectMetadata {
    pub size: u64,
    pub sha256: Option<String>,
    pub last_modified_ms: Option<i64>,
}

/// Thin seam over an S3-compatible object store. Credentials, signing and
/// bucket wiring live behind implementations of this trait.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn put_object(&self, key: &str, path: &Path, metadata: &ObjectMetadata) -> Result<()>;
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get_object(&self, key: &str, dest: &Path) -> Result<()>;
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Lists `(key, size)` pairs under the prefix.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<(String, u64)>>;
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>>;
    async fn delete_objects(&self, keys: &[String]) -> Result<()>;
}

#[derive(Clone, Debug)]
struct LocalEntry {
    rel_path: String,
    abs_path: PathBuf,
    size: u64,
    modified_ms: i64,
}

#[derive(Clone, Debug)]
struct RemoteEntry {
    rel_path: String,
    key: String,
    metadata: ObjectMetadata,
}

#[derive(Debug, Default)]
struct SyncPlan {
    uploads: Vec<LocalEntry>,
    downloads: Vec<RemoteEntry>,
    remote_deletes: Vec<String>,
    local_deletes: Vec<PathBuf>,
    unchanged: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub transferred: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// One full synchronization pass between a local directory and a remote
/// prefix. The winning side is chosen once per pass and the losing side is
/// made to mirror it, deletions included.
pub struct CloudSyncOperation {
    client: Arc<dyn ObjectStoreClient>,
    local_dir: PathBuf,
    remote_prefix: String,
    token: CancellationToken,
    thread_limit: usize,
}

impl CloudSyncOperation {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        local_dir: PathBuf,
        remote_prefix: impl Into<String>,
        token: CancellationToken,
        thread_limit: usize,
    ) -> Self {
        Self {
            client,
            local_dir,
            remote_prefix: remote_prefix.into().trim_end_matches('/').to_string(),
            token,
            thread_limit,
        }
    }

    /// Which side wins. A side that has never synced loses to one that has;
    /// when both carry a record, the newer `last_sync` wins and a tie goes
    /// to upload (the local copy is what the user most recently touched).
    pub async fn determine_direction(&self) -> Result<SyncDirection> {
        let local = load_sync_manifest(&self.local_dir)?;
        let remote = self.load_remote_manifest().await?;
        Ok(match (local, remote) {
            (_, None) => SyncDirection::Upload,
            (None, Some(_)) => SyncDirection::Download,
            (Some(local), Some(remote)) => {
                if local.last_sync >= remote.last_sync {
                    SyncDirection::Upload
                } else {
                    SyncDirection::Download
                }
            }
        })
    }

    /// Runs the pass: mark both sides `Syncing`, apply deletions, run the
    /// transfers in parallel, then mark `Synced`. Any error once the
    /// `Syncing` markers are down, cancellation included, marks both sides
    /// `Unfinished` and surfaces as the primary error; bookkeeping failures
    /// on that path are logged, never masking it.
    pub async fn operate(&self) -> Result<SyncReport> {
        self.token.check()?;
        let direction = self.determine_direction().await?;
        let plan = self.build_plan(direction).await?;
        tracing::info!(
            "sync {:?}: {} transfers, {} deletions, {} unchanged",
            direction,
            match direction {
                SyncDirection::Upload => plan.uploads.len(),
                SyncDirection::Download => plan.downloads.len(),
            },
            plan.remote_deletes.len() + plan.local_deletes.len(),
            plan.unchanged
        );

        self.mark_both(SyncState::Syncing).await?;

        // From here on both sides carry a SYNCING marker, so every exit,
        // cancellation included, must settle them to a terminal state.
        let result = match self.token.check() {
            Ok(()) => self.apply(direction, &plan).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.mark_both(SyncState::Synced).await?;
                Ok(SyncReport {
                    direction,
                    transferred: match direction {
                        SyncDirection::Upload => plan.uploads.len(),
                        SyncDirection::Download => plan.downloads.len(),
                    },
                    deleted: plan.remote_deletes.len() + plan.local_deletes.len(),
                    unchanged: plan.unchanged,
                })
            }
            Err(err) => {
                if let Err(mark_err) = self.mark_both(SyncState::Unfinished).await {
                    tracing::warn!("failed to record unfinished sync: {mark_err}");
                }
                Err(err)
            }
        }
    }

    async fn apply(&self, direction: SyncDirection, plan: &SyncPlan) -> Result<()> {
        match direction {
            SyncDirection::Upload => {
                if !plan.remote_deletes.is_empty() {
                    self.client.delete_objects(&plan.remote_deletes).await?;
                }
                self.token.check()?;
                self.run_uploads(&plan.uploads).await
            }
            SyncDirection::Download => {
                for path in &plan.local_deletes {
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                self.token.check()?;
                self.run_downloads(&plan.downloads).await
            }
        }
    }

    async fn run_uploads(&self, uploads: &[LocalEntry]) -> Result<()> {
        let mut tasks = Vec::new();
        for entry in uploads.iter().cloned() {
            let client = Arc::clone(&self.client);
            let key = self.remote_key(&entry.rel_path);
            tasks.push(async move {
                let sha256 = compute_sha256_file(&entry.abs_path)?;
                let metadata = ObjectMetadata {
                    size: entry.size,
                    sha256: Some(sha256),
                    last_modified_ms: Some(entry.modified_ms),
                };
                client.put_object(&key, &entry.abs_path, &metadata).await
            });
        }
        ParallelTaskRunner::new(self.thread_limit, self.token.clone())
            .run(tasks)
            .await
    }

    async fn run_downloads(&self, downloads: &[RemoteEntry]) -> Result<()> {
        let mut tasks = Vec::new();
        for entry in downloads.iter().cloned() {
            let client = Arc::clone(&self.client);
            let dest = self.local_dir.join(&entry.rel_path);
            tasks.push(async move { download_one(client.as_ref(), &entry, &dest).await });
        }
        ParallelTaskRunner::new(self.thread_limit, self.token.clone())
            .run(tasks)
            .await
    }

    /// Builds the asymmetric plan: the winning side's files overwrite their
    /// changed counterparts, and files absent from the winning side are
    /// deleted from the losing side.
    async fn build_plan(&self, direction: SyncDirection) -> Result<SyncPlan> {
        let local = self.index_local()?;
        let remote = self.index_remote().await?;
        let mut plan = SyncPlan::default();

        for (rel_path, local_entry) in &local {
            match remote.get(rel_path) {
                None => match direction {
                    SyncDirection::Upload => plan.uploads.push(local_entry.clone()),
                    SyncDirection::Download => {
                        plan.local_deletes.push(local_entry.abs_path.clone())
                    }
                },
                Some(remote_entry) => {
                    if entries_match(local_entry, remote_entry)? {
                        plan.unchanged += 1;
                    } else {
                        match direction {
                            SyncDirection::Upload => plan.uploads.push(local_entry.clone()),
                            SyncDirection::Download => plan.downloads.push(remote_entry.clone()),
                        }
                    }
                }
            }
        }
        for (rel_path, remote_entry) in &remote {
            if local.contains_key(rel_path) {
                continue;
            }
            match direction {
                SyncDirection::Upload => plan.remote_deletes.push(remote_entry.key.clone()),
                SyncDirection::Download => plan.downloads.push(remote_entry.clone()),
            }
        }

        plan.uploads.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        plan.downloads.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        plan.remote_deletes.sort();
        plan.local_deletes.sort();
        Ok(plan)
    }

    fn index_local(&self) -> Result<HashMap<String, LocalEntry>> {
        let mut index = HashMap::new();
        if !self.local_dir.is_dir() {
            return Ok(index);
        }
        for entry in walkdir::WalkDir::new(&self.local_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            // Bookkeeping and crash leftovers are not payload.
            if name == SYNC_MANIFEST_FILE || name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.local_dir) else {
                continue;
            };
            let rel_path = normalize_relative_path(&rel.to_string_lossy());
            let metadata = entry.metadata().map_err(|err| {
                EngineError::ObjectStore(format!("failed to stat {rel_path}: {err}"))
            })?;
            index.insert(
                rel_path.clone(),
                LocalEntry {
                    rel_path,
                    abs_path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    modified_ms: modified_ms(&metadata),
                },
            );
        }
        Ok(index)
    }

    /// Remote index: one list plus one head per listed key. Heads are the
    /// only way to recover the sha256/mtime metadata uploads recorded.
    async fn index_remote(&self) -> Result<HashMap<String, RemoteEntry>> {
        let prefix = format!("{}/", self.remote_prefix);
        let manifest_key = self.manifest_key();
        let mut index = HashMap::new();
        for (key, size) in self.client.list_objects(&prefix).await? {
            if key == manifest_key {
                continue;
            }
            let Some(rel_path) = key.strip_prefix(&prefix) else {
                continue;
            };
            let rel_path = rel_path.to_string();
            let metadata = self
                .client
                .head_object(&key)
                .await?
                .unwrap_or(ObjectMetadata {
                    size,
                    sha256: None,
                    last_modified_ms: None,
                });
            index.insert(
                rel_path.clone(),
                RemoteEntry {
                    rel_path,
                    key,
                    metadata,
                },
            );
        }
        Ok(index)
    }

    async fn mark_both(&self, state: SyncState) -> Result<()> {
        let manifest = SyncManifest::new(Utc::now().timestamp_millis(), state);
        save_sync_manifest(&self.local_dir, &manifest)?;
        let bytes = serde_json::to_vec(&manifest)?;
        self.client.put_bytes(&self.manifest_key(), bytes).await
    }

    async fn load_remote_manifest(&self) -> Result<Option<SyncManifest>> {
        let Some(bytes) = self.client.get_bytes(&self.manifest_key()).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn manifest_key(&self) -> String {
        self.remote_key(SYNC_MANIFEST_FILE)
    }

    fn remote_key(&self, rel_path: &str) -> String {
        format!("{}/{rel_path}", self.remote_prefix)
    }
}

/// Equality test for one file across the two sides: size, millisecond
/// mtime and content hash must all agree. Remote metadata that cannot be
/// resolved can never prove equality and counts as changed. The hash is
/// computed last so size/mtime mismatches skip the file read.
fn entries_match(local: &LocalEntry, remote: &RemoteEntry) -> Result<bool> {
    if local.size != remote.metadata.size {
        return Ok(false);
    }
    if remote.metadata.last_modified_ms != Some(local.modified_ms) {
        return Ok(false);
    }
    let Some(remote_sha256) = &remote.metadata.sha256 else {
        return Ok(false);
    };
    Ok(&compute_sha256_file(&local.abs_path)? == remote_sha256)
}

/// Fetches one object to a temp sibling, verifies it against the recorded
/// metadata and renames it into place.
async fn download_one(
    client: &dyn ObjectStoreClient,
    entry: &RemoteEntry,
    dest: &Path,
) -> Result<()> {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "object".to_string());
    let temp = dest.with_file_name(format!("{TEMP_PREFIX}{name}"));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = verify_fetched(client, entry, &temp).await;
    if let Err(err) = &result {
        tracing::warn!("download of {} failed: {err}", entry.key);
        let _ = std::fs::remove_file(&temp);
        return result;
    }
    move_replace(&temp, dest)
}

async fn verify_fetched(
    client: &dyn ObjectStoreClient,
    entry: &RemoteEntry,
    temp: &Path,
) -> Result<()> {
    client.get_object(&entry.key, temp).await?;
    let actual_len = std::fs::metadata(temp)?.len();
    if actual_len != entry.metadata.size {
        return Err(EngineError::Integrity {
            path: temp.to_path_buf(),
            expected: format!("{} bytes", entry.metadata.size),
            actual: format!("{actual_len} bytes"),
        });
    }
    if let Some(expected) = &entry.metadata.sha256 {
        let actual = compute_sha256_file(temp)?;
        if &actual != expected {
            return Err(EngineError::Integrity {
                path: temp.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

pub fn load_sync_manifest(dir: &Path) -> Result<Option<SyncManifest>> {
    let path = dir.join(SYNC_MANIFEST_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn save_sync_manifest(dir: &Path, manifest: &SyncManifest) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_json_atomic(&dir.join(SYNC_MANIFEST_FILE), manifest)
}

fn modified_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
