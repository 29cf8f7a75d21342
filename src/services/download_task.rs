use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{EngineError, Result};
use crate::services::content_cache::ContentCache;
use crate::services::http::HttpDownloader;
use crate::services::progress::TaskProgress;
use crate::services::task_runner::CancellationToken;
use crate::services::validation::{DownloadValidation, HashFunction};
use crate::utils::fs::move_replace;

/// Prefix for in-flight download siblings. Anything carrying it is a crash
/// leftover and gets deleted unconditionally by the untracked-file scan.
pub const TEMP_PREFIX: &str = "__tmp_";

const DEFAULT_TRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Fetches one URL to a destination path with retry, mirror fallback, a
/// redundancy check and an optional content-cache short-circuit.
#[derive(Clone)]
pub struct DownloadTask {
    url: String,
    mirrors: Vec<String>,
    dest: PathBuf,
    validation: DownloadValidation,
    cache: Option<ContentCache>,
    etag: Option<String>,
    tries: u32,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, dest: PathBuf, validation: DownloadValidation) -> Self {
        Self {
            url: url.into(),
            mirrors: Vec::new(),
            dest,
            validation,
            cache: None,
            etag: None,
            tries: DEFAULT_TRIES,
        }
    }

    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }

    pub fn with_cache(mut self, cache: ContentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.validation.validation.expected_size()
    }

    fn expected_sha1(&self) -> Option<&str> {
        self.validation.validation.expected_hash(HashFunction::Sha1)
    }

    /// True when the destination already exists and validates, meaning the
    /// task need not be scheduled at all.
    pub fn is_redundant(&self) -> bool {
        self.dest.is_file() && self.validation.validation.validate(&self.dest).unwrap_or(false)
    }

    pub async fn execute(
        &self,
        client: &dyn HttpDownloader,
        progress: &mut TaskProgress,
        token: &CancellationToken,
    ) -> Result<()> {
        token.check()?;

        // Pathological manifests declare empty files; synthesize them
        // instead of bothering the network.
        if self.expected_size() == Some(0) {
            if let Some(parent) = self.dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.dest, b"")?;
            return Ok(());
        }

        if self.is_redundant() {
            if let Some(size) = self.expected_size() {
                progress.report(size);
            }
            return Ok(());
        }

        if self.try_cache_copy(progress)? {
            return Ok(());
        }

        self.fetch(client, progress, token).await
    }

    /// Resolves the file from the content cache instead of the network.
    fn try_cache_copy(&self, progress: &mut TaskProgress) -> Result<bool> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        let Some(sha1) = self.expected_sha1() else {
            return Ok(false);
        };
        let Some(cached) = cache.get(sha1) else {
            return Ok(false);
        };

        if let Some(parent) = self.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&cached, &self.dest)?;
        if self.validation.validation.validate(&self.dest)? {
            tracing::debug!("resolved {} from content cache", self.dest.display());
            if let Some(size) = self.expected_size() {
                progress.report(size);
            }
            return Ok(true);
        }
        // Cached copy did not validate; fall back to the network.
        let _ = std::fs::remove_file(&self.dest);
        Ok(false)
    }

    async fn fetch(
        &self,
        client: &dyn HttpDownloader,
        progress: &mut TaskProgress,
        token: &CancellationToken,
    ) -> Result<()> {
        let temp = self.temp_path();
        let etag = if self.validation.use_etag {
            self.etag.as_deref()
        } else {
            None
        };

        let mut last_reason = String::new();
        for attempt in 1..=self.tries {
            for url in std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
            {
                token.check()?;

                let mut callback = |written: u64| progress.report(written);
                let outcome = match client.get(url, &temp, &mut callback, etag).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::warn!("attempt {attempt} for {url} failed: {err}");
                        last_reason = err.to_string();
                        let _ = std::fs::remove_file(&temp);
                        continue;
                    }
                };

                if outcome.up_to_date && self.dest.is_file() {
                    return Ok(());
                }

                if self.validation.validation.validate(&temp)? {
                    move_replace(&temp, &self.dest)?;
                    self.offer_to_cache();
                    return Ok(());
                }

                let actual_len = std::fs::metadata(&temp).map(|meta| meta.len()).unwrap_or(0);
                last_reason = format!(
                    "integrity mismatch (expected size {:?} sha1 {:?}, got {} bytes)",
                    self.expected_size(),
                    self.expected_sha1(),
                    actual_len
                );
                tracing::warn!("attempt {attempt} for {url}: {last_reason}");
                let _ = std::fs::remove_file(&temp);
            }
            if attempt < self.tries {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }

        Err(EngineError::Download {
            url: self.url.clone(),
            attempts: self.tries,
            reason: last_reason,
        })
    }

    /// Freshly downloaded bytes feed the cache for reuse by other
    /// instances. Failures here never fail the download itself.
    fn offer_to_cache(&self) {
        let (Some(cache), Some(sha1)) = (&self.cache, self.expected_sha1()) else {
            return;
        };
        if let Err(err) = cache.put(&self.dest, sha1) {
            tracing::warn!("failed to cache downloaded file: {err}");
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .dest
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        self.dest
            .with_file_name(format!("{TEMP_PREFIX}{name}"))
    }
}
