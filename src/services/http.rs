use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::errors::Result;

/// Asset downloads are large; timeouts are minutes, not seconds.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
pub struct DownloadOutcome {
    pub bytes_written: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// True when the server answered 304 for the caller's validator; no
    /// bytes were transferred.
    pub up_to_date: bool,
}

/// HTTP transfer seam. Mirror fallback is the caller's responsibility; this
/// layer moves bytes for exactly one URL.
#[async_trait]
pub trait HttpDownloader: Send + Sync {
    /// Streams `url` to `dest`, reporting cumulative bytes written through
    /// `progress`. When `etag` is given, an If-None-Match conditional
    /// request is made and a 304 reports `up_to_date` without a transfer.
    async fn get(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(u64) + Send),
        etag: Option<&str>,
    ) -> Result<DownloadOutcome>;

    /// HEAD probe for the content length, where the server offers one.
    async fn head_content_length(&self, url: &str) -> Result<Option<u64>>;
}

/// Simple token-bucket style throttle: a shared one-second window that
/// transfers park on once the configured budget is spent.
#[derive(Clone)]
pub struct BandwidthThrottler {
    max_bytes_per_second: u64,
    window: Arc<tokio::sync::Mutex<(std::time::Instant, u64)>>,
}

impl BandwidthThrottler {
    pub fn new(max_bytes_per_second: u64) -> Self {
        Self {
            max_bytes_per_second,
            window: Arc::new(tokio::sync::Mutex::new((std::time::Instant::now(), 0))),
        }
    }

    async fn acquire(&self, bytes: u64) {
        if self.max_bytes_per_second == 0 {
            return;
        }
        loop {
            {
                let mut window = self.window.lock().await;
                if window.0.elapsed() >= Duration::from_secs(1) {
                    *window = (std::time::Instant::now(), 0);
                }
                if window.1 + bytes <= self.max_bytes_per_second {
                    window.1 += bytes;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

pub struct ReqwestDownloader {
    client: reqwest::Client,
    throttle: BandwidthThrottler,
}

impl ReqwestDownloader {
    pub fn new(speed_limit: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            throttle: BandwidthThrottler::new(speed_limit),
        })
    }
}

#[async_trait]
impl HttpDownloader for ReqwestDownloader {
    async fn get(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(u64) + Send),
        etag: Option<&str>,
    ) -> Result<DownloadOutcome> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(DownloadOutcome {
                up_to_date: true,
                ..DownloadOutcome::default()
            });
        }
        let response = response.error_for_status()?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        };
        let etag = header(reqwest::header::ETAG);
        let last_modified = header(reqwest::header::LAST_MODIFIED);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            self.throttle.acquire(chunk.len() as u64).await;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written);
        }
        file.flush().await?;

        Ok(DownloadOutcome {
            bytes_written: written,
            etag,
            last_modified,
            up_to_date: false,
        })
    }

    async fn head_content_length(&self, url: &str) -> Result<Option<u64>> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok()))
    }
}
