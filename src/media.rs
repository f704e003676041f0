//! Retry-with-timeout wrappers for media uploads and downloads, plus progress tracking.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::core::{ResilienceError, ResilienceResult};

const BYTE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
const PROGRESS_MILESTONE: u8 = 20;

pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone)]
pub struct TransferOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressCallback>,
}

impl TransferOptions {
    pub fn upload() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            timeout: None,
            on_progress: None,
        }
    }

    pub fn download() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            ..Self::upload()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Media transfer helper. Progress is tracked per transfer id.
#[derive(Debug, Default)]
pub struct MediaTransfer {
    uploads: Mutex<HashMap<String, u8>>,
    downloads: Mutex<HashMap<String, u8>>,
}

impl MediaTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `upload` until it succeeds or `max_retries` attempts have failed.
    pub async fn upload_with_retry<T, F, Fut>(
        &self,
        upload: F,
        options: &TransferOptions,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        run_with_retry(Direction::Upload, upload, options).await
    }

    /// Like [`MediaTransfer::upload_with_retry`], for byte payloads.
    pub async fn download_with_retry<F, Fut>(
        &self,
        download: F,
        options: &TransferOptions,
    ) -> ResilienceResult<Bytes>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<Bytes>>,
    {
        let data = run_with_retry(Direction::Download, download, options).await?;
        info!(size = %format_bytes(data.len() as u64), "media downloaded");
        Ok(data)
    }

    pub fn track_upload_progress(&self, id: &str, progress: u8) {
        track(&self.uploads, Direction::Upload, id, progress);
    }

    pub fn track_download_progress(&self, id: &str, progress: u8) {
        track(&self.downloads, Direction::Download, id, progress);
    }

    pub fn upload_progress(&self, id: &str) -> u8 {
        self.uploads.lock().get(id).copied().unwrap_or(0)
    }

    pub fn download_progress(&self, id: &str) -> u8 {
        self.downloads.lock().get(id).copied().unwrap_or(0)
    }

    pub fn clear_progress(&self, id: &str) {
        self.uploads.lock().remove(id);
        self.downloads.lock().remove(id);
    }
}

fn track(map: &Mutex<HashMap<String, u8>>, direction: Direction, id: &str, progress: u8) {
    let progress = progress.min(100);
    map.lock().insert(id.to_string(), progress);
    if progress % PROGRESS_MILESTONE == 0 {
        info!(direction = direction.as_str(), id, progress, "transfer progress");
    }
}

async fn run_with_retry<T, F, Fut>(
    direction: Direction,
    mut transfer: F,
    options: &TransferOptions,
) -> ResilienceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ResilienceResult<T>>,
{
    let max_retries = options.max_retries.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        info!(direction = direction.as_str(), attempt, max_retries, "starting media transfer");

        let result = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, transfer())
                .await
                .unwrap_or_else(|_| {
                    Err(ResilienceError::Timeout {
                        context: format!(
                            "media {} exceeded {}ms",
                            direction.as_str(),
                            limit.as_millis()
                        ),
                    })
                }),
            None => transfer().await,
        };

        match result {
            Ok(value) => {
                info!(direction = direction.as_str(), attempt, "media transfer succeeded");
                if let Some(on_progress) = &options.on_progress {
                    on_progress(100);
                }
                return Ok(value);
            }
            Err(err) if attempt >= max_retries => {
                error!(
                    direction = direction.as_str(),
                    attempts = attempt,
                    error = %err,
                    "media transfer failed"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = options.retry_delay.saturating_mul(attempt);
                warn!(
                    direction = direction.as_str(),
                    attempt,
                    delay_ms = delay.as_millis().min(u64::MAX as u128) as u64,
                    error = %err,
                    "media transfer failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Human-readable byte size, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rendered = format!("{value:.2}");
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", BYTE_UNITS[unit])
}
