//! Bounded-concurrency streaming downloader.
//!
//! Fetches a batch of `(url, file_name)` items into a destination directory.
//! Each file streams into a `.part` sibling and is renamed into place only
//! when complete, so a crash or cancellation never leaves a half-written
//! final path. Progress is reported as typed messages over an mpsc channel;
//! this module never touches the job store.

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of the `Authorization` header value, with an async refresh hook
/// invoked once per URL on a 401.
#[async_trait]
pub trait AuthSource: Send + Sync {
    fn authorization(&self) -> Option<String>;

    /// Obtain a fresh header value. Returning `Ok(None)` means this source
    /// cannot refresh; the 401 is then treated as fatal.
    async fn refresh(&self) -> anyhow::Result<Option<String>>;
}

/// One unit of work: a URL and the file name it lands under.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub url: String,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_concurrency: usize,
    /// Total attempts per URL, including the first.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Write-buffer granularity for streamed chunks.
    pub chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 5,
            backoff_base: Duration::from_millis(1500),
            backoff_max: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(120),
            chunk_size: 1024 * 1024,
        }
    }
}

/// Progress message for one file. `completed` marks the file boundary after
/// the final byte has been written and the file renamed into place.
#[derive(Debug, Clone)]
pub struct FileProgress {
    pub file_name: String,
    pub delta: u64,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub completed: bool,
}

/// Terminal error of a download batch.
#[derive(Debug)]
pub enum DownloadError {
    Cancelled,
    Failed { url: String, message: String },
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Cancelled => write!(f, "download cancelled"),
            DownloadError::Failed { url, message } => {
                write!(f, "download of {} failed: {}", url, message)
            }
        }
    }
}

impl std::error::Error for DownloadError {}

enum AttemptError {
    Cancelled,
    Unauthorized,
    Retryable(String),
    Fatal(String),
}

fn status_is_retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Join a provider-supplied file name under the destination directory,
/// rejecting anything that could land outside it.
fn safe_join(dest_dir: &Path, file_name: &str) -> Result<PathBuf, AttemptError> {
    let relative = Path::new(file_name);
    if relative.is_absolute() || file_name.contains('\0') {
        return Err(AttemptError::Fatal(format!(
            "unsafe file name '{}'",
            file_name
        )));
    }
    for component in relative.components() {
        match component {
            std::path::Component::Normal(_) | std::path::Component::CurDir => {}
            _ => {
                return Err(AttemptError::Fatal(format!(
                    "unsafe file name '{}'",
                    file_name
                )))
            }
        }
    }
    Ok(dest_dir.join(relative))
}

#[derive(Clone)]
pub struct DownloadManager {
    config: DownloadConfig,
    client: reqwest::Client,
    auth: Option<Arc<dyn AuthSource>>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, auth: Option<Arc<dyn AuthSource>>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            auth,
        })
    }

    /// Download every item into `dest_dir`, preserving input order in the
    /// returned paths. If any URL exhausts its retries the remaining
    /// transfers are cancelled and the first failure is reported; files that
    /// already completed are left on disk for the caller to judge.
    pub async fn download_all(
        &self,
        items: Vec<DownloadItem>,
        dest_dir: &Path,
        cancel: CancellationToken,
        progress: UnboundedSender<FileProgress>,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| DownloadError::Failed {
                url: dest_dir.display().to_string(),
                message: format!("cannot create destination directory: {}", e),
            })?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        // Child token lets a single failure abort the rest of the batch
        // without cancelling the caller's token.
        let batch_cancel = cancel.child_token();

        let mut tasks: JoinSet<(usize, Result<PathBuf, DownloadError>)> = JoinSet::new();
        let item_count = items.len();
        for (index, item) in items.into_iter().enumerate() {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            let token = batch_cancel.clone();
            let progress = progress.clone();
            let dest_dir = dest_dir.to_path_buf();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(DownloadError::Cancelled)),
                };
                let result = manager
                    .download_with_retry(&item, &dest_dir, &token, &progress)
                    .await;
                (index, result)
            });
        }

        let mut paths: Vec<Option<PathBuf>> = vec![None; item_count];
        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(path))) => paths[index] = Some(path),
                Ok((_, Err(error))) => {
                    if failure.is_none() {
                        batch_cancel.cancel();
                        failure = Some(error);
                    }
                }
                Err(join_error) => {
                    if failure.is_none() {
                        batch_cancel.cancel();
                        failure = Some(DownloadError::Failed {
                            url: String::new(),
                            message: format!("download task panicked: {}", join_error),
                        });
                    }
                }
            }
        }

        // The caller's cancellation wins over any per-URL failure.
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(paths.into_iter().flatten().collect())
    }

    async fn download_with_retry(
        &self,
        item: &DownloadItem,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &UnboundedSender<FileProgress>,
    ) -> Result<PathBuf, DownloadError> {
        let mut refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            match self.download_once(item, dest_dir, cancel, progress).await {
                Ok(path) => return Ok(path),
                Err(AttemptError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(AttemptError::Unauthorized) => {
                    // One refresh per URL; it does not consume a retry slot.
                    let auth = match &self.auth {
                        Some(auth) if !refreshed => auth,
                        _ => {
                            return Err(DownloadError::Failed {
                                url: item.url.clone(),
                                message: "unauthorized (401)".to_string(),
                            })
                        }
                    };
                    refreshed = true;
                    match auth.refresh().await {
                        Ok(Some(_)) => {
                            debug!("Refreshed authorization for {}", item.url);
                            continue;
                        }
                        Ok(None) => {
                            return Err(DownloadError::Failed {
                                url: item.url.clone(),
                                message: "unauthorized (401), no refresh available".to_string(),
                            })
                        }
                        Err(e) => {
                            return Err(DownloadError::Failed {
                                url: item.url.clone(),
                                message: format!("token refresh failed: {}", e),
                            })
                        }
                    }
                }
                Err(AttemptError::Retryable(message)) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries {
                        return Err(DownloadError::Failed {
                            url: item.url.clone(),
                            message,
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Download attempt {} for {} failed ({}), retrying in {:?}",
                        attempt, item.url, message, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    }
                }
                Err(AttemptError::Fatal(message)) => {
                    return Err(DownloadError::Failed {
                        url: item.url.clone(),
                        message,
                    })
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base.as_secs_f64()
            * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.config.backoff_max.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }

    async fn download_once(
        &self,
        item: &DownloadItem,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &UnboundedSender<FileProgress>,
    ) -> Result<PathBuf, AttemptError> {
        let mut request = self.client.get(&item.url);
        if let Some(auth) = &self.auth {
            if let Some(header) = auth.authorization() {
                request = request.header(AUTHORIZATION, header);
            }
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(format!("request error: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AttemptError::Unauthorized);
        }
        if status_is_retryable(status) {
            return Err(AttemptError::Retryable(format!("status {}", status)));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(format!("status {}", status)));
        }

        let total = response.content_length();
        let final_path = safe_join(dest_dir, &item.file_name)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AttemptError::Retryable(format!("mkdir failed: {}", e)))?;
        }
        let temp_path = {
            let mut raw = final_path.clone().into_os_string();
            raw.push(".part");
            PathBuf::from(raw)
        };

        let file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| AttemptError::Retryable(format!("cannot create temp file: {}", e)))?;
        let mut writer = BufWriter::with_capacity(self.config.chunk_size.max(64 * 1024), file);

        let mut downloaded: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(writer);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(AttemptError::Retryable(format!("read error: {}", e)));
                }
            };

            if cancel.is_cancelled() {
                drop(writer);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(AttemptError::Cancelled);
            }

            if let Err(e) = writer.write_all(&chunk).await {
                drop(writer);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(AttemptError::Retryable(format!("write error: {}", e)));
            }
            downloaded += chunk.len() as u64;
            let _ = progress.send(FileProgress {
                file_name: item.file_name.clone(),
                delta: chunk.len() as u64,
                downloaded,
                total,
                completed: false,
            });
        }

        if let Err(e) = writer.flush().await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AttemptError::Retryable(format!("flush error: {}", e)));
        }
        let file = writer.into_inner();
        if let Err(e) = file.sync_all().await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AttemptError::Retryable(format!("sync error: {}", e)));
        }
        drop(file);

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| AttemptError::Retryable(format!("rename failed: {}", e)))?;

        let _ = progress.send(FileProgress {
            file_name: item.file_name.clone(),
            delta: 0,
            downloaded,
            total,
            completed: true,
        });
        Ok(final_path)
    }
}
