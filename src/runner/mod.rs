//! Per-job execution pipeline.
//!
//! A claimed job runs through: output sandbox resolution and directory
//! reservation, provider search, URL resolution, the concurrent download with
//! throttled progress accounting, checksums, manifest write and the terminal
//! store transition. Cancellation is observed at every stage boundary and
//! after every streamed chunk; worker shutdown aborts execution without a
//! terminal write so a later sweep can requeue the job.

pub mod paths;

use crate::download::{DownloadConfig, DownloadError, DownloadItem, DownloadManager, FileProgress};
use crate::jobs::models::{
    event_types, FailureCode, JobErrorEntry, JobOutcome, JobRecord, JobRequest, JobResultRecord,
};
use crate::jobs::store::JobStore;
use crate::manifest;
use crate::providers::{ProductRef, Provider, ProviderAuth, ProviderRegistry, SearchQuery};
use crate::server::metrics;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Marker file that ties an output directory to the job that reserved it.
const RESERVATION_MARKER: &str = ".nimbus-job";

/// Store writes at most once per second per job (plus file boundaries).
const STORE_WRITE_INTERVAL: Duration = Duration::from_secs(1);
/// Progress events at most once per two seconds per job.
const EVENT_INTERVAL: Duration = Duration::from_secs(2);
/// Smoothing factor for the exponential speed estimate.
const SPEED_ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub data_dir: PathBuf,
    pub download: DownloadConfig,
}

enum RunError {
    /// The abort token fired: user cancellation or worker shutdown.
    Aborted,
    Failure(JobErrorEntry),
}

impl RunError {
    fn failure(code: FailureCode, message: impl Into<String>) -> Self {
        RunError::Failure(JobErrorEntry::new(code, message))
    }
}

/// The two cancellation causes plus a merged token for the streaming paths.
/// Observation points consult the causes directly so a token that fired
/// before the watcher task was ever polled is still seen.
struct AbortSignals {
    merged: CancellationToken,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl AbortSignals {
    fn is_aborted(&self) -> bool {
        self.merged.is_cancelled() || self.cancel.is_cancelled() || self.shutdown.is_cancelled()
    }
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    providers: ProviderRegistry,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, providers: ProviderRegistry, config: RunnerConfig) -> Self {
        Self {
            store,
            providers,
            config,
        }
    }

    /// Execute one claimed job to its terminal state. `cancel` fires on user
    /// cancellation; `shutdown` on worker teardown (no terminal write).
    pub async fn run(
        &self,
        job: JobRecord,
        worker_id: &str,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) {
        let job_id = job.job_id.clone();
        let provider_name = job.provider.clone();

        // One token the whole pipeline polls, fed by either cause.
        let abort = CancellationToken::new();
        let watcher = {
            let abort = abort.clone();
            let cancel = cancel.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = shutdown.cancelled() => {}
                }
                abort.cancel();
            })
        };

        let signals = AbortSignals {
            merged: abort,
            cancel: cancel.clone(),
            shutdown: shutdown.clone(),
        };
        let outcome = self.execute(&job, worker_id, &signals).await;
        watcher.abort();

        match outcome {
            Ok((result, _)) => {
                match self.store.finish(&job_id, worker_id, JobOutcome::Succeeded(result)) {
                    Ok(true) => {
                        metrics::record_job_completed(&provider_name, "succeeded");
                        info!("Job {} succeeded", job_id);
                    }
                    Ok(false) => warn!("Job {} terminal write lost the race", job_id),
                    Err(e) => error!("Failed to persist success of job {}: {:#}", job_id, e),
                }
            }
            Err((RunError::Aborted, output_dir)) => {
                if shutdown.is_cancelled() && !cancel.is_cancelled() {
                    // Worker teardown: leave the job running; the stale sweep
                    // requeues it with attempt incremented.
                    info!("Job {} interrupted by shutdown, leaving for requeue", job_id);
                    return;
                }
                if let Some(dir) = output_dir {
                    remove_dir_best_effort(&dir).await;
                }
                match self.store.finish(
                    &job_id,
                    worker_id,
                    JobOutcome::Cancelled {
                        reason: "cancelled_during_execution".to_string(),
                    },
                ) {
                    Ok(true) => {
                        metrics::record_job_completed(&provider_name, "cancelled");
                        info!("Job {} cancelled", job_id);
                    }
                    Ok(false) => warn!("Job {} cancel write lost the race", job_id),
                    Err(e) => error!("Failed to persist cancellation of job {}: {:#}", job_id, e),
                }
            }
            Err((RunError::Failure(entry), output_dir)) => {
                if let Some(dir) = output_dir {
                    remove_dir_best_effort(&dir).await;
                }
                warn!(
                    "Job {} failed: {} ({})",
                    job_id,
                    entry.message,
                    entry.code.as_str()
                );
                match self.store.finish(&job_id, worker_id, JobOutcome::Failed(entry)) {
                    Ok(true) => metrics::record_job_completed(&provider_name, "failed"),
                    Ok(false) => warn!("Job {} failure write lost the race", job_id),
                    Err(e) => error!("Failed to persist failure of job {}: {:#}", job_id, e),
                }
            }
        }
    }

    /// The fallible pipeline. Returns the reserved output directory alongside
    /// errors that occur after reservation, so the caller can clean up.
    async fn execute(
        &self,
        job: &JobRecord,
        worker_id: &str,
        signals: &AbortSignals,
    ) -> Result<(JobResultRecord, PathBuf), (RunError, Option<PathBuf>)> {
        let request = job
            .parsed_request()
            .map_err(|e| (RunError::failure(FailureCode::Unknown, format!("corrupt request: {}", e)), None))?;

        let output_dir =
            paths::sanitize_output_dir(&self.config.data_dir, request.output_dir(), &job.job_id)
                .map_err(|e| (RunError::failure(FailureCode::PathViolation, e.to_string()), None))?;

        reserve_output_dir(&output_dir, &job.job_id).map_err(|e| (e, None))?;
        let dir = Some(output_dir.clone());

        let result = self
            .execute_in_dir(job, &request, worker_id, &output_dir, signals)
            .await
            .map_err(|e| (e, dir))?;
        Ok((result, output_dir))
    }

    async fn execute_in_dir(
        &self,
        job: &JobRecord,
        request: &JobRequest,
        worker_id: &str,
        output_dir: &Path,
        signals: &AbortSignals,
    ) -> Result<JobResultRecord, RunError> {
        let provider = self
            .providers
            .get(&job.provider)
            .ok_or_else(|| {
                RunError::failure(
                    FailureCode::Unknown,
                    format!("unsupported provider '{}'", job.provider),
                )
            })?;

        if signals.is_aborted() {
            return Err(RunError::Aborted);
        }

        provider
            .authenticate()
            .await
            .map_err(|e| RunError::failure(FailureCode::ProviderAuthError, format!("{:#}", e)))?;

        let (items, metadata) = self
            .build_download_plan(job, request, &provider, output_dir, signals)
            .await?;

        let downloaded_paths = if items.is_empty() {
            Vec::new()
        } else {
            self.download(job, worker_id, &provider, items, output_dir, signals)
                .await?
        };

        if signals.is_aborted() {
            return Err(RunError::Aborted);
        }

        let path_texts: Vec<String> = downloaded_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let mut checksums = {
            let paths = path_texts.clone();
            tokio::task::spawn_blocking(move || manifest::checksums_for_paths(&paths))
                .await
                .map_err(|e| RunError::failure(FailureCode::ChecksumFailed, e.to_string()))?
                .map_err(|e| RunError::failure(FailureCode::ChecksumFailed, format!("{:#}", e)))?
        };

        if signals.is_aborted() {
            return Err(RunError::Aborted);
        }

        let manifest_entry = manifest::build_manifest_entry(
            &job.job_id,
            &job.provider,
            &job.collection,
            &metadata,
            &path_texts,
            &checksums,
        );
        let manifest_path = {
            let dir = output_dir.to_path_buf();
            let entry = manifest_entry.clone();
            tokio::task::spawn_blocking(move || manifest::write_manifest(&dir, &entry))
                .await
                .map_err(|e| RunError::failure(FailureCode::ManifestWriteFailed, e.to_string()))?
                .map_err(|e| RunError::failure(FailureCode::ManifestWriteFailed, format!("{:#}", e)))?
        };

        let manifest_text = manifest_path.display().to_string();
        let manifest_hash = {
            let path = manifest_path.clone();
            tokio::task::spawn_blocking(move || manifest::sha256_file(&path))
                .await
                .map_err(|e| RunError::failure(FailureCode::ChecksumFailed, e.to_string()))?
                .map_err(|e| RunError::failure(FailureCode::ChecksumFailed, format!("{:#}", e)))?
        };

        let mut all_paths = path_texts;
        all_paths.push(manifest_text.clone());
        checksums.insert(manifest_text, manifest_hash);

        Ok(JobResultRecord {
            job_id: job.job_id.clone(),
            paths: all_paths,
            checksums,
            metadata,
            manifest_entry,
        })
    }

    /// Search (or enumerate) products and resolve them into download items.
    async fn build_download_plan(
        &self,
        job: &JobRecord,
        request: &JobRequest,
        provider: &Arc<dyn Provider>,
        output_dir: &Path,
        signals: &AbortSignals,
    ) -> Result<(Vec<DownloadItem>, serde_json::Value), RunError> {
        match request {
            JobRequest::SearchDownload(req) => {
                let aoi = crate::geometry::parse_aoi(req.aoi.wkt.as_deref(), req.aoi.geojson.as_ref())
                    .map_err(|e| RunError::failure(FailureCode::Unknown, format!("{:#}", e)))?;
                let query = SearchQuery {
                    collection: req.collection.clone(),
                    product_type: req.product_type.clone(),
                    start_date: req.start_date,
                    end_date: req.end_date,
                    aoi: Some(aoi),
                    tile_id: req.tile_id.clone(),
                };

                if signals.is_aborted() {
                    return Err(RunError::Aborted);
                }
                let products = provider
                    .search(&query)
                    .await
                    .map_err(|e| RunError::failure(FailureCode::ProviderSearchError, format!("{:#}", e)))?;

                let product_ids: Vec<&str> = products.iter().map(|p| p.id.as_str()).collect();
                let _ = self.store.append_event(
                    &job.job_id,
                    event_types::PRODUCTS_FOUND,
                    json!({"count": products.len(), "product_ids": product_ids}),
                );

                let items = self
                    .resolve_products(&req.collection, provider, &products, signals)
                    .await?;
                let metadata = json!({
                    "job_type": request.job_type(),
                    "provider": job.provider,
                    "collection": req.collection,
                    "product_type": req.product_type,
                    "products_found": products.len(),
                    "products_downloaded": products.len(),
                    "output_dir": output_dir.display().to_string(),
                });
                Ok((items, metadata))
            }
            JobRequest::DownloadProducts(req) => {
                let products: Vec<ProductRef> = req
                    .product_ids
                    .iter()
                    .filter(|id| !id.trim().is_empty())
                    .map(|id| ProductRef::new(id.trim(), id.trim()))
                    .collect();
                let items = self
                    .resolve_products(&req.collection, provider, &products, signals)
                    .await?;
                let metadata = json!({
                    "job_type": request.job_type(),
                    "provider": job.provider,
                    "collection": req.collection,
                    "products_requested": products.len(),
                    "products_downloaded": products.len(),
                    "output_dir": output_dir.display().to_string(),
                });
                Ok((items, metadata))
            }
        }
    }

    async fn resolve_products(
        &self,
        collection: &str,
        provider: &Arc<dyn Provider>,
        products: &[ProductRef],
        signals: &AbortSignals,
    ) -> Result<Vec<DownloadItem>, RunError> {
        let mut items = Vec::new();
        for product in products {
            if signals.is_aborted() {
                return Err(RunError::Aborted);
            }
            let mut resolved = provider.resolve(collection, product).await.map_err(|e| {
                RunError::Failure(
                    JobErrorEntry::new(FailureCode::NoDownloadURL, format!("{:#}", e))
                        .with_context(json!({"product_id": product.id})),
                )
            })?;
            items.append(&mut resolved);
        }
        Ok(items)
    }

    async fn download(
        &self,
        job: &JobRecord,
        worker_id: &str,
        provider: &Arc<dyn Provider>,
        items: Vec<DownloadItem>,
        output_dir: &Path,
        signals: &AbortSignals,
    ) -> Result<Vec<PathBuf>, RunError> {
        let manager = DownloadManager::new(
            self.config.download.clone(),
            Some(Arc::new(ProviderAuth(provider.clone()))),
        )
        .map_err(|e| RunError::failure(FailureCode::Unknown, format!("{:#}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<FileProgress>();
        let download_task = {
            let manager = manager.clone();
            let dir = output_dir.to_path_buf();
            let token = signals.merged.clone();
            tokio::spawn(async move { manager.download_all(items, &dir, token, tx).await })
        };

        let mut tracker = ProgressTracker::new();
        while let Some(update) = rx.recv().await {
            tracker.observe(self.store.as_ref(), job, worker_id, update);
        }

        let outcome = download_task
            .await
            .map_err(|e| RunError::failure(FailureCode::Unknown, format!("download task: {}", e)))?;

        match outcome {
            Ok(paths) => {
                tracker.flush(self.store.as_ref(), job, worker_id);
                metrics::record_download_bytes(&job.provider, tracker.bytes_downloaded);
                Ok(paths)
            }
            Err(DownloadError::Cancelled) => Err(RunError::Aborted),
            Err(DownloadError::Failed { url, message }) => Err(RunError::Failure(
                JobErrorEntry::new(FailureCode::DownloadFailed, message)
                    .with_context(json!({"url": url})),
            )),
        }
    }
}

/// Byte accounting plus throttled store/event publication.
struct ProgressTracker {
    files: HashMap<String, (u64, Option<u64>)>,
    bytes_downloaded: u64,
    bytes_total: u64,
    speed: f64,
    last_store_write: Option<Instant>,
    last_event: Option<Instant>,
    speed_anchor: (Instant, u64),
}

impl ProgressTracker {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
            bytes_downloaded: 0,
            bytes_total: 0,
            speed: 0.0,
            last_store_write: None,
            last_event: None,
            speed_anchor: (Instant::now(), 0),
        }
    }

    fn progress_pct(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        // 100 is reserved for the terminal transition.
        (100.0 * self.bytes_downloaded as f64 / self.bytes_total as f64).min(99.0)
    }

    fn observe(
        &mut self,
        store: &dyn JobStore,
        job: &JobRecord,
        worker_id: &str,
        update: FileProgress,
    ) {
        self.bytes_downloaded += update.delta;
        self.files
            .insert(update.file_name.clone(), (update.downloaded, update.total));
        let known_total: u64 = self.files.values().filter_map(|(_, total)| *total).sum();
        self.bytes_total = self.bytes_total.max(known_total);

        let now = Instant::now();
        let elapsed = now.duration_since(self.speed_anchor.0).as_secs_f64();
        if elapsed >= 0.2 {
            let instant_speed =
                (self.bytes_downloaded - self.speed_anchor.1) as f64 / elapsed.max(0.001);
            self.speed = if self.speed == 0.0 {
                instant_speed
            } else {
                SPEED_ALPHA * instant_speed + (1.0 - SPEED_ALPHA) * self.speed
            };
            self.speed_anchor = (now, self.bytes_downloaded);
        }

        let store_due = update.completed
            || self
                .last_store_write
                .map(|at| now.duration_since(at) >= STORE_WRITE_INTERVAL)
                .unwrap_or(true);
        if store_due {
            let total = (self.bytes_total > 0).then_some(self.bytes_total);
            if let Err(e) = store.update_progress(
                &job.job_id,
                worker_id,
                self.bytes_downloaded,
                total,
                Some(self.progress_pct()),
            ) {
                warn!("Progress write for job {} failed: {:#}", job.job_id, e);
            }
            self.last_store_write = Some(now);
        }

        let event_due = self
            .last_event
            .map(|at| now.duration_since(at) >= EVENT_INTERVAL)
            .unwrap_or(true);
        if event_due {
            let _ = store.append_event(
                &job.job_id,
                event_types::PROGRESS,
                json!({
                    "file": update.file_name,
                    "bytes": self.bytes_downloaded,
                    "bytes_total": self.bytes_total,
                    "speed": self.speed,
                    "status": "running",
                }),
            );
            self.last_event = Some(now);
        }
    }

    /// Final unthrottled write once all downloads are complete.
    fn flush(&self, store: &dyn JobStore, job: &JobRecord, worker_id: &str) {
        let total = self.bytes_total.max(self.bytes_downloaded);
        if let Err(e) = store.update_progress(
            &job.job_id,
            worker_id,
            self.bytes_downloaded,
            (total > 0).then_some(total),
            Some(self.progress_pct()),
        ) {
            warn!("Final progress write for job {} failed: {:#}", job.job_id, e);
        }
    }
}

/// Reserve the output directory for this job. A directory already owned by a
/// different job is a conflict; one owned by an earlier attempt of the same
/// job may be re-entered.
fn reserve_output_dir(output_dir: &Path, job_id: &str) -> Result<(), RunError> {
    if let Some(parent) = output_dir.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RunError::failure(FailureCode::Unknown, format!("mkdir failed: {}", e)))?;
    }

    match std::fs::create_dir(output_dir) {
        Ok(()) => {
            std::fs::write(output_dir.join(RESERVATION_MARKER), job_id).map_err(|e| {
                RunError::failure(FailureCode::Unknown, format!("marker write failed: {}", e))
            })?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let marker = output_dir.join(RESERVATION_MARKER);
            match std::fs::read_to_string(&marker) {
                Ok(owner) if owner.trim() == job_id => Ok(()),
                Ok(owner) => Err(RunError::Failure(
                    JobErrorEntry::new(
                        FailureCode::PathConflict,
                        format!("output directory is reserved by job {}", owner.trim()),
                    )
                    .with_context(json!({"output_dir": output_dir.display().to_string()})),
                )),
                Err(_) => Err(RunError::failure(
                    FailureCode::PathConflict,
                    "output directory exists and is not owned by this job",
                )),
            }
        }
        Err(e) => Err(RunError::failure(
            FailureCode::Unknown,
            format!("cannot create output directory: {}", e),
        )),
    }
}

async fn remove_dir_best_effort(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}
