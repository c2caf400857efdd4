//! Worker-side scheduler.
//!
//! Polls the store for queued jobs under a two-level admission scheme: a
//! global semaphore bounds total in-flight jobs, per-provider semaphores
//! bound each provider. A claimed job that cannot take its provider slot
//! immediately is released back to the queue so it cannot block jobs of
//! other providers behind it. Each running job gets a heartbeat task that
//! also observes store-side cancellation requests.

use crate::jobs::models::JobState;
use crate::jobs::store::JobStore;
use crate::runner::JobRunner;
use crate::server::metrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on claims parked within one cycle while hunting for a job
/// whose provider still has capacity.
const MAX_PARKED_CLAIMS: usize = 32;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub max_jobs: usize,
    pub provider_limits: HashMap<String, usize>,
    /// Optional provider allow-list for claims.
    pub providers_allow: Option<Vec<String>>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_job_seconds: u64,
}

pub struct Executor {
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    config: ExecutorConfig,
    global_slots: Arc<Semaphore>,
    provider_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<JobRunner>, config: ExecutorConfig) -> Self {
        let max_jobs = config.max_jobs.max(1);
        Self {
            store,
            runner,
            config,
            global_slots: Arc::new(Semaphore::new(max_jobs)),
            provider_slots: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops claiming and interrupts running jobs when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Fast-path cancellation for a job running in this process; the
    /// heartbeat loop covers jobs owned by other workers.
    pub fn cancel_local(&self, job_id: &str) {
        if let Some(token) = self.cancel_tokens.lock().unwrap().get(job_id) {
            token.cancel();
        }
    }

    fn provider_slot(&self, provider: &str) -> Arc<Semaphore> {
        let mut slots = self.provider_slots.lock().unwrap();
        slots
            .entry(provider.to_ascii_lowercase())
            .or_insert_with(|| {
                let limit = self
                    .config
                    .provider_limits
                    .get(&provider.to_ascii_lowercase())
                    .copied()
                    .unwrap_or(1)
                    .max(1);
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    fn sweep_stale(&self) {
        let threshold = Utc::now() - chrono::Duration::seconds(self.config.stale_job_seconds as i64);
        match self.store.requeue_incomplete(Some(threshold)) {
            Ok(0) => {}
            Ok(count) => info!("Requeued {} stale jobs", count),
            Err(e) => error!("Stale-job sweep failed: {:#}", e),
        }
    }

    /// Main loop. Runs until the shutdown token fires, then drains running
    /// jobs (which observe the token and stop without terminal writes).
    pub async fn run(self: Arc<Self>) {
        info!(
            "Worker {} starting (max_jobs={}, providers_allow={:?})",
            self.config.worker_id, self.config.max_jobs, self.config.providers_allow
        );

        // Startup sweep recovers jobs from workers that died ungracefully.
        self.sweep_stale();

        let sweeper = {
            let executor = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(executor.config.poll_interval.max(Duration::from_millis(100)));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => executor.sweep_stale(),
                        _ = executor.shutdown.cancelled() => return,
                    }
                }
            })
        };

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            // Reap whatever already finished.
            while tasks.try_join_next().is_some() {}

            let global_permit = tokio::select! {
                permit = self.global_slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            // One claim cycle: keep claiming until a job whose provider has a
            // free slot turns up, parking saturated-provider claims so a job
            // stuck behind a busy provider cannot starve the rest of the
            // queue. Parked jobs go back afterwards so other workers can take
            // them. No event, same attempt.
            let mut parked = Vec::new();
            let mut runnable = None;
            while parked.len() < MAX_PARKED_CLAIMS {
                match self
                    .store
                    .claim_next(&self.config.worker_id, self.config.providers_allow.as_deref())
                {
                    Ok(Some(job)) => {
                        let provider_sem = self.provider_slot(&job.provider);
                        match provider_sem.try_acquire_owned() {
                            Ok(permit) => {
                                runnable = Some((job, permit));
                                break;
                            }
                            Err(_) => {
                                debug!(
                                    "Provider {} saturated, parking job {}",
                                    job.provider, job.job_id
                                );
                                parked.push(job);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Queue claim failed: {:#}", e);
                        break;
                    }
                }
            }
            for job in parked {
                if let Err(e) = self
                    .store
                    .release_back_to_queue(&job.job_id, &self.config.worker_id)
                {
                    error!("Failed to release job {}: {:#}", job.job_id, e);
                }
            }

            let Some((job, provider_permit)) = runnable else {
                drop(global_permit);
                if self.idle_wait().await {
                    break;
                }
                continue;
            };

            let cancel = CancellationToken::new();
            self.cancel_tokens
                .lock()
                .unwrap()
                .insert(job.job_id.clone(), cancel.clone());
            metrics::inc_jobs_running();

            let executor = self.clone();
            tasks.spawn(async move {
                let _global = global_permit;
                let _provider = provider_permit;
                let job_id = job.job_id.clone();

                let heartbeat = tokio::spawn(
                    executor
                        .clone()
                        .heartbeat_loop(job_id.clone(), cancel.clone()),
                );
                executor
                    .runner
                    .run(
                        job,
                        &executor.config.worker_id,
                        cancel,
                        executor.shutdown.clone(),
                    )
                    .await;
                heartbeat.abort();

                executor.cancel_tokens.lock().unwrap().remove(&job_id);
                metrics::dec_jobs_running();
            });
        }

        info!("Worker {} draining running jobs", self.config.worker_id);
        while tasks.join_next().await.is_some() {}
        sweeper.abort();
        info!("Worker {} stopped", self.config.worker_id);
    }

    /// Sleep one poll interval; returns true when shutdown fired.
    async fn idle_wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    /// Keeps `last_heartbeat_at` fresh and watches for cancellation requests
    /// landing in the store (e.g. via another process's API).
    async fn heartbeat_loop(self: Arc<Self>, job_id: String, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => return,
                _ = cancel.cancelled() => return,
            }

            match self.store.heartbeat(&job_id, &self.config.worker_id) {
                Ok(true) => {}
                Ok(false) => {
                    // Ownership was lost (requeue or terminal); nothing left
                    // to keep alive.
                    return;
                }
                Err(e) => {
                    warn!("Heartbeat for job {} failed: {:#}", job_id, e);
                    continue;
                }
            }

            match self.store.get_job(&job_id) {
                Ok(Some(job))
                    if matches!(job.state, JobState::CancelRequested | JobState::Cancelled) =>
                {
                    info!("Observed cancellation request for job {}", job_id);
                    cancel.cancel();
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("State check for job {} failed: {:#}", job_id, e),
            }
        }
    }
}
