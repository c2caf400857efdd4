//! Job store contract.
//!
//! The store is the only shared mutable state in the system: it is the queue,
//! the event log and the result archive at once. Every implementation must
//! commit durably before returning and must keep the claim operation atomic
//! across concurrent callers.

use super::models::{
    CancelOutcome, JobEvent, JobFilter, JobOutcome, JobPage, JobRecord, JobRequest, JobResultRecord,
};
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Which slice of the event log to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    All,
    Job(String),
}

pub trait JobStore: Send + Sync {
    /// Insert a new `queued` job (attempt = 1) together with its `job.queued`
    /// event, atomically. Returns the generated job id.
    fn create_job(&self, request: &JobRequest) -> Result<String>;

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Atomically claim the oldest queued job (FIFO by `created_at`, then
    /// `job_id`), optionally restricted to an allow-list of providers.
    /// On success the job is `running`, owned by `worker_id`, its
    /// `started_at`/`last_heartbeat_at` are set and a `job.started` event is
    /// appended. No two callers can claim the same job.
    fn claim_next(&self, worker_id: &str, providers: Option<&[String]>) -> Result<Option<JobRecord>>;

    /// Inverse of a claim, used when the worker cannot take the provider
    /// slot: back to `queued`, owner cleared, attempt unchanged, no event.
    fn release_back_to_queue(&self, job_id: &str, worker_id: &str) -> Result<bool>;

    /// Refresh `last_heartbeat_at`; only the owner of a live job may do so.
    fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<bool>;

    /// Owner-checked byte/progress update. Progress and byte counters never
    /// move backwards. Throttling is the caller's concern.
    fn update_progress(
        &self,
        job_id: &str,
        worker_id: &str,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
        progress: Option<f64>,
    ) -> Result<bool>;

    /// Cancel a job: queued jobs transition straight to `cancelled`
    /// (no worker involved), running jobs to `cancel_requested`.
    fn request_cancel(&self, job_id: &str) -> Result<CancelOutcome>;

    /// Owner-checked terminal transition. Sets `finished_at`, clears the
    /// owner, appends the matching terminal event; success also persists the
    /// result atomically and pins progress at 100.
    fn finish(&self, job_id: &str, worker_id: &str, outcome: JobOutcome) -> Result<bool>;

    /// Append an event. Ids are strictly increasing across the whole store.
    fn append_event(&self, job_id: &str, event_type: &str, payload: serde_json::Value) -> Result<i64>;

    /// Requeue `running`/`cancel_requested` jobs: all of them when
    /// `stale_before` is `None`, otherwise only those whose last heartbeat is
    /// older than the given instant. Each requeued job gets attempt += 1 and
    /// a `job.requeued_after_restart` event. Returns the requeued count.
    fn requeue_incomplete(&self, stale_before: Option<DateTime<Utc>>) -> Result<usize>;

    /// Stable listing: `created_at` desc, `job_id` asc, paged.
    fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage>;

    fn get_result(&self, job_id: &str) -> Result<Option<JobResultRecord>>;

    /// Events with `id > since`, ordered by id, at most `limit`.
    fn list_events(&self, scope: &EventScope, since: Option<i64>, limit: usize) -> Result<Vec<JobEvent>>;
}
