//! In-memory job store.
//!
//! Backs `DB_BACKEND=memory` and the unit-test suites. Same contract as the
//! SQLite store, including the global strictly-increasing event sequence;
//! nothing survives a process restart.

use super::models::{
    CancelOutcome, JobErrorEntry, JobEvent, JobFilter, JobOutcome, JobPage, JobRecord, JobRequest,
    JobResultRecord, JobState,
};
use super::store::{EventScope, JobStore};
use crate::jobs::models::event_types;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    events: Vec<JobEvent>,
    results: HashMap<String, JobResultRecord>,
    next_event_id: i64,
}

impl Inner {
    fn push_event(&mut self, job_id: &str, event_type: &str, payload: serde_json::Value) -> i64 {
        self.next_event_id += 1;
        let id = self.next_event_id;
        self.events.push(JobEvent {
            id,
            job_id: job_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        });
        id
    }

    fn owned_live_job(&mut self, job_id: &str, worker_id: &str) -> Option<&mut JobRecord> {
        self.jobs.get_mut(job_id).filter(|job| {
            job.owner_token.as_deref() == Some(worker_id)
                && matches!(job.state, JobState::Running | JobState::CancelRequested)
        })
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, request: &JobRequest) -> Result<String> {
        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            job_type: request.job_type().to_string(),
            provider: request.provider().as_str().to_string(),
            collection: request.collection().to_string(),
            request: serde_json::to_value(request)?,
            state: JobState::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            bytes_total: None,
            attempt: 1,
            owner_token: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            errors: Vec::new(),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job_id.clone(), record);
        inner.push_event(&job_id, event_types::QUEUED, serde_json::json!({"state": "queued"}));
        Ok(job_id)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.get(job_id).cloned())
    }

    fn claim_next(&self, worker_id: &str, providers: Option<&[String]>) -> Result<Option<JobRecord>> {
        let mut inner = self.inner.lock().unwrap();

        let candidate = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .filter(|job| {
                providers
                    .map(|allow| allow.iter().any(|p| p == &job.provider))
                    .unwrap_or(true)
            })
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            })
            .map(|job| job.job_id.clone());

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let now = Utc::now();
        {
            let job = inner.jobs.get_mut(&job_id).unwrap();
            job.state = JobState::Running;
            job.owner_token = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.last_heartbeat_at = Some(now);
            job.updated_at = now;
        }
        inner.push_event(
            &job_id,
            event_types::STARTED,
            serde_json::json!({"state": "running", "worker": worker_id}),
        );
        Ok(inner.jobs.get(&job_id).cloned())
    }

    fn release_back_to_queue(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.owner_token.as_deref() != Some(worker_id) || job.state != JobState::Running {
            return Ok(false);
        }
        job.state = JobState::Queued;
        job.owner_token = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.owned_live_job(job_id, worker_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    fn update_progress(
        &self,
        job_id: &str,
        worker_id: &str,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
        progress: Option<f64>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.owned_live_job(job_id, worker_id) else {
            return Ok(false);
        };
        job.bytes_downloaded = job.bytes_downloaded.max(bytes_downloaded);
        if let Some(total) = bytes_total {
            job.bytes_total = Some(job.bytes_total.unwrap_or(0).max(total));
        }
        if let Some(pct) = progress {
            job.progress = job.progress.max(pct);
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    fn request_cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.jobs.get(job_id).map(|job| job.state) else {
            return Ok(CancelOutcome::Unknown);
        };

        let outcome = match state {
            state if state.is_terminal() => CancelOutcome::AlreadyTerminal,
            JobState::Queued => {
                let now = Utc::now();
                {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::Cancelled;
                    job.finished_at = Some(now);
                    job.owner_token = None;
                    job.updated_at = now;
                }
                inner.push_event(
                    job_id,
                    event_types::CANCELLED,
                    serde_json::json!({"status": "cancelled", "reason": "cancelled_while_queued"}),
                );
                CancelOutcome::Applied
            }
            JobState::Running => {
                {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::CancelRequested;
                    job.updated_at = Utc::now();
                }
                inner.push_event(
                    job_id,
                    event_types::CANCEL_REQUESTED,
                    serde_json::json!({"state": "cancel_requested"}),
                );
                CancelOutcome::Applied
            }
            // Already flagged; keep the request idempotent.
            _ => CancelOutcome::Applied,
        };
        Ok(outcome)
    }

    fn finish(&self, job_id: &str, worker_id: &str, outcome: JobOutcome) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.owned_live_job(job_id, worker_id).is_none() {
            return Ok(false);
        }

        let now = Utc::now();
        match outcome {
            JobOutcome::Succeeded(result) => {
                {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::Succeeded;
                    job.progress = 100.0;
                    job.finished_at = Some(now);
                    job.owner_token = None;
                    job.updated_at = now;
                }
                let paths = result.paths.clone();
                inner.results.insert(job_id.to_string(), result);
                inner.push_event(
                    job_id,
                    event_types::SUCCEEDED,
                    serde_json::json!({"status": "succeeded", "paths": paths}),
                );
            }
            JobOutcome::Failed(error) => {
                {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::Failed;
                    job.finished_at = Some(now);
                    job.owner_token = None;
                    job.errors.push(error.clone());
                    job.updated_at = now;
                }
                inner.push_event(
                    job_id,
                    event_types::FAILED,
                    serde_json::json!({"status": "failed", "error": error}),
                );
            }
            JobOutcome::Cancelled { reason } => {
                {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::Cancelled;
                    job.finished_at = Some(now);
                    job.owner_token = None;
                    job.updated_at = now;
                }
                inner.push_event(
                    job_id,
                    event_types::CANCELLED,
                    serde_json::json!({"status": "cancelled", "reason": reason}),
                );
            }
        }
        Ok(true)
    }

    fn append_event(&self, job_id: &str, event_type: &str, payload: serde_json::Value) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.push_event(job_id, event_type, payload))
    }

    fn requeue_incomplete(&self, stale_before: Option<DateTime<Utc>>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let stale_ids: Vec<String> = inner
            .jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Running | JobState::CancelRequested))
            .filter(|job| {
                stale_before
                    .map(|threshold| {
                        job.last_heartbeat_at
                            .or(job.started_at)
                            .unwrap_or(job.created_at)
                            < threshold
                    })
                    .unwrap_or(true)
            })
            .map(|job| job.job_id.clone())
            .collect();

        let now = Utc::now();
        for job_id in &stale_ids {
            {
                let job = inner.jobs.get_mut(job_id).unwrap();
                job.state = JobState::Queued;
                job.owner_token = None;
                job.attempt += 1;
                job.updated_at = now;
            }
            inner.push_event(
                job_id,
                event_types::REQUEUED_AFTER_RESTART,
                serde_json::json!({"reason": "stale_or_restarted_worker"}),
            );
        }
        Ok(stale_ids.len())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|job| filter.state.map(|s| job.state == s).unwrap_or(true))
            .filter(|job| {
                filter
                    .provider
                    .as_deref()
                    .map(|p| job.provider == p)
                    .unwrap_or(true)
            })
            .filter(|job| filter.date_from.map(|from| job.created_at >= from).unwrap_or(true))
            .filter(|job| filter.date_to.map(|to| job.created_at <= to).unwrap_or(true))
            .collect();

        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        let total = matches.len();
        let items = matches
            .into_iter()
            .skip(filter.offset())
            .take(filter.page_size())
            .cloned()
            .collect();
        Ok(JobPage { items, total })
    }

    fn get_result(&self, job_id: &str) -> Result<Option<JobResultRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.results.get(job_id).cloned())
    }

    fn list_events(&self, scope: &EventScope, since: Option<i64>, limit: usize) -> Result<Vec<JobEvent>> {
        let inner = self.inner.lock().unwrap();
        let events = inner
            .events
            .iter()
            .filter(|event| match scope {
                EventScope::All => true,
                EventScope::Job(job_id) => &event.job_id == job_id,
            })
            .filter(|event| since.map(|cursor| event.id > cursor).unwrap_or(true))
            .take(limit.clamp(1, 1000))
            .cloned()
            .collect();
        Ok(events)
    }
}
