//! Service aggregate for submission, lookup and cancellation.
//!
//! Built once at startup and injected into the HTTP handlers; this is the
//! only write path for new jobs. Execution is driven by the executor polling
//! the store, so submission never talks to the worker directly; cancellation
//! additionally pokes a co-located executor for a faster reaction than the
//! next heartbeat tick.

use crate::config::Settings;
use crate::executor::Executor;
use crate::jobs::models::{CancelOutcome, JobFilter, JobPage, JobRecord, JobRequest, JobResultRecord};
use crate::jobs::store::JobStore;
use crate::server::metrics;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Failure classes the HTTP layer maps onto status codes.
#[derive(Debug)]
pub enum FetchError {
    NotFound(String),
    Invalid(String),
    Internal(anyhow::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound(what) => write!(f, "{} not found", what),
            FetchError::Invalid(message) => write!(f, "{}", message),
            FetchError::Internal(error) => write!(f, "{:#}", error),
        }
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(error: anyhow::Error) -> Self {
        FetchError::Internal(error)
    }
}

pub struct Fetcher {
    settings: Arc<Settings>,
    store: Arc<dyn JobStore>,
    /// Set after construction when this process also runs a worker.
    executor: RwLock<Option<Arc<Executor>>>,
}

impl Fetcher {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn JobStore>) -> Self {
        Self {
            settings,
            store,
            executor: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn set_executor(&self, executor: Arc<Executor>) {
        *self.executor.write().unwrap() = Some(executor);
    }

    /// Validate and persist one submission. Returns the new job id.
    pub fn submit_job(&self, mut request: JobRequest) -> Result<String, FetchError> {
        request.normalize();
        request
            .validate()
            .map_err(|e| FetchError::Invalid(format!("{:#}", e)))?;

        let job_id = self.store.create_job(&request)?;
        metrics::record_job_submitted(request.job_type(), request.provider().as_str());
        info!(
            "Queued job {} ({} via {})",
            job_id,
            request.job_type(),
            request.provider().as_str()
        );
        Ok(job_id)
    }

    /// Validate the whole batch before inserting anything, then submit each
    /// job in order.
    pub fn submit_batch(&self, requests: Vec<JobRequest>) -> Result<Vec<String>, FetchError> {
        if requests.is_empty() {
            return Err(FetchError::Invalid("jobs cannot be empty.".to_string()));
        }

        let mut normalized = Vec::with_capacity(requests.len());
        for (index, mut request) in requests.into_iter().enumerate() {
            request.normalize();
            request
                .validate()
                .map_err(|e| FetchError::Invalid(format!("jobs[{}]: {:#}", index, e)))?;
            normalized.push(request);
        }

        let mut job_ids = Vec::with_capacity(normalized.len());
        for request in &normalized {
            let job_id = self.store.create_job(request)?;
            metrics::record_job_submitted(request.job_type(), request.provider().as_str());
            job_ids.push(job_id);
        }
        Ok(job_ids)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobRecord, FetchError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| FetchError::NotFound(format!("Job '{}'", job_id)))
    }

    pub fn get_result(&self, job_id: &str) -> Result<JobResultRecord, FetchError> {
        self.store
            .get_result(job_id)?
            .ok_or_else(|| FetchError::NotFound(format!("Result for '{}'", job_id)))
    }

    /// Request cancellation. Queued jobs cancel immediately in the store;
    /// running jobs are flagged and the owning worker observes the flag.
    /// Returns whether the request applied (false once terminal).
    pub fn cancel_job(&self, job_id: &str) -> Result<bool, FetchError> {
        let provider = self.get_job(job_id)?.provider;
        match self.store.request_cancel(job_id)? {
            CancelOutcome::Unknown => Err(FetchError::NotFound(format!("Job '{}'", job_id))),
            CancelOutcome::AlreadyTerminal => Ok(false),
            CancelOutcome::Applied => {
                metrics::record_job_cancellation(&provider);
                if let Some(executor) = self.executor.read().unwrap().as_ref() {
                    executor.cancel_local(job_id);
                }
                Ok(true)
            }
        }
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, FetchError> {
        Ok(self.store.list_jobs(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory_store::MemoryJobStore;
    use crate::jobs::models::{event_types, JobState, ProviderName};
    use crate::jobs::store::{contract, EventScope};
    use serde_json::json;

    fn fetcher() -> Fetcher {
        Fetcher::new(
            Arc::new(Settings::default()),
            Arc::new(MemoryJobStore::new()),
        )
    }

    fn valid_request() -> JobRequest {
        contract::sample_request(ProviderName::Copernicus, "out")
    }

    #[test]
    fn submit_persists_queued_job() {
        let fetcher = fetcher();
        let job_id = fetcher.submit_job(valid_request()).unwrap();

        let job = fetcher.get_job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        let events = fetcher
            .store()
            .list_events(&EventScope::Job(job_id), None, 10)
            .unwrap();
        assert_eq!(events[0].event_type, event_types::QUEUED);
    }

    #[test]
    fn submit_rejects_invalid_request() {
        let fetcher = fetcher();
        let request: JobRequest = serde_json::from_value(json!({
            "job_type": "search_download",
            "provider": "copernicus",
            "collection": "SENTINEL 2",
            "product_type": "S2MSI2A",
            "start_date": "2025-01-01",
            "end_date": "2025-01-02",
            "aoi": {"wkt": "POLYGON((0 0,0 1,1 1,1 0,0 0))"}
        }))
        .unwrap();

        match fetcher.submit_job(request) {
            Err(FetchError::Invalid(_)) => {}
            other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
        }
        // Nothing was persisted.
        assert_eq!(
            fetcher.list_jobs(&JobFilter::default()).unwrap().total,
            0
        );
    }

    #[test]
    fn batch_validates_everything_before_inserting() {
        let fetcher = fetcher();
        let invalid: JobRequest = serde_json::from_value(json!({
            "job_type": "download_products",
            "provider": "usgs",
            "collection": "landsat_ot_c2_l2",
            "product_ids": ["   "]
        }))
        .unwrap();

        let result = fetcher.submit_batch(vec![valid_request(), invalid]);
        assert!(matches!(result, Err(FetchError::Invalid(_))));
        assert_eq!(fetcher.list_jobs(&JobFilter::default()).unwrap().total, 0);

        let ids = fetcher
            .submit_batch(vec![valid_request(), valid_request()])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(fetcher.list_jobs(&JobFilter::default()).unwrap().total, 2);
    }

    #[test]
    fn cancel_queued_job_is_immediate() {
        let fetcher = fetcher();
        let job_id = fetcher.submit_job(valid_request()).unwrap();

        assert!(fetcher.cancel_job(&job_id).unwrap());
        let job = fetcher.get_job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);

        // No job.started was ever appended.
        let types: Vec<String> = fetcher
            .store()
            .list_events(&EventScope::Job(job_id.clone()), None, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(!types.contains(&event_types::STARTED.to_string()));

        // Terminal now: a second cancel reports false.
        assert!(!fetcher.cancel_job(&job_id).unwrap());
    }

    #[test]
    fn lookups_report_not_found() {
        let fetcher = fetcher();
        assert!(matches!(
            fetcher.get_job("nope"),
            Err(FetchError::NotFound(_))
        ));
        assert!(matches!(
            fetcher.get_result("nope"),
            Err(FetchError::NotFound(_))
        ));
        assert!(matches!(
            fetcher.cancel_job("nope"),
            Err(FetchError::NotFound(_))
        ));
    }
}
