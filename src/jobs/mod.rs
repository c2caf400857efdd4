//! Persistent job queue: records, the store contract, its backends and the
//! event tail.

pub mod events;
pub mod memory_store;
pub mod models;
pub mod sqlite_store;
pub mod store;

pub use memory_store::MemoryJobStore;
pub use models::{
    CancelOutcome, FailureCode, JobErrorEntry, JobEvent, JobFilter, JobOutcome, JobPage, JobRecord,
    JobRequest, JobResultRecord, JobState, ProviderName,
};
pub use sqlite_store::SqliteJobStore;
pub use store::{EventScope, JobStore};

use crate::config::{DbBackend, Settings};
use anyhow::Result;
use std::sync::Arc;

/// Build the store the configured backend calls for.
pub fn create_job_store(settings: &Settings) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match settings.db_backend {
        DbBackend::Sqlite => Arc::new(SqliteJobStore::new(&settings.db_path)?),
        DbBackend::Memory => Arc::new(MemoryJobStore::new()),
    };
    Ok(store)
}
