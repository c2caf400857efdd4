//! Data model for jobs, events and results.
//!
//! Submission requests are a tagged union on `job_type`; unknown fields are
//! rejected at deserialization and the semantic rules live in
//! [`JobRequest::validate`]. Records mirror what the stores persist.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    CancelRequested,
    Succeeded, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::CancelRequested => "cancel_requested",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "cancel_requested" => Some(JobState::CancelRequested),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// Supported external providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Copernicus,
    Usgs,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Copernicus => "copernicus",
            ProviderName::Usgs => "usgs",
        }
    }
}

/// Classification of a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    PathViolation,
    PathConflict,
    ProviderAuthError,
    ProviderSearchError,
    NoDownloadURL,
    DownloadFailed,
    ChecksumFailed,
    ManifestWriteFailed,
    Unknown,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::PathViolation => "PathViolation",
            FailureCode::PathConflict => "PathConflict",
            FailureCode::ProviderAuthError => "ProviderAuthError",
            FailureCode::ProviderSearchError => "ProviderSearchError",
            FailureCode::NoDownloadURL => "NoDownloadURL",
            FailureCode::DownloadFailed => "DownloadFailed",
            FailureCode::ChecksumFailed => "ChecksumFailed",
            FailureCode::ManifestWriteFailed => "ManifestWriteFailed",
            FailureCode::Unknown => "Unknown",
        }
    }

    /// Whether an operator requeue makes sense for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureCode::ProviderSearchError | FailureCode::DownloadFailed | FailureCode::Unknown
        )
    }
}

/// One entry of a failed job's `errors` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub code: FailureCode,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl JobErrorEntry {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// AOI payload: exactly one of the two representations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AoiInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wkt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geojson: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchDownloadRequest {
    pub provider: ProviderName,
    pub collection: String,
    pub product_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub aoi: AoiInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadProductsRequest {
    pub provider: ProviderName,
    pub collection: String,
    pub product_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

/// A validated submission, discriminated on `job_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobRequest {
    SearchDownload(SearchDownloadRequest),
    DownloadProducts(DownloadProductsRequest),
}

impl JobRequest {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobRequest::SearchDownload(_) => "search_download",
            JobRequest::DownloadProducts(_) => "download_products",
        }
    }

    pub fn provider(&self) -> ProviderName {
        match self {
            JobRequest::SearchDownload(req) => req.provider,
            JobRequest::DownloadProducts(req) => req.provider,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            JobRequest::SearchDownload(req) => &req.collection,
            JobRequest::DownloadProducts(req) => &req.collection,
        }
    }

    pub fn output_dir(&self) -> Option<&str> {
        match self {
            JobRequest::SearchDownload(req) => req.output_dir.as_deref(),
            JobRequest::DownloadProducts(req) => req.output_dir.as_deref(),
        }
    }

    /// Trim whitespace-only noise out of list fields before persisting.
    pub fn normalize(&mut self) {
        if let JobRequest::DownloadProducts(req) = self {
            req.product_ids = req
                .product_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect();
        }
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        match self {
            JobRequest::SearchDownload(req) => {
                validate_collection_like(&req.collection, "collection")?;
                validate_collection_like(&req.product_type, "product_type")?;
                if req.end_date < req.start_date {
                    bail!("end_date must be greater or equal to start_date.");
                }
                crate::geometry::parse_aoi(req.aoi.wkt.as_deref(), req.aoi.geojson.as_ref())?;
                validate_output_dir(req.output_dir.as_deref())?;
            }
            JobRequest::DownloadProducts(req) => {
                validate_collection_like(&req.collection, "collection")?;
                if !req.product_ids.iter().any(|id| !id.trim().is_empty()) {
                    bail!("product_ids cannot be empty.");
                }
                validate_output_dir(req.output_dir.as_deref())?;
            }
        }
        Ok(())
    }
}

const COLLECTION_MAX_LEN: usize = 120;

fn validate_collection_like(value: &str, field: &str) -> Result<()> {
    if value.is_empty() || value.len() > COLLECTION_MAX_LEN {
        bail!("Invalid {} length.", field);
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("Invalid {} format.", field);
    }
    Ok(())
}

fn validate_output_dir(value: Option<&str>) -> Result<()> {
    let Some(dir) = value else {
        return Ok(());
    };
    if dir.starts_with('/') || dir.starts_with('\\') {
        bail!("output_dir must be relative.");
    }
    if dir.contains('\0') {
        bail!("output_dir must not contain NUL bytes.");
    }
    if dir.split(['/', '\\']).any(|part| part == "..") {
        bail!("output_dir traversal is not allowed.");
    }
    Ok(())
}

/// Persisted job row.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub provider: String,
    pub collection: String,
    pub request: serde_json::Value,
    pub state: JobState,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub attempt: u32,
    pub owner_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub errors: Vec<JobErrorEntry>,
}

impl JobRecord {
    pub fn parsed_request(&self) -> Result<JobRequest> {
        Ok(serde_json::from_value(self.request.clone())?)
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Append-only event row. Ids are strictly increasing across the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Event type names as they appear on the wire and in the store.
pub mod event_types {
    pub const QUEUED: &str = "job.queued";
    pub const STARTED: &str = "job.started";
    pub const PRODUCTS_FOUND: &str = "job.products_found";
    pub const PROGRESS: &str = "job.progress";
    pub const CANCEL_REQUESTED: &str = "job.cancel_requested";
    pub const CANCELLED: &str = "job.cancelled";
    pub const FAILED: &str = "job.failed";
    pub const SUCCEEDED: &str = "job.succeeded";
    pub const REQUEUED_AFTER_RESTART: &str = "job.requeued_after_restart";
    /// Synthetic stream keep-alive; never persisted.
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Terminal artifact description, written once on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultRecord {
    pub job_id: String,
    pub paths: Vec<String>,
    pub checksums: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub manifest_entry: serde_json::Value,
}

/// Terminal outcome handed to [`crate::jobs::store::JobStore::finish`].
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(JobResultRecord),
    Failed(JobErrorEntry),
    Cancelled { reason: String },
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was cancelled (queued) or flagged for cancellation (running).
    Applied,
    /// The job had already reached a terminal state.
    AlreadyTerminal,
    /// No such job.
    Unknown,
}

/// Listing filter with clamped pagination.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub provider: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            state: None,
            provider: None,
            date_from: None,
            date_to: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl JobFilter {
    pub fn page(&self) -> usize {
        self.page.max(1)
    }

    pub fn page_size(&self) -> usize {
        self.page_size.clamp(1, 200)
    }

    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.page_size()
    }
}

/// One page of job records plus the unpaged total.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub items: Vec<JobRecord>,
    pub total: usize,
}
