//! Control-plane route handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::ApiError;
use super::metrics;
use super::state::ServerState;
use crate::fetcher::Fetcher;
use crate::jobs::models::{JobErrorEntry, JobFilter, JobRecord, JobRequest, JobState};

/// Client-facing job status.
#[derive(Debug, Serialize)]
pub struct JobStatusBody {
    pub job_id: String,
    pub state: JobState,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub attempt: u32,
    pub provider: String,
    pub collection: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub errors: Vec<JobErrorEntry>,
}

impl From<JobRecord> for JobStatusBody {
    fn from(record: JobRecord) -> Self {
        let duration_seconds = record.duration_seconds();
        Self {
            job_id: record.job_id,
            state: record.state,
            progress: record.progress,
            bytes_downloaded: record.bytes_downloaded,
            bytes_total: record.bytes_total,
            attempt: record.attempt,
            provider: record.provider,
            collection: record.collection,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            duration_seconds,
            errors: record.errors,
        }
    }
}

pub async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "service": "nimbus-fetch",
        "status": "running",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "runtime_role": state.settings.runtime_role.as_str(),
    }))
}

pub async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "runtime_role": state.settings.runtime_role.as_str(),
        "db_backend": state.settings.db_backend.as_str(),
        "metrics_enabled": state.settings.enable_metrics,
    }))
}

pub async fn create_job(
    State(fetcher): State<Arc<Fetcher>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: JobRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid job request: {}", e)))?;
    let job_id = fetcher.submit_job(request)?;
    Ok((StatusCode::CREATED, Json(json!({"job_id": job_id}))))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchBody {
    jobs: Vec<JobRequest>,
}

pub async fn create_batch(
    State(fetcher): State<Arc<Fetcher>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let batch: BatchBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid batch request: {}", e)))?;
    let job_ids = fetcher.submit_batch(batch.jobs)?;
    Ok((StatusCode::CREATED, Json(json!({"job_ids": job_ids}))))
}

pub async fn get_job(
    State(fetcher): State<Arc<Fetcher>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusBody>, ApiError> {
    let record = fetcher.get_job(&job_id)?;
    Ok(Json(record.into()))
}

pub async fn cancel_job(
    State(fetcher): State<Arc<Fetcher>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel_requested = fetcher.cancel_job(&job_id)?;
    Ok(Json(json!({
        "job_id": job_id,
        "cancel_requested": cancel_requested,
    })))
}

pub async fn get_result(
    State(fetcher): State<Arc<Fetcher>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let result = fetcher.get_result(&job_id)?;
    Ok(Json(result))
}

pub async fn list_jobs(
    State(fetcher): State<Arc<Fetcher>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = parse_list_filter(&params)?;
    let page = fetcher.list_jobs(&filter)?;

    let items: Vec<JobStatusBody> = page.items.into_iter().map(JobStatusBody::from).collect();
    Ok(Json(json!({
        "items": items,
        "total": page.total,
        "page": filter.page(),
        "page_size": filter.page_size(),
    })))
}

pub async fn metrics_endpoint(State(state): State<ServerState>) -> Response {
    if !state.settings.enable_metrics {
        return ApiError::NotFound("Metrics are disabled.".to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

fn parse_list_filter(params: &HashMap<String, String>) -> Result<JobFilter, ApiError> {
    let state = match params.get("state") {
        Some(raw) => Some(
            JobState::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("Unknown state '{}'.", raw)))?,
        ),
        None => None,
    };

    Ok(JobFilter {
        state,
        provider: params.get("provider").cloned(),
        date_from: parse_date_param(params, "date_from")?,
        date_to: parse_date_param(params, "date_to")?,
        page: parse_usize_param(params, "page", 1)?,
        page_size: parse_usize_param(params, "page_size", 20)?,
    })
}

/// Accepts RFC 3339 timestamps or plain ISO dates (interpreted as UTC
/// midnight).
fn parse_date_param(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = params.get(name) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    if let Ok(date) = raw.parse::<NaiveDate>() {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Some(midnight.and_utc()));
        }
    }
    Err(ApiError::Validation(format!(
        "Invalid {} '{}': expected an ISO date or RFC 3339 timestamp.",
        name, raw
    )))
}

fn parse_usize_param(
    params: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ApiError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::Validation(format!("Invalid {} '{}'.", name, raw))),
    }
}
