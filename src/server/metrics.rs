//! Prometheus metrics for the control plane and workers.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::warn;

const PREFIX: &str = "nimbus";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_http_requests_total"),
            "Total number of HTTP requests"
        ),
        &["method", "path", "status"]
    )
    .expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    )
    .expect("Failed to create http_request_duration_seconds metric");

    pub static ref JOBS_SUBMITTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_submitted_total"), "Jobs accepted by the admission boundary"),
        &["job_type", "provider"]
    )
    .expect("Failed to create jobs_submitted_total metric");

    pub static ref JOBS_COMPLETED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_completed_total"), "Jobs that reached a terminal state"),
        &["provider", "outcome"]
    )
    .expect("Failed to create jobs_completed_total metric");

    pub static ref JOB_CANCELLATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_cancellations_total"), "Accepted cancellation requests"),
        &["provider"]
    )
    .expect("Failed to create job_cancellations_total metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Jobs currently executing on this worker"
    )
    .expect("Failed to create jobs_running metric");

    pub static ref DOWNLOAD_BYTES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_download_bytes_total"), "Bytes downloaded from providers"),
        &["provider"]
    )
    .expect("Failed to create download_bytes_total metric");

    pub static ref STORE_ERRORS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_store_errors_total"),
        "Job store operations that returned an error"
    )
    .expect("Failed to create store_errors_total metric");
}

/// Register every metric with the global registry. Safe to call more than
/// once; duplicate registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
        Box::new(JOBS_SUBMITTED_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOB_CANCELLATIONS_TOTAL.clone()),
        Box::new(JOBS_RUNNING.clone()),
        Box::new(DOWNLOAD_BYTES_TOTAL.clone()),
        Box::new(STORE_ERRORS_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            // AlreadyReg on re-init is fine.
            warn!("Metric registration skipped: {}", e);
        }
    }
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_job_submitted(job_type: &str, provider: &str) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[job_type, provider])
        .inc();
}

pub fn record_job_completed(provider: &str, outcome: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[provider, outcome])
        .inc();
}

pub fn record_job_cancellation(provider: &str) {
    JOB_CANCELLATIONS_TOTAL.with_label_values(&[provider]).inc();
}

pub fn inc_jobs_running() {
    JOBS_RUNNING.inc();
}

pub fn dec_jobs_running() {
    JOBS_RUNNING.dec();
}

pub fn record_download_bytes(provider: &str, bytes: u64) {
    DOWNLOAD_BYTES_TOTAL
        .with_label_values(&[provider])
        .inc_by(bytes as f64);
}

/// Encode the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_render() {
        init_metrics();
        // Calling again must not panic on duplicate registration.
        init_metrics();

        record_http_request("GET", "/v1/jobs", 200, Duration::from_millis(5));
        record_job_submitted("search_download", "copernicus");
        record_job_completed("copernicus", "succeeded");
        record_download_bytes("copernicus", 1024);
        inc_jobs_running();
        dec_jobs_running();

        let text = render();
        assert!(text.contains("nimbus_http_requests_total"));
        assert!(text.contains("nimbus_jobs_submitted_total"));
        assert!(text.contains("nimbus_jobs_completed_total"));
        assert!(text.contains("nimbus_download_bytes_total"));
    }
}
