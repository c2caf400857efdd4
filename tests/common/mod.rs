//! Shared end-to-end test harness.
//!
//! Each test gets an isolated server on a random port with its own temp
//! data root and SQLite store, plus a local fixture file server standing in
//! for provider download endpoints.

pub mod fixtures;
pub mod server;

use serde_json::json;
use std::time::Duration;

pub use fixtures::{provider_with_files, spawn_file_server, spawn_slow_file_server};
pub use server::{TestOptions, TestServer};

/// A parsed SSE frame.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub id: Option<i64>,
    pub event: String,
    pub data: serde_json::Value,
}

/// Read up to `count` SSE frames from a streaming response, bounded by
/// `timeout`.
pub async fn read_sse_frames(
    response: reqwest::Response,
    count: usize,
    timeout: Duration,
) -> Vec<SseFrame> {
    use futures::StreamExt;

    let mut frames = Vec::new();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    let deadline = tokio::time::Instant::now() + timeout;
    while frames.len() < count {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        let Some(Ok(bytes)) = chunk else { break };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(boundary) = buffer.find("\n\n") {
            let raw = buffer[..boundary].to_string();
            buffer.drain(..boundary + 2);
            if let Some(frame) = parse_sse_frame(&raw) {
                frames.push(frame);
                if frames.len() >= count {
                    break;
                }
            }
        }
    }
    frames
}

fn parse_sse_frame(raw: &str) -> Option<SseFrame> {
    let mut id = None;
    let mut event = String::new();
    let mut data = String::new();
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("id:") {
            id = value.trim().parse::<i64>().ok();
        } else if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim());
        }
    }
    if event.is_empty() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        id,
        event,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
    })
}

/// A minimal valid `search_download` submission body.
pub fn search_download_body(output_dir: &str) -> serde_json::Value {
    json!({
        "job_type": "search_download",
        "provider": "copernicus",
        "collection": "SENTINEL-2",
        "product_type": "S2MSI2A",
        "start_date": "2025-01-01",
        "end_date": "2025-01-02",
        "aoi": {"wkt": "POLYGON((0 0,0 1,1 1,1 0,0 0))"},
        "output_dir": output_dir,
    })
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Fetch a job's status JSON.
pub async fn job_status(client: &reqwest::Client, base_url: &str, job_id: &str) -> serde_json::Value {
    client
        .get(format!("{}/v1/jobs/{}", base_url, job_id))
        .send()
        .await
        .expect("status request failed")
        .json()
        .await
        .expect("status body was not JSON")
}
