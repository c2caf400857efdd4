//! Cancellation semantics end to end.

mod common;

use common::*;
use nimbus_fetch::jobs::store::{EventScope, JobStore};
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_while_queued_is_immediate() {
    // No worker: the job stays queued until cancelled.
    let server = TestServer::spawn(TestOptions::default()).await;

    let response = server
        .client
        .post(format!("{}/v1/jobs", server.base_url))
        .json(&search_download_body("queued-cancel"))
        .send()
        .await
        .unwrap();
    let job_id = response.json::<serde_json::Value>().await.unwrap()["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = server
        .client
        .delete(format!("{}/v1/jobs/{}", server.base_url, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["cancel_requested"], json!(true));

    let status = job_status(&server.client, &server.base_url, &job_id).await;
    assert_eq!(status["state"], "cancelled");
    assert!(status["finished_at"].as_str().is_some());

    // No job.started was ever appended and no files were written.
    let types: Vec<String> = server
        .store
        .list_events(&EventScope::Job(job_id.clone()), None, 100)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(!types.contains(&"job.started".to_string()));
    assert!(types.contains(&"job.cancelled".to_string()));
    assert!(!server.data_dir.join("queued-cancel").exists());

    // Cancelling again reports false.
    let body: serde_json::Value = server
        .client
        .delete(format!("{}/v1/jobs/{}", server.base_url, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancel_requested"], json!(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_download_removes_partial_files() {
    // A trickling download keeps the job mid-transfer until cancelled.
    let slow = spawn_slow_file_server(100_000, Duration::from_millis(20)).await;
    let provider = provider_with_files("copernicus", &slow, &[("p1", "big.bin")]);
    let server = TestServer::spawn(TestOptions {
        with_worker: true,
        providers: vec![provider],
        heartbeat: Duration::from_millis(50),
        ..Default::default()
    })
    .await;

    let response = server
        .client
        .post(format!("{}/v1/jobs", server.base_url))
        .json(&search_download_body("mid-cancel"))
        .send()
        .await
        .unwrap();
    let job_id = response.json::<serde_json::Value>().await.unwrap()["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Wait until bytes are flowing.
    let downloading = wait_until(Duration::from_secs(15), || {
        let client = server.client.clone();
        let base = server.base_url.clone();
        let job_id = job_id.clone();
        async move {
            let status = job_status(&client, &base, &job_id).await;
            status["state"] == "running" && status["bytes_downloaded"].as_u64().unwrap_or(0) > 0
        }
    })
    .await;
    assert!(downloading, "download should be in flight");

    let body: serde_json::Value = server
        .client
        .delete(format!("{}/v1/jobs/{}", server.base_url, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancel_requested"], json!(true));

    // Cancellation lands within the heartbeat + a couple of chunks.
    let cancelled = wait_until(Duration::from_secs(10), || {
        let client = server.client.clone();
        let base = server.base_url.clone();
        let job_id = job_id.clone();
        async move { job_status(&client, &base, &job_id).await["state"] == "cancelled" }
    })
    .await;
    assert!(cancelled, "cancel should reach the worker promptly");

    // No partial file or output directory remains.
    assert!(!server.data_dir.join("mid-cancel").exists());

    let types: Vec<String> = server
        .store
        .list_events(&EventScope::Job(job_id.clone()), None, 1000)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"job.cancel_requested".to_string()));
    assert!(types.contains(&"job.cancelled".to_string()));
}
