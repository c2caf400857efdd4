//! API key enforcement, request ids, health and metrics.

mod common;

use common::*;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_key_guards_every_route_except_health_and_root() {
    let server = TestServer::spawn(TestOptions {
        api_key: Some("sekrit".to_string()),
        ..Default::default()
    })
    .await;

    // Root and health stay open.
    for path in ["/", "/v1/health"] {
        let response = server
            .client
            .get(format!("{}{}", server.base_url, path))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "{} should be open", path);
    }

    // Everything else is locked.
    for path in ["/v1/jobs", "/v1/events", "/v1/metrics"] {
        let response = server
            .client
            .get(format!("{}{}", server.base_url, path))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401, "{} should require the key", path);
    }

    // The wrong key is rejected, the right one accepted.
    let response = server
        .client
        .get(format!("{}/v1/jobs", server.base_url))
        .header("X-API-Key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(format!("{}/v1/jobs", server.base_url))
        .header("X-API-Key", "sekrit")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Submissions need the key too.
    let response = server
        .client
        .post(format!("{}/v1/jobs", server.base_url))
        .json(&search_download_body("locked"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_response_carries_a_request_id() {
    let server = TestServer::spawn(TestOptions::default()).await;

    let response = server
        .client
        .get(format!("{}/v1/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));

    // An incoming id is echoed back.
    let response = server
        .client
        .get(format!("{}/v1/health", server.base_url))
        .header("X-Request-ID", "trace-me-123")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "trace-me-123"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_runtime_shape() {
    let server = TestServer::spawn(TestOptions::default()).await;

    let health: serde_json::Value = server
        .client
        .get(format!("{}/v1/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], json!("ok"));
    assert_eq!(health["db_backend"], json!("sqlite"));
    assert!(health["timestamp"].as_str().is_some());
    assert!(health["runtime_role"].as_str().is_some());
    assert!(health["metrics_enabled"].as_bool().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metrics_expose_prometheus_text() {
    let server = TestServer::spawn(TestOptions::default()).await;

    // Generate some traffic first.
    server
        .client
        .post(format!("{}/v1/jobs", server.base_url))
        .json(&search_download_body("metrics"))
        .send()
        .await
        .unwrap();

    let response = server
        .client
        .get(format!("{}/v1/metrics", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("nimbus_http_requests_total"));
    assert!(text.contains("nimbus_jobs_submitted_total"));
}
