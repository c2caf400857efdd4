//! End-to-end happy path and admission behavior.

mod common;

use common::*;
use nimbus_fetch::jobs::store::{EventScope, JobStore};
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn search_download_happy_path() {
    let files = spawn_file_server().await;
    let provider = provider_with_files("copernicus", &files, &[("p1", "one.bin"), ("p2", "two.bin")]);
    let server = TestServer::spawn(TestOptions {
        with_worker: true,
        providers: vec![provider],
        ..Default::default()
    })
    .await;

    let response = server
        .client
        .post(format!("{}/v1/jobs", server.base_url))
        .json(&search_download_body("s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let created: serde_json::Value = response.json().await.unwrap();
    let job_id = created["job_id"].as_str().unwrap().to_string();

    let done = wait_until(Duration::from_secs(30), || {
        let client = server.client.clone();
        let base = server.base_url.clone();
        let job_id = job_id.clone();
        async move { job_status(&client, &base, &job_id).await["state"] == "succeeded" }
    })
    .await;
    assert!(done, "job should reach succeeded");

    let status = job_status(&server.client, &server.base_url, &job_id).await;
    assert_eq!(status["progress"], json!(100.0));
    assert_eq!(status["bytes_downloaded"], json!(200));
    assert_eq!(status["attempt"], json!(1));
    assert!(status["duration_seconds"].as_f64().is_some());
    assert!(status["errors"].as_array().unwrap().is_empty());

    // Result: two artifacts plus the manifest, all inside the sandbox.
    let result: serde_json::Value = server
        .client
        .get(format!("{}/v1/jobs/{}/result", server.base_url, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let paths: Vec<String> = result["paths"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap().to_string())
        .collect();
    assert_eq!(paths.len(), 3);
    let data_root = server.data_dir.canonicalize().unwrap();
    for path in &paths {
        assert!(
            std::path::Path::new(path).starts_with(&data_root),
            "{} escapes the sandbox",
            path
        );
        assert!(std::path::Path::new(path).exists());
        assert!(result["checksums"][path].as_str().unwrap().starts_with("sha256:"));
    }
    assert!(paths.iter().any(|p| p.ends_with("manifest.json")));

    // Event order: queued, started, products_found{count:2}, progress…, succeeded.
    let events = server
        .store
        .list_events(&EventScope::Job(job_id.clone()), None, 1000)
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    let position = |t: &str| types.iter().position(|x| *x == t).unwrap();
    assert!(position("job.queued") < position("job.started"));
    assert!(position("job.started") < position("job.products_found"));
    assert!(position("job.products_found") < position("job.succeeded"));
    assert!(types.contains(&"job.progress"));

    let found = events
        .iter()
        .find(|e| e.event_type == "job.products_found")
        .unwrap();
    assert_eq!(found.payload["count"], json!(2));

    // Ids strictly increase.
    assert!(events.windows(2).all(|pair| pair[0].id < pair[1].id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submission_validation_and_lookup_errors() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let jobs_url = format!("{}/v1/jobs", server.base_url);

    // Unknown field.
    let mut body = search_download_body("x");
    body["surprise"] = json!(1);
    let response = server.client.post(&jobs_url).json(&body).send().await.unwrap();
    assert_eq!(response.status(), 422);

    // Reversed dates.
    let mut body = search_download_body("x");
    body["start_date"] = json!("2025-03-01");
    let response = server.client.post(&jobs_url).json(&body).send().await.unwrap();
    assert_eq!(response.status(), 422);

    // AOI with both representations.
    let mut body = search_download_body("x");
    body["aoi"] = json!({
        "wkt": "POLYGON((0 0,0 1,1 1,1 0,0 0))",
        "geojson": {"type": "Polygon", "coordinates": [[[0.0,0.0],[0.0,1.0],[1.0,1.0],[0.0,0.0]]]}
    });
    let response = server.client.post(&jobs_url).json(&body).send().await.unwrap();
    assert_eq!(response.status(), 422);
    let detail: serde_json::Value = response.json().await.unwrap();
    assert!(detail["detail"].as_str().unwrap().contains("exactly one"));

    // Unknown job id everywhere.
    for url in [
        format!("{}/v1/jobs/nope", server.base_url),
        format!("{}/v1/jobs/nope/result", server.base_url),
    ] {
        let response = server.client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 404);
    }
    let response = server
        .client
        .delete(format!("{}/v1/jobs/nope", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Nothing slipped into the queue.
    let listing: serde_json::Value = server
        .client
        .get(&jobs_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], json!(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_submission_is_validated_as_a_whole() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let batch_url = format!("{}/v1/jobs/batch", server.base_url);

    // One bad job poisons the whole batch.
    let mut bad = search_download_body("b");
    bad["collection"] = json!("SENTINEL 2");
    let response = server
        .client
        .post(&batch_url)
        .json(&json!({"jobs": [search_download_body("a"), bad]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    let listing: serde_json::Value = server
        .client
        .get(format!("{}/v1/jobs", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], json!(0));

    // A clean batch lands whole.
    let response = server
        .client
        .post(&batch_url)
        .json(&json!({"jobs": [search_download_body("a"), search_download_body("b")]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let created: serde_json::Value = response.json().await.unwrap();
    assert_eq!(created["job_ids"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_filters_and_pages() {
    let server = TestServer::spawn(TestOptions::default()).await;
    let jobs_url = format!("{}/v1/jobs", server.base_url);

    for name in ["l1", "l2", "l3"] {
        let response = server
            .client
            .post(&jobs_url)
            .json(&search_download_body(name))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    let queued: serde_json::Value = server
        .client
        .get(format!("{}?state=queued", jobs_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queued["total"], json!(3));

    let paged: serde_json::Value = server
        .client
        .get(format!("{}?page=2&page_size=2", jobs_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(paged["total"], json!(3));
    assert_eq!(paged["items"].as_array().unwrap().len(), 1);
    assert_eq!(paged["page"], json!(2));

    let none: serde_json::Value = server
        .client
        .get(format!("{}?provider=usgs", jobs_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(none["total"], json!(0));

    // Bad filter values are a validation error.
    let response = server
        .client
        .get(format!("{}?state=sleeping", jobs_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
}
