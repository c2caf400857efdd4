//! Crash recovery: a job claimed by a dead worker comes back and completes.

mod common;

use common::*;
use nimbus_fetch::download::DownloadConfig;
use nimbus_fetch::executor::{Executor, ExecutorConfig};
use nimbus_fetch::jobs::models::{JobState, ProviderName};
use nimbus_fetch::jobs::store::{EventScope, JobStore};
use nimbus_fetch::jobs::{JobRequest, SqliteJobStore};
use nimbus_fetch::providers::{ProviderRegistry, StaticProvider};
use nimbus_fetch::runner::{JobRunner, RunnerConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn spawn_worker(
    store: Arc<dyn JobStore>,
    provider: StaticProvider,
    data_dir: &std::path::Path,
    worker_id: &str,
    stale_job_seconds: u64,
) -> Arc<Executor> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(provider));
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        registry,
        RunnerConfig {
            data_dir: data_dir.to_path_buf(),
            download: DownloadConfig {
                max_retries: 2,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
                ..Default::default()
            },
        },
    ));
    Arc::new(Executor::new(
        store,
        runner,
        ExecutorConfig {
            worker_id: worker_id.to_string(),
            max_jobs: 2,
            provider_limits: HashMap::new(),
            providers_allow: None,
            poll_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
            stale_job_seconds,
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_job_is_requeued_and_completed_by_another_worker() {
    let temp = tempfile::TempDir::new().unwrap();
    let data_dir = temp.path().join("downloads");
    std::fs::create_dir_all(&data_dir).unwrap();
    let store: Arc<dyn JobStore> =
        Arc::new(SqliteJobStore::new(temp.path().join("jobs.db")).unwrap());

    // Worker A's provider serves an endless trickle so the job never
    // finishes on its watch; worker B's provider serves real files.
    let slow = spawn_slow_file_server(100_000, Duration::from_millis(20)).await;
    let fast = spawn_file_server().await;

    let request: JobRequest = serde_json::from_value(json!({
        "job_type": "search_download",
        "provider": ProviderName::Copernicus.as_str(),
        "collection": "SENTINEL-2",
        "product_type": "S2MSI2A",
        "start_date": "2025-01-01",
        "end_date": "2025-01-02",
        "aoi": {"wkt": "POLYGON((0 0,0 1,1 1,1 0,0 0))"},
        "output_dir": "recovery"
    }))
    .unwrap();
    let job_id = store.create_job(&request).unwrap();

    // Worker A claims the job and gets stuck in the download.
    let worker_a = spawn_worker(
        store.clone(),
        provider_with_files("copernicus", &slow, &[("p1", "big.bin")]),
        &data_dir,
        "worker-a",
        3600,
    );
    let handle_a = tokio::spawn(worker_a.clone().run());

    let running = wait_until(Duration::from_secs(15), || {
        let store = store.clone();
        let job_id = job_id.clone();
        async move { store.get_job(&job_id).unwrap().unwrap().state == JobState::Running }
    })
    .await;
    assert!(running, "worker A should claim the job");

    // Kill worker A mid-download. The runner observes the shutdown token and
    // stops without a terminal write, exactly like a dead process would
    // leave the row.
    worker_a.shutdown_token().cancel();
    handle_a.await.unwrap();
    let job = store.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.attempt, 1);

    // Worker B sweeps with a one-second stale threshold, requeues and
    // completes the job.
    let worker_b = spawn_worker(
        store.clone(),
        provider_with_files("copernicus", &fast, &[("p1", "one.bin")]),
        &data_dir,
        "worker-b",
        1,
    );
    let handle_b = tokio::spawn(worker_b.clone().run());

    let recovered = wait_until(Duration::from_secs(15), || {
        let store = store.clone();
        let job_id = job_id.clone();
        async move {
            let job = store.get_job(&job_id).unwrap().unwrap();
            job.state == JobState::Succeeded && job.attempt >= 2
        }
    })
    .await;
    assert!(recovered, "worker B should requeue and finish the job");

    let job = store.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.attempt, 2);
    assert!(job.owner_token.is_none());

    // The lifecycle cycled queued → running → queued → running → succeeded.
    let types: Vec<String> = store
        .list_events(&EventScope::Job(job_id.clone()), None, 1000)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"job.requeued_after_restart".to_string()));
    assert_eq!(
        types.iter().filter(|t| *t == "job.started").count(),
        2,
        "one start per attempt"
    );

    let result = store.get_result(&job_id).unwrap().unwrap();
    assert!(!result.paths.is_empty());

    worker_b.shutdown_token().cancel();
    handle_b.await.unwrap();
}
