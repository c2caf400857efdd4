//! Test server lifecycle management.

use nimbus_fetch::config::{DbBackend, Settings};
use nimbus_fetch::download::DownloadConfig;
use nimbus_fetch::executor::{Executor, ExecutorConfig};
use nimbus_fetch::jobs::store::JobStore;
use nimbus_fetch::jobs::SqliteJobStore;
use nimbus_fetch::providers::{ProviderRegistry, StaticProvider};
use nimbus_fetch::runner::{JobRunner, RunnerConfig};
use nimbus_fetch::server::{make_app, metrics, ServerState};
use nimbus_fetch::Fetcher;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub struct TestOptions {
    /// Spin a worker executor next to the API.
    pub with_worker: bool,
    pub api_key: Option<String>,
    pub providers: Vec<StaticProvider>,
    pub provider_limits: HashMap<String, usize>,
    pub max_jobs: usize,
    pub stale_job_seconds: u64,
    pub heartbeat: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            with_worker: false,
            api_key: None,
            providers: Vec::new(),
            provider_limits: HashMap::new(),
            max_jobs: 4,
            stale_job_seconds: 3600,
            heartbeat: Duration::from_millis(100),
        }
    }
}

/// Isolated server instance on a random port. Dropping it shuts everything
/// down and removes the temp directories.
pub struct TestServer {
    pub base_url: String,
    pub store: Arc<dyn JobStore>,
    pub data_dir: PathBuf,
    pub client: reqwest::Client,
    shutdown: CancellationToken,
    executor_token: Option<CancellationToken>,
    _temp_dir: TempDir,
}

impl TestServer {
    pub async fn spawn(options: TestOptions) -> Self {
        metrics::init_metrics();

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().join("downloads");
        std::fs::create_dir_all(&data_dir).expect("Failed to create data dir");

        let settings = Arc::new(Settings {
            db_backend: DbBackend::Sqlite,
            db_path: temp_dir.path().join("jobs.db"),
            data_dir: data_dir.clone(),
            api_key: options.api_key.clone(),
            max_jobs: options.max_jobs,
            stale_job_seconds: options.stale_job_seconds,
            ..Default::default()
        });

        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(&settings.db_path).expect("Failed to open store"));
        let fetcher = Arc::new(Fetcher::new(settings.clone(), store.clone()));

        let mut executor_token = None;
        if options.with_worker {
            let mut registry = ProviderRegistry::new();
            for provider in options.providers {
                registry.register(Arc::new(provider));
            }
            let runner = Arc::new(JobRunner::new(
                store.clone(),
                registry,
                RunnerConfig {
                    data_dir: data_dir.clone(),
                    download: DownloadConfig {
                        max_retries: 2,
                        backoff_base: Duration::from_millis(10),
                        backoff_max: Duration::from_millis(50),
                        ..Default::default()
                    },
                },
            ));
            let executor = Arc::new(Executor::new(
                store.clone(),
                runner,
                ExecutorConfig {
                    worker_id: format!("e2e-{}", uuid::Uuid::new_v4().simple()),
                    max_jobs: options.max_jobs,
                    provider_limits: options.provider_limits,
                    providers_allow: None,
                    poll_interval: Duration::from_millis(25),
                    heartbeat_interval: options.heartbeat,
                    stale_job_seconds: options.stale_job_seconds,
                },
            ));
            fetcher.set_executor(executor.clone());
            executor_token = Some(executor.shutdown_token());
            tokio::spawn(executor.run());
        }

        let state = ServerState::new(settings, fetcher);
        let app = make_app(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().expect("No local addr").port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
                .expect("Test server failed");
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build client");

        let server = Self {
            base_url,
            store,
            data_dir,
            client,
            shutdown,
            executor_token,
            _temp_dir: temp_dir,
        };
        server.wait_for_ready().await;
        server
    }

    /// Stop the worker loop only, as if the process died; the HTTP side
    /// stays up.
    pub fn stop_worker(&self) {
        if let Some(token) = &self.executor_token {
            token.cancel();
        }
    }

    async fn wait_for_ready(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if tokio::time::Instant::now() > deadline {
                panic!("Server did not become ready");
            }
            match self.client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(token) = &self.executor_token {
            token.cancel();
        }
    }
}
