use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nimbus_fetch::config::{RuntimeRole, Settings};
use nimbus_fetch::download::DownloadConfig;
use nimbus_fetch::executor::{Executor, ExecutorConfig};
use nimbus_fetch::jobs::create_job_store;
use nimbus_fetch::providers::{CopernicusProvider, ProviderRegistry, UsgsProvider};
use nimbus_fetch::runner::{JobRunner, RunnerConfig};
use nimbus_fetch::server::{metrics, run_server, ServerState};
use nimbus_fetch::Fetcher;

#[derive(Parser, Debug)]
#[command(name = "nimbus-fetch", about = "Satellite product acquisition runtime")]
struct CliArgs {
    /// Override the listening port (default from PORT).
    #[clap(long)]
    port: Option<u16>,

    /// Override the runtime role: api, worker or all (default from
    /// RUNTIME_ROLE).
    #[clap(long)]
    role: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .expect("Failed to initialize logging");

    let mut settings = Settings::from_env()?;
    if let Some(port) = cli_args.port {
        settings.port = port;
    }
    if let Some(role) = cli_args.role.as_deref() {
        settings.runtime_role = RuntimeRole::parse(role);
    }
    settings.ensure_runtime_dirs()?;
    let settings = Arc::new(settings);

    info!(
        "Starting nimbus-fetch (role={}, backend={}, data_dir={:?})",
        settings.runtime_role.as_str(),
        settings.db_backend.as_str(),
        settings.data_dir
    );
    metrics::init_metrics();

    let store = create_job_store(&settings)?;
    let fetcher = Arc::new(Fetcher::new(settings.clone(), store.clone()));
    let shutdown = CancellationToken::new();

    let mut worker = None;
    if settings.runtime_role.runs_worker() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CopernicusProvider::new(&settings.providers)?));
        registry.register(Arc::new(UsgsProvider::new(&settings.providers)?));

        let runner = Arc::new(JobRunner::new(
            store.clone(),
            registry,
            RunnerConfig {
                data_dir: settings.data_dir.clone(),
                download: DownloadConfig::default(),
            },
        ));
        let executor = Arc::new(Executor::new(
            store.clone(),
            runner,
            ExecutorConfig {
                worker_id: uuid::Uuid::new_v4().simple().to_string(),
                max_jobs: settings.max_jobs,
                provider_limits: settings.provider_limits.clone(),
                providers_allow: None,
                poll_interval: settings.queue_poll_interval(),
                heartbeat_interval: settings.heartbeat_interval(),
                stale_job_seconds: settings.stale_job_seconds,
            },
        ));
        fetcher.set_executor(executor.clone());

        let token = executor.shutdown_token();
        let handle = tokio::spawn(executor.run());
        worker = Some((handle, token));
    }

    let mut server = None;
    if settings.runtime_role.serves_api() {
        let state = ServerState::new(settings.clone(), fetcher.clone());
        let port = settings.port;
        let server_shutdown = shutdown.clone();
        let exit_signal = shutdown.clone();
        server = Some(tokio::spawn(async move {
            let result = run_server(state, port, server_shutdown).await;
            // Wake the main loop if the server dies on its own.
            exit_signal.cancel();
            result
        }));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    if let Some(handle) = server {
        handle.await??;
    }
    if let Some((handle, token)) = worker {
        token.cancel();
        handle.await?;
    }

    info!("Goodbye");
    Ok(())
}
