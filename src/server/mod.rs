//! HTTP control plane.

pub mod error;
pub mod events_routes;
pub mod http_layers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use state::ServerState;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Build the full application router.
pub fn make_app(state: ServerState) -> Router {
    let api = Router::new()
        .route("/health", get(routes::health))
        .route("/jobs", axum::routing::post(routes::create_job).get(routes::list_jobs))
        .route("/jobs/batch", axum::routing::post(routes::create_batch))
        .route(
            "/jobs/:job_id",
            get(routes::get_job).delete(routes::cancel_job),
        )
        .route("/jobs/:job_id/result", get(routes::get_result))
        .route("/events", get(events_routes::stream))
        .route("/metrics", get(routes::metrics_endpoint));

    let app = Router::new()
        .route("/", get(routes::home))
        .nest("/v1", api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            http_layers::require_api_key,
        ))
        .layer(DefaultBodyLimit::max(state.settings.max_request_bytes()))
        .layer(axum::middleware::from_fn(http_layers::telemetry));

    let app = if state.settings.cors_origins.is_empty() {
        app
    } else {
        let origins: Vec<HeaderValue> = state
            .settings
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring unparseable CORS origin '{}'", origin);
                    None
                }
            })
            .collect();
        app.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    };

    app.with_state(state)
}

/// Serve until the shutdown token fires.
pub async fn run_server(state: ServerState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = make_app(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    Ok(())
}
