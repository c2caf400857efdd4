//! NimbusChain Fetch
//!
//! Distributed job runtime for asynchronous satellite-product acquisition.
//! The HTTP control plane accepts submissions and streams progress events;
//! worker executors claim queued jobs from the shared store and run provider
//! search + download pipelines with crash-safe requeue semantics.

pub mod config;
pub mod download;
pub mod executor;
pub mod fetcher;
pub mod geometry;
pub mod jobs;
pub mod manifest;
pub mod providers;
pub mod runner;
pub mod server;

pub use config::Settings;
pub use fetcher::Fetcher;
pub use jobs::create_job_store;
pub use server::{make_app, run_server, ServerState};
