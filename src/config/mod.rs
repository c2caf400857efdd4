//! Runtime configuration loaded from environment variables.
//!
//! The service deploys as a container; every knob is an environment variable
//! with a clamped default. `Settings` is built once at startup and injected
//! into every component that needs it.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Which long-running loops this process starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeRole {
    /// HTTP control plane only.
    Api,
    /// Job executor only.
    Worker,
    /// Both in one process.
    All,
}

impl RuntimeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeRole::Api => "api",
            RuntimeRole::Worker => "worker",
            RuntimeRole::All => "all",
        }
    }

    /// Unrecognized values fall back to `All` so a typo degrades to the
    /// most permissive mode instead of a dead process.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "api" => RuntimeRole::Api,
            "worker" => RuntimeRole::Worker,
            _ => RuntimeRole::All,
        }
    }

    pub fn serves_api(&self) -> bool {
        matches!(self, RuntimeRole::Api | RuntimeRole::All)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, RuntimeRole::Worker | RuntimeRole::All)
    }
}

/// Job store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Sqlite,
    Memory,
}

impl DbBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbBackend::Sqlite => "sqlite",
            DbBackend::Memory => "memory",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DbBackend::Sqlite),
            "memory" => Ok(DbBackend::Memory),
            other => bail!("Unsupported DB_BACKEND '{}' (expected sqlite or memory)", other),
        }
    }
}

/// Provider credentials and endpoint URLs. Opaque to the core; handed to the
/// concrete provider clients at startup.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub copernicus_base_url: String,
    pub copernicus_token_url: String,
    pub copernicus_download_url: String,
    pub copernicus_username: Option<String>,
    pub copernicus_password: Option<String>,
    pub usgs_service_url: String,
    pub usgs_username: Option<String>,
    pub usgs_token: Option<String>,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            copernicus_base_url: "https://catalogue.dataspace.copernicus.eu".to_string(),
            copernicus_token_url:
                "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token"
                    .to_string(),
            copernicus_download_url: "https://zipper.dataspace.copernicus.eu".to_string(),
            copernicus_username: None,
            copernicus_password: None,
            usgs_service_url: "https://m2m.cr.usgs.gov/api/api/json/stable/".to_string(),
            usgs_username: None,
            usgs_token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_backend: DbBackend,
    pub db_path: PathBuf,
    /// Sandbox root for all job output. Every persisted artifact path must
    /// stay under this directory.
    pub data_dir: PathBuf,
    pub runtime_role: RuntimeRole,
    pub port: u16,
    pub max_jobs: usize,
    pub provider_limits: HashMap<String, usize>,
    pub queue_poll_seconds: f64,
    pub stale_job_seconds: u64,
    pub heartbeat_seconds: u64,
    pub api_key: Option<String>,
    pub cors_origins: Vec<String>,
    pub max_request_mb: usize,
    pub enable_metrics: bool,
    pub providers: ProviderEndpoints,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_backend: DbBackend::Sqlite,
            db_path: PathBuf::from("./data/nimbus.db"),
            data_dir: PathBuf::from("./data/downloads"),
            runtime_role: RuntimeRole::All,
            port: 8080,
            max_jobs: 4,
            provider_limits: default_provider_limits(),
            queue_poll_seconds: 1.0,
            stale_job_seconds: 900,
            heartbeat_seconds: 5,
            api_key: None,
            cors_origins: Vec::new(),
            max_request_mb: 10,
            enable_metrics: true,
            providers: ProviderEndpoints::default(),
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();

        let db_backend = match env_var("DB_BACKEND") {
            Some(raw) => DbBackend::parse(&raw)?,
            None => defaults.db_backend,
        };

        let api_key = env_var("API_KEY").filter(|k| !k.trim().is_empty());

        let mut settings = Settings {
            db_backend,
            db_path: env_var("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            data_dir: env_var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            runtime_role: env_var("RUNTIME_ROLE")
                .map(|raw| RuntimeRole::parse(&raw))
                .unwrap_or(defaults.runtime_role),
            port: parse_clamped("PORT", defaults.port as i64, 1, 65_535) as u16,
            max_jobs: parse_clamped("MAX_JOBS", defaults.max_jobs as i64, 1, 128) as usize,
            provider_limits: parse_provider_limits(env_var("PROVIDER_LIMITS").as_deref().unwrap_or("")),
            queue_poll_seconds: parse_clamped_f64(
                "QUEUE_POLL_SECONDS",
                defaults.queue_poll_seconds,
                0.1,
                30.0,
            ),
            stale_job_seconds: parse_clamped("STALE_JOB_SECONDS", defaults.stale_job_seconds as i64, 30, 86_400)
                as u64,
            heartbeat_seconds: parse_clamped("HEARTBEAT_SECONDS", defaults.heartbeat_seconds as i64, 1, 3_600)
                as u64,
            api_key,
            cors_origins: parse_csv(env_var("CORS_ORIGINS").as_deref().unwrap_or("")),
            max_request_mb: parse_clamped("MAX_REQUEST_MB", defaults.max_request_mb as i64, 1, 200) as usize,
            enable_metrics: env_var("ENABLE_METRICS")
                .map(|raw| parse_bool(&raw))
                .unwrap_or(defaults.enable_metrics),
            providers: provider_endpoints_from_env(),
        };

        // The heartbeat must fire well inside the stale window or healthy
        // jobs get swept.
        let max_heartbeat = (settings.stale_job_seconds / 3).max(1);
        if settings.heartbeat_seconds > max_heartbeat {
            warn!(
                "HEARTBEAT_SECONDS={} too close to STALE_JOB_SECONDS={}, clamping to {}",
                settings.heartbeat_seconds, settings.stale_job_seconds, max_heartbeat
            );
            settings.heartbeat_seconds = max_heartbeat;
        }

        Ok(settings)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.queue_poll_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_mb * 1024 * 1024
    }

    /// Create the directories the service writes to.
    pub fn ensure_runtime_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if self.db_backend == DbBackend::Sqlite {
            if let Some(parent) = self.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn provider_endpoints_from_env() -> ProviderEndpoints {
    let defaults = ProviderEndpoints::default();
    ProviderEndpoints {
        copernicus_base_url: env_var("COPERNICUS_BASE_URL").unwrap_or(defaults.copernicus_base_url),
        copernicus_token_url: env_var("COPERNICUS_TOKEN_URL").unwrap_or(defaults.copernicus_token_url),
        copernicus_download_url: env_var("COPERNICUS_DOWNLOAD_URL")
            .unwrap_or(defaults.copernicus_download_url),
        copernicus_username: env_var("COPERNICUS_USERNAME"),
        copernicus_password: env_var("COPERNICUS_PASSWORD"),
        usgs_service_url: env_var("USGS_SERVICE_URL").unwrap_or(defaults.usgs_service_url),
        usgs_username: env_var("USGS_USERNAME"),
        usgs_token: env_var("USGS_TOKEN"),
    }
}

fn parse_clamped(name: &str, default: i64, min: i64, max: i64) -> i64 {
    match env_var(name).and_then(|raw| raw.trim().parse::<i64>().ok()) {
        Some(value) => clamp_with_warning(name, value, min, max),
        None => default,
    }
}

fn parse_clamped_f64(name: &str, default: f64, min: f64, max: f64) -> f64 {
    match env_var(name).and_then(|raw| raw.trim().parse::<f64>().ok()) {
        Some(value) if value < min => {
            warn!("{}={} below minimum, using {}", name, value, min);
            min
        }
        Some(value) if value > max => {
            warn!("{}={} above maximum, using {}", name, value, max);
            max
        }
        Some(value) => value,
        None => default,
    }
}

fn clamp_with_warning(name: &str, value: i64, min: i64, max: i64) -> i64 {
    if value < min {
        warn!("{}={} below minimum, using {}", name, value, min);
        min
    } else if value > max {
        warn!("{}={} above maximum, using {}", name, value, max);
        max
    } else {
        value
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn default_provider_limits() -> HashMap<String, usize> {
    let mut limits = HashMap::new();
    limits.insert("copernicus".to_string(), 2);
    limits.insert("usgs".to_string(), 4);
    limits
}

/// Parse a `k=v,k=v` list of per-provider concurrency limits. Malformed
/// entries are skipped; defaults are kept for providers the list does not
/// mention.
pub fn parse_provider_limits(raw: &str) -> HashMap<String, usize> {
    let mut limits = default_provider_limits();
    for chunk in raw.split(',') {
        let item = chunk.trim();
        if item.is_empty() {
            continue;
        }
        let Some((name, value)) = item.split_once('=') else {
            continue;
        };
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        if let Ok(parsed) = value.trim().parse::<i64>() {
            limits.insert(key, parsed.max(1) as usize);
        }
    }
    limits
}
