use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::fetcher::Fetcher;

#[derive(Clone)]
pub struct ServerState {
    pub settings: Arc<Settings>,
    pub fetcher: Arc<Fetcher>,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(settings: Arc<Settings>, fetcher: Arc<Fetcher>) -> Self {
        Self {
            settings,
            fetcher,
            start_time: Instant::now(),
        }
    }
}

impl FromRef<ServerState> for Arc<Settings> {
    fn from_ref(input: &ServerState) -> Self {
        input.settings.clone()
    }
}

impl FromRef<ServerState> for Arc<Fetcher> {
    fn from_ref(input: &ServerState) -> Self {
        input.fetcher.clone()
    }
}
