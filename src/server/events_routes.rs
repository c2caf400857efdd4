//! Server-sent events endpoint.
//!
//! Frames are `id: <event_id>` / `event: <type>` / `data: <json>`; synthetic
//! heartbeats carry no id and are never persisted, so the last seen `id` is
//! always a valid `since` cursor on reconnect.

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;

use super::state::ServerState;
use crate::jobs::events::{
    stream_events, StreamItem, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL,
};
use crate::jobs::store::EventScope;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub job_id: Option<String>,
    pub since: Option<i64>,
}

pub async fn stream(
    State(state): State<ServerState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let scope = match &query.job_id {
        Some(job_id) => EventScope::Job(job_id.clone()),
        None => EventScope::All,
    };
    let heartbeat_scope = query.job_id.clone().unwrap_or_else(|| "_all".to_string());

    let stream = stream_events(
        state.fetcher.store(),
        scope,
        query.since,
        DEFAULT_POLL_INTERVAL,
        DEFAULT_HEARTBEAT_INTERVAL,
    )
    .map(move |item| {
        Ok(match item {
            StreamItem::Event(event) => {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Event::default()
                    .id(event.id.to_string())
                    .event(event.event_type)
                    .data(data)
            }
            StreamItem::Heartbeat => {
                let payload = json!({
                    "id": null,
                    "job_id": heartbeat_scope,
                    "type": "heartbeat",
                    "timestamp": Utc::now(),
                    "payload": {},
                });
                Event::default().event("heartbeat").data(payload.to_string())
            }
        })
    });

    Sse::new(stream)
}
