//! Server-side tailing of the persisted event log.
//!
//! The durable event `id` is the only resume cursor: for any `since` equal to
//! a previously yielded id, the stream continues with exactly the events
//! whose id is greater, in order. While the log is idle a synthetic
//! heartbeat item keeps downstream connections alive; heartbeats are never
//! persisted and carry no id.

use super::models::JobEvent;
use super::store::{EventScope, JobStore};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const BATCH_LIMIT: usize = 200;

/// One item of the tail: a persisted event or a keep-alive marker.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(JobEvent),
    Heartbeat,
}

/// Infinite, cancellable tail of the event log. Dropping the stream stops
/// the polling.
pub fn stream_events(
    store: Arc<dyn JobStore>,
    scope: EventScope,
    since: Option<i64>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
) -> impl Stream<Item = StreamItem> {
    async_stream::stream! {
        let mut cursor = since;
        let mut heartbeat_deadline = Instant::now() + heartbeat_interval;

        loop {
            let batch = match store.list_events(&scope, cursor, BATCH_LIMIT) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("Event log poll failed: {:#}", err);
                    Vec::new()
                }
            };

            if !batch.is_empty() {
                for event in batch {
                    cursor = Some(event.id);
                    yield StreamItem::Event(event);
                }
                heartbeat_deadline = Instant::now() + heartbeat_interval;
                // A full batch may mean more is already waiting.
                continue;
            }

            if Instant::now() >= heartbeat_deadline {
                yield StreamItem::Heartbeat;
                heartbeat_deadline = Instant::now() + heartbeat_interval;
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
