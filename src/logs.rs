//! Per-container log streams: claim the registry slot, attach, parse, emit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;

use crate::state::RelayState;

pub(crate) const LOG_KIND: &str = "docker-log";

/// Docker's RFC 3339 nanosecond timestamp is exactly this long.
const TIMESTAMP_LEN: usize = 30;

/// A container due for log collection. `since` is fixed at discovery time:
/// the event time when a start event found it, "now minus one second" when
/// a poll sweep did.
#[derive(Clone)]
pub(crate) struct ContainerRef {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub since: i64,
}

#[derive(Serialize)]
struct LogRecord<'a> {
    marker: &'a Value,
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    message: String,
    labels: &'a HashMap<String, String>,
}

/// Removes the registry row when the stream task ends, however it ends, so
/// the container is re-discovered on the next sweep.
struct StreamGuard {
    state: Arc<RelayState>,
    id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.registry.unregister(&self.id);
    }
}

/// Claims the container and spawns its stream task. A lost claim means
/// another discovery path already owns this container.
pub(crate) fn open_stream(state: &Arc<RelayState>, target: ContainerRef) {
    if !state.registry.try_register(&target.id) {
        return;
    }
    tokio::spawn(run_stream(Arc::clone(state), target));
}

async fn run_stream(state: Arc<RelayState>, target: ContainerRef) {
    let _guard = StreamGuard {
        state: Arc::clone(&state),
        id: target.id.clone(),
    };

    let labels = state.labels.project(&target.labels);
    let mut frames = match state.docker.attach_logs(&target.id, target.since).await {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(container = %target.id, "log attach failed: {e}");
            return;
        }
    };
    tracing::info!(container = %target.id, "container log stream connected");

    while let Some(frame) = frames.next().await {
        let chunk = match frame {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(container = %target.id, "container stream error: {e}");
                break;
            }
        };
        // malformed timestamps drop the whole record, by policy
        let Some((timestamp, message)) = parse_log_chunk(&chunk) else {
            continue;
        };
        let record = LogRecord {
            marker: &state.marker,
            kind: LOG_KIND,
            timestamp,
            message,
            labels: &labels,
        };
        match serde_json::to_string(&record) {
            Ok(json) => state.forward.forward(json),
            Err(e) => tracing::warn!(container = %target.id, "failed to serialize log record: {e}"),
        }
    }

    tracing::info!(container = %target.id, "container stream ended");
}

/// Splits one demultiplexed chunk into (timestamp, message). The first 30
/// characters are the daemon's timestamp; the remainder past the separating
/// space is the message, trimmed.
fn parse_log_chunk(chunk: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(chunk);
    let head = text.get(..TIMESTAMP_LEN)?;
    let parsed = DateTime::parse_from_rfc3339(head).ok()?;
    let timestamp = parsed
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let message = text.get(TIMESTAMP_LEN + 1..).unwrap_or("").trim().to_owned();
    Some((timestamp, message))
}
