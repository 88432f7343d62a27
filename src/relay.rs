//! The orchestrator: owns the periodic sweeps and reacts to lifecycle
//! events. Nothing runs until the forwarding link has authorized once, and
//! every re-authorization restarts the timers so their cadence is anchored
//! to the current connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::events::{EventWatcher, LifecycleEvent};
use crate::logs::{open_stream, ContainerRef};
use crate::state::RelayState;
use crate::stats;

/// Poll sweep for containers the event feed missed.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
/// Watchdog cadence for the event feed subscription.
const EVENT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// A container singled out by a start event, with the event time as its
/// log cursor.
struct DiscoveryTarget {
    id: String,
    since: i64,
}

pub(crate) struct Relay {
    state: Arc<RelayState>,
    authorized: watch::Receiver<u64>,
    events_tx: mpsc::Sender<LifecycleEvent>,
    events_rx: mpsc::Receiver<LifecycleEvent>,
}

impl Relay {
    pub(crate) fn new(state: Arc<RelayState>, authorized: watch::Receiver<u64>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            state,
            authorized,
            events_tx,
            events_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        if self.authorized.changed().await.is_err() {
            return;
        }
        let mut watcher = EventWatcher::spawn(self.state.docker.clone(), self.events_tx.clone());

        'anchored: loop {
            // interval first-ticks immediately, which doubles as the
            // initial discovery and stats trigger after (re)authorization
            let mut discovery = time::interval(DISCOVERY_INTERVAL);
            let mut event_check = time::interval(EVENT_CHECK_INTERVAL);
            let mut stats_sweep = time::interval(STATS_INTERVAL);

            loop {
                tokio::select! {
                    changed = self.authorized.changed() => {
                        if changed.is_err() {
                            watcher.abort();
                            return;
                        }
                        tracing::info!("forwarding link re-authorized, re-anchoring timers");
                        continue 'anchored;
                    }
                    _ = discovery.tick() => discover(&self.state, None).await,
                    _ = event_check.tick() => watcher.ensure_running(),
                    _ = stats_sweep.tick() => stats::sample_all(&self.state).await,
                    event = self.events_rx.recv() => match event {
                        Some(LifecycleEvent::Started { id, time }) => {
                            tracing::info!(container = %id, "container start event");
                            discover(&self.state, Some(DiscoveryTarget { id, since: time })).await;
                        }
                        Some(LifecycleEvent::Died { id }) => {
                            // the stream's own teardown unregisters; log only
                            tracing::info!(container = %id, "container die event");
                        }
                        // unreachable while self.events_tx is held
                        None => return,
                    }
                }
            }
        }
    }
}

/// One discovery sweep. A targeted container gets its log cursor from the
/// start event; on top of that, every sweep re-offers all running
/// containers to the registry as a backstop for missed events. Lost claims
/// are no-ops, so the overlap is harmless.
async fn discover(state: &Arc<RelayState>, target: Option<DiscoveryTarget>) {
    for container in state.docker.list_containers().await {
        if let Some(target) = target.as_ref().filter(|t| t.id == container.id) {
            open_stream(
                state,
                ContainerRef {
                    id: container.id.clone(),
                    labels: container.labels.clone(),
                    since: target.since,
                },
            );
        }
        open_stream(
            state,
            ContainerRef {
                id: container.id,
                labels: container.labels,
                since: poll_cursor(),
            },
        );
    }
}

/// Poll-discovered containers tail from just before "now"; the one-second
/// overlap beats losing the lines written while the sweep ran.
fn poll_cursor() -> i64 {
    Utc::now().timestamp() - 1
}
