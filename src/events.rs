//! Lifecycle-event feed.
//!
//! One subscription to the daemon's event stream, kept alive by the task's
//! own resubscribe loop; the orchestrator's health tick tears down and
//! respawns a watcher that has died or gone not-ready. Only container
//! start/die events are actionable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bollard::models::{EventMessage, EventMessageTypeEnum};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::docker::DockerRuntime;

#[derive(Debug, PartialEq)]
pub(crate) enum LifecycleEvent {
    Started { id: String, time: i64 },
    Died { id: String },
}

/// Filters the raw feed down to the two container transitions the relay
/// acts on. Everything else (images, networks, exec, ...) is ignored.
pub(crate) fn classify(event: &EventMessage) -> Option<LifecycleEvent> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let id = event.actor.as_ref()?.id.clone()?;
    match event.action.as_deref() {
        Some("start") => Some(LifecycleEvent::Started {
            id,
            time: event.time.unwrap_or_else(|| Utc::now().timestamp() - 1),
        }),
        Some("die") => Some(LifecycleEvent::Died { id }),
        _ => None,
    }
}

pub(crate) struct EventWatcher {
    docker: DockerRuntime,
    tx: mpsc::Sender<LifecycleEvent>,
    ready: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl EventWatcher {
    pub(crate) fn spawn(docker: DockerRuntime, tx: mpsc::Sender<LifecycleEvent>) -> Self {
        // starts true so the first health tick does not tear down a task
        // that has not been polled yet
        let ready = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(watch_events(docker.clone(), tx.clone(), Arc::clone(&ready)));
        Self {
            docker,
            tx,
            ready,
            task,
        }
    }

    /// Watchdog hook for the periodic health check. A dead task has to come
    /// back, and a live one that reports not-ready gets the same treatment:
    /// torn down and resubscribed rather than trusted to recover.
    pub(crate) fn ensure_running(&mut self) {
        if !self.task.is_finished() && self.ready.load(Ordering::Relaxed) {
            return;
        }
        tracing::warn!("event feed not ready, restarting watcher");
        self.task.abort();
        self.ready.store(false, Ordering::Relaxed);
        self.task = tokio::spawn(watch_events(
            self.docker.clone(),
            self.tx.clone(),
            Arc::clone(&self.ready),
        ));
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Pause between resubscribe attempts; the health tick caps how long a bad
/// subscription can linger anyway.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

async fn watch_events(
    docker: DockerRuntime,
    tx: mpsc::Sender<LifecycleEvent>,
    ready: Arc<AtomicBool>,
) {
    loop {
        tracing::debug!("subscribing to Docker events");
        let mut stream = docker.event_stream();
        ready.store(true, Ordering::Relaxed);

        while let Some(message) = stream.next().await {
            match message {
                Ok(event) => {
                    let Some(lifecycle) = classify(&event) else {
                        continue;
                    };
                    if tx.send(lifecycle).await.is_err() {
                        // orchestrator is gone; nothing left to notify
                        ready.store(false, Ordering::Relaxed);
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Docker event stream error: {e}");
                    break;
                }
            }
        }

        ready.store(false, Ordering::Relaxed);
        tracing::debug!("Docker event stream closed, resubscribing");
        sleep(RESUBSCRIBE_DELAY).await;
    }
}
