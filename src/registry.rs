use dashmap::DashMap;

use crate::stats::StatsSnapshot;

/// One row per container the relay has seen. `streaming` is the claim that
/// keeps the poll sweep and the event path from opening two log streams for
/// the same container; `last_stats` feeds the next stats delta. The two
/// halves have independent lifecycles: a stream teardown releases the claim
/// without touching the snapshot.
#[derive(Default)]
pub(crate) struct TrackedEntry {
    streaming: bool,
    last_stats: Option<StatsSnapshot>,
}

/// Dedup pool over container ids. Each call touches a single dashmap entry,
/// so claims and releases are atomic with respect to each other.
#[derive(Default)]
pub(crate) struct ContainerRegistry {
    entries: DashMap<String, TrackedEntry>,
}

impl ContainerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claims the log-stream slot for `id`. Returns false (and changes
    /// nothing) when another path already holds it.
    pub(crate) fn try_register(&self, id: &str) -> bool {
        let mut entry = self.entries.entry(id.to_owned()).or_default();
        if entry.streaming {
            return false;
        }
        entry.streaming = true;
        true
    }

    /// Releases the log-stream claim for `id`. Idempotent; the container
    /// becomes eligible for re-discovery on the next sweep. A stored stats
    /// snapshot survives, so a log-stream blip on a still-running container
    /// does not restart its delta window; the row itself goes only when
    /// nothing is left in it.
    pub(crate) fn unregister(&self, id: &str) {
        self.entries.remove_if_mut(id, |_, entry| {
            entry.streaming = false;
            entry.last_stats.is_none()
        });
    }

    /// Drops stored snapshots for containers that are no longer running and
    /// removes rows with nothing left in them.
    pub(crate) fn prune_stats(&self, running: impl Fn(&str) -> bool) {
        self.entries.retain(|id, entry| {
            if !running(id) {
                entry.last_stats = None;
            }
            entry.streaming || entry.last_stats.is_some()
        });
    }

    /// Stores the current snapshot for `id` and hands back the previous one,
    /// if any. The first call for a container always returns `None`.
    pub(crate) fn swap_stats(&self, id: &str, current: StatsSnapshot) -> Option<StatsSnapshot> {
        let mut entry = self.entries.entry(id.to_owned()).or_default();
        entry.last_stats.replace(current)
    }
}
