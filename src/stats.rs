//! Resource-usage sampling.
//!
//! Each sweep takes one instantaneous stats snapshot per running container,
//! flattens it, and emits the windowed difference against the previous
//! snapshot. Counters in the daemon's document are cumulative since
//! container start, so the delta is what the intake side can rate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::state::RelayState;

pub(crate) const STATS_KIND: &str = "docker-stats";

/// Flattened view of one stats document. Cumulative counters (`cpu_usage`,
/// `cpu_system`, `net_*`) are monotonic for the life of the container;
/// memory fields and `cpu_core_count` are instantaneous.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct StatsSnapshot {
    #[serde(skip)]
    pub read_time: DateTime<Utc>,
    pub cpu_usage: u64,
    pub cpu_system: u64,
    pub cpu_core_count: u32,
    pub mem_rss: u64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

#[derive(Serialize)]
struct StatsRecord<'a> {
    marker: &'a Value,
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    stats: &'a StatsSnapshot,
    labels: HashMap<String, String>,
}

/// Pulls the fields the relay ships out of a raw stats document. A document
/// missing the read time or the cpu counters is malformed and yields `None`;
/// memory and network sections are optional and default to zero.
pub(crate) fn flatten_snapshot(doc: &Value) -> Option<StatsSnapshot> {
    let read_time = DateTime::parse_from_rfc3339(doc.get("read")?.as_str()?)
        .ok()?
        .with_timezone(&Utc);

    let cpu = doc.get("cpu_stats")?;
    let usage = cpu.get("cpu_usage")?;
    let cpu_usage = usage.get("total_usage")?.as_u64()?;
    let cpu_system = cpu.get("system_cpu_usage")?.as_u64()?;
    let cpu_core_count = usage
        .get("percpu_usage")
        .and_then(Value::as_array)
        .map(|cores| cores.iter().filter(|c| c.as_u64().unwrap_or(0) > 0).count())
        .unwrap_or(0) as u32;

    let mem = doc.get("memory_stats");
    let mem_field = |key: &str| {
        mem.and_then(|m| m.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let mem_rss = mem
        .and_then(|m| m.pointer("/stats/rss"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let (net_rx_bytes, net_tx_bytes) = doc
        .get("networks")
        .and_then(Value::as_object)
        .map(|interfaces| {
            interfaces.values().fold((0u64, 0u64), |(rx, tx), iface| {
                let field = |key: &str| iface.get(key).and_then(Value::as_u64).unwrap_or(0);
                (rx + field("rx_bytes"), tx + field("tx_bytes"))
            })
        })
        .unwrap_or((0, 0));

    Some(StatsSnapshot {
        read_time,
        cpu_usage,
        cpu_system,
        cpu_core_count,
        mem_rss,
        mem_usage: mem_field("usage"),
        mem_limit: mem_field("limit"),
        net_rx_bytes,
        net_tx_bytes,
    })
}

/// Windowed difference of the cumulative counters; instantaneous fields are
/// passed through from `current`.
pub(crate) fn windowed_delta(previous: &StatsSnapshot, current: &StatsSnapshot) -> StatsSnapshot {
    StatsSnapshot {
        read_time: current.read_time,
        cpu_usage: current.cpu_usage.saturating_sub(previous.cpu_usage),
        cpu_system: current.cpu_system.saturating_sub(previous.cpu_system),
        cpu_core_count: current.cpu_core_count,
        mem_rss: current.mem_rss,
        mem_usage: current.mem_usage,
        mem_limit: current.mem_limit,
        net_rx_bytes: current.net_rx_bytes.saturating_sub(previous.net_rx_bytes),
        net_tx_bytes: current.net_tx_bytes.saturating_sub(previous.net_tx_bytes),
    }
}

/// One stats sweep over every running container. A container sampled for the
/// first time only seeds its snapshot; deltas start with the second sample.
/// Snapshots of containers that have left the listing are dropped at the end
/// of the sweep.
pub(crate) async fn sample_all(state: &Arc<RelayState>) {
    let containers = state.docker.list_containers().await;
    // an empty sweep may be a daemon hiccup; keep the stored snapshots
    if containers.is_empty() {
        return;
    }
    let running: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();

    for container in containers {
        let Some(doc) = state.docker.stats_snapshot(&container.id).await else {
            continue;
        };
        let Some(current) = flatten_snapshot(&doc) else {
            tracing::debug!(container = %container.id, "skipping malformed stats document");
            continue;
        };

        let previous = state.registry.swap_stats(&container.id, current.clone());
        let Some(previous) = previous else {
            continue;
        };

        let delta = windowed_delta(&previous, &current);
        let record = StatsRecord {
            marker: &state.marker,
            kind: STATS_KIND,
            timestamp: delta
                .read_time
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            stats: &delta,
            labels: state.labels.project(&container.labels),
        };
        match serde_json::to_string(&record) {
            Ok(json) => state.forward.forward(json),
            Err(e) => {
                tracing::warn!(container = %container.id, "failed to serialize stats record: {e}")
            }
        }
    }

    state.registry.prune_stats(|id| running.contains(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> Value {
        json!({
            "read": "2023-01-01T00:00:10.000000000Z",
            "preread": "2023-01-01T00:00:09.000000000Z",
            "cpu_stats": {
                "cpu_usage": {
                    "total_usage": 150,
                    "percpu_usage": [100, 50, 0, 0]
                },
                "system_cpu_usage": 5000,
                "online_cpus": 4
            },
            "memory_stats": {
                "usage": 2048,
                "limit": 8192,
                "stats": {"rss": 1024}
            },
            "networks": {
                "eth0": {"rx_bytes": 700, "tx_bytes": 300},
                "eth1": {"rx_bytes": 300, "tx_bytes": 100}
            }
        })
    }

    #[test]
    fn flattens_a_full_document() {
        let snapshot = flatten_snapshot(&sample_doc()).unwrap();
        assert_eq!(snapshot.cpu_usage, 150);
        assert_eq!(snapshot.cpu_system, 5000);
        // only the cores with non-zero usage count
        assert_eq!(snapshot.cpu_core_count, 2);
        assert_eq!(snapshot.mem_rss, 1024);
        assert_eq!(snapshot.mem_usage, 2048);
        assert_eq!(snapshot.mem_limit, 8192);
        // per-interface counters are summed
        assert_eq!(snapshot.net_rx_bytes, 1000);
        assert_eq!(snapshot.net_tx_bytes, 400);
    }

    #[test]
    fn document_without_cpu_counters_is_malformed() {
        assert!(flatten_snapshot(&json!({"read": "2023-01-01T00:00:10Z"})).is_none());
        assert!(flatten_snapshot(&json!({"cpu_stats": {}})).is_none());
    }

    #[test]
    fn missing_memory_and_network_sections_default_to_zero() {
        let doc = json!({
            "read": "2023-01-01T00:00:10Z",
            "cpu_stats": {
                "cpu_usage": {"total_usage": 10},
                "system_cpu_usage": 20
            }
        });
        let snapshot = flatten_snapshot(&doc).unwrap();
        assert_eq!(snapshot.cpu_core_count, 0);
        assert_eq!(snapshot.mem_usage, 0);
        assert_eq!(snapshot.net_rx_bytes, 0);
    }

    #[test]
    fn delta_subtracts_cumulative_counters_and_passes_through_the_rest() {
        let previous = StatsSnapshot {
            cpu_usage: 100,
            cpu_system: 4000,
            cpu_core_count: 4,
            mem_usage: 512,
            net_rx_bytes: 700,
            net_tx_bytes: 200,
            ..Default::default()
        };
        let current = StatsSnapshot {
            cpu_usage: 150,
            cpu_system: 5000,
            cpu_core_count: 2,
            mem_usage: 2048,
            net_rx_bytes: 1000,
            net_tx_bytes: 400,
            ..Default::default()
        };

        let delta = windowed_delta(&previous, &current);
        assert_eq!(delta.cpu_usage, 50);
        assert_eq!(delta.cpu_system, 1000);
        assert_eq!(delta.net_rx_bytes, 300);
        assert_eq!(delta.net_tx_bytes, 200);
        assert_eq!(delta.cpu_core_count, 2);
        assert_eq!(delta.mem_usage, 2048);
    }

    #[test]
    fn counter_reset_clamps_to_zero() {
        let previous = StatsSnapshot {
            cpu_usage: 500,
            ..Default::default()
        };
        let current = StatsSnapshot {
            cpu_usage: 100,
            ..Default::default()
        };
        assert_eq!(windowed_delta(&previous, &current).cpu_usage, 0);
    }

    #[test]
    fn first_sample_seeds_without_a_previous_snapshot() {
        let registry = crate::registry::ContainerRegistry::new();
        let first = flatten_snapshot(&sample_doc()).unwrap();
        // bootstrap gap: nothing to diff against yet
        assert!(registry.swap_stats("abc", first.clone()).is_none());
        assert_eq!(registry.swap_stats("abc", first.clone()).unwrap(), first);
    }
}
