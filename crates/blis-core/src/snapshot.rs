//! Router-side view of instance load.
//!
//! Routing never reads instances directly. It reads [`InstanceSnapshot`]s
//! built here, where each field group refreshes on its own cadence, so a
//! policy may see stale queue depths or KV utilization exactly as a real
//! router polling metrics endpoints would.

use crate::instance::LiveLoad;
use blis_policies::{InstanceId, InstanceRole, InstanceSnapshot, Tick};
use serde::{Deserialize, Serialize};

/// When a snapshot field picks up the live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RefreshMode {
    /// Every read sees the live value.
    #[default]
    Immediate,
    /// A read refreshes the field if it is at least `interval` ticks old.
    Periodic { interval: Tick },
    /// Only an explicit refresh (or a `SnapshotRefresh` event) updates it.
    OnDemand,
}

/// Per-field refresh modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub queue_depth: RefreshMode,
    #[serde(default)]
    pub batch_size: RefreshMode,
    /// Covers utilization, free blocks and cache hit rate.
    #[serde(default)]
    pub kv_utilization: RefreshMode,
    /// Period of `SnapshotRefresh` events for on-demand fields.
    #[serde(default)]
    pub refresh_interval: Option<Tick>,
}

impl SnapshotConfig {
    fn modes(&self) -> [RefreshMode; 3] {
        [self.queue_depth, self.batch_size, self.kv_utilization]
    }

    /// Interval of periodic refresh events, if any field needs them.
    pub fn refresh_event_interval(&self) -> Option<Tick> {
        let on_demand = self.modes().contains(&RefreshMode::OnDemand);
        self.refresh_interval.filter(|i| on_demand && *i > 0)
    }
}

const QUEUE_DEPTH: usize = 0;
const BATCH_SIZE: usize = 1;
const KV: usize = 2;

#[derive(Debug, Clone)]
struct Cached {
    snapshot: InstanceSnapshot,
    refreshed_at: [Tick; 3],
}

/// Caches one snapshot per instance and refreshes fields per their mode.
#[derive(Debug, Clone)]
pub struct SnapshotProvider {
    config: SnapshotConfig,
    cached: Vec<Cached>,
}

impl SnapshotProvider {
    pub fn new(config: SnapshotConfig, roles: &[InstanceRole]) -> Self {
        let cached = roles
            .iter()
            .enumerate()
            .map(|(id, role)| Cached {
                snapshot: InstanceSnapshot::idle(id as InstanceId, *role),
                refreshed_at: [0; 3],
            })
            .collect();
        Self { config, cached }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    fn due(mode: RefreshMode, refreshed_at: Tick, clock: Tick) -> bool {
        match mode {
            RefreshMode::Immediate => true,
            RefreshMode::Periodic { interval } => clock.saturating_sub(refreshed_at) >= interval,
            RefreshMode::OnDemand => false,
        }
    }

    fn apply(cached: &mut Cached, field: usize, live: &LiveLoad, clock: Tick) {
        let snap = &mut cached.snapshot;
        match field {
            QUEUE_DEPTH => snap.queue_depth = live.queue_depth,
            BATCH_SIZE => snap.batch_size = live.batch_size,
            _ => {
                snap.kv_utilization = live.kv_utilization;
                snap.free_kv_blocks = live.free_kv_blocks;
                snap.cache_hit_rate = live.cache_hit_rate;
            }
        }
        cached.refreshed_at[field] = clock;
    }

    /// Snapshot of instance `id` as routing sees it at `clock`.
    ///
    /// `pending` and `in_flight` are orchestrator-side counters and are
    /// always current.
    pub fn snapshot(
        &mut self,
        id: InstanceId,
        live: &LiveLoad,
        pending: u32,
        in_flight: u32,
        clock: Tick,
    ) -> InstanceSnapshot {
        let modes = self.config.modes();
        let Some(cached) = self.cached.get_mut(id as usize) else {
            return InstanceSnapshot::idle(id, InstanceRole::Unified);
        };
        for field in [QUEUE_DEPTH, BATCH_SIZE, KV] {
            if Self::due(modes[field], cached.refreshed_at[field], clock) {
                Self::apply(cached, field, live, clock);
            }
        }
        cached.snapshot.pending = pending;
        cached.snapshot.in_flight = in_flight;
        cached.snapshot.timestamp = clock;
        cached.snapshot.clone()
    }

    /// Refresh every field of every instance from `loads`, indexed by id.
    pub fn refresh_all(&mut self, loads: &[LiveLoad], clock: Tick) {
        for (cached, live) in self.cached.iter_mut().zip(loads) {
            for field in [QUEUE_DEPTH, BATCH_SIZE, KV] {
                Self::apply(cached, field, live, clock);
            }
        }
        tracing::trace!(clock, instances = loads.len(), "snapshots refreshed");
    }
}
