//! Policy trait definitions and the read-only observation types.
//!
//! Every policy sees the cluster only through [`RequestInfo`] and
//! [`RouterState`]. Neither type exposes simulator internals, so a policy
//! cannot mutate anything except its own fields.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Simulated time in ticks (one tick is one microsecond).
pub type Tick = u64;
/// Instance identifier, equal to the instance's index in the cluster.
pub type InstanceId = u32;
/// Request identifier.
pub type RequestId = u64;

/// Service-level class a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloClass {
    Critical,
    Standard,
    Sheddable,
    Batch,
    Background,
}

impl Default for SloClass {
    fn default() -> Self {
        SloClass::Standard
    }
}

/// Role an instance plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceRole {
    /// Runs both prefill and decode.
    Unified,
    Prefill,
    Decode,
}

impl InstanceRole {
    /// Whether this instance may receive fresh requests (prefill work).
    pub fn accepts_prefill(&self) -> bool {
        matches!(self, InstanceRole::Unified | InstanceRole::Prefill)
    }

    /// Whether this instance may receive handed-off decode work.
    pub fn accepts_decode(&self) -> bool {
        matches!(self, InstanceRole::Unified | InstanceRole::Decode)
    }
}

/// Shared prompt prefix descriptor.
///
/// Requests with the same `group` share the first `tokens` prompt tokens, so
/// the KV blocks covering that span are content-identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedPrefix {
    pub group: u64,
    pub tokens: u32,
}

/// Information about a request, provided to policies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub id: RequestId,
    pub arrival_time: Tick,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub progress: u32,
    pub priority: f64,
    pub tenant_id: u32,
    pub slo_class: SloClass,
    pub prefix: Option<SharedPrefix>,
}

/// Read-only snapshot of one instance's load, as seen by routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub role: InstanceRole,
    pub queue_depth: u32,
    pub batch_size: u32,
    /// Requests routed here whose enqueue event has not fired yet.
    pub pending: u32,
    pub kv_utilization: f64,
    pub free_kv_blocks: u64,
    pub cache_hit_rate: f64,
    pub in_flight: u32,
    /// Simulated time at which this snapshot was taken.
    pub timestamp: Tick,
}

impl InstanceSnapshot {
    /// Idle snapshot for instance `id`.
    pub fn idle(id: InstanceId, role: InstanceRole) -> Self {
        Self {
            id,
            role,
            queue_depth: 0,
            batch_size: 0,
            pending: 0,
            kv_utilization: 0.0,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            in_flight: 0,
            timestamp: 0,
        }
    }

    /// Load used by load-aware policies: queued + running + pending.
    pub fn effective_load(&self) -> u32 {
        self.queue_depth + self.batch_size + self.pending
    }
}

/// Aggregated view handed to admission and routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterState {
    pub clock: Tick,
    pub snapshots: Vec<InstanceSnapshot>,
}

impl RouterState {
    pub fn new(clock: Tick, snapshots: Vec<InstanceSnapshot>) -> Self {
        Self { clock, snapshots }
    }

    /// Sum of effective load across all instances.
    pub fn total_load(&self) -> u64 {
        self.snapshots.iter().map(|s| s.effective_load() as u64).sum()
    }
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    Admit { reason: String },
    Reject { reason: String },
    /// Re-run admission after `duration` ticks.
    Delay { duration: Tick, reason: String },
}

impl AdmissionDecision {
    pub fn reason(&self) -> &str {
        match self {
            AdmissionDecision::Admit { reason }
            | AdmissionDecision::Reject { reason }
            | AdmissionDecision::Delay { reason, .. } => reason,
        }
    }

    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit { .. })
    }
}

/// Where a routing decision sends a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteTarget {
    Instance(InstanceId),
    /// Prefill on one instance, then hand off to another for decode.
    Disaggregated {
        prefill: InstanceId,
        decode: InstanceId,
    },
    /// No suitable instance.
    Reject,
}

/// Decision returned by a routing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub reason: String,
    /// Per-candidate scores; higher is better. Empty for score-free policies.
    pub scores: BTreeMap<InstanceId, f64>,
    /// Optional priority override for the instance scheduler.
    pub priority_hint: Option<f64>,
}

impl RoutingDecision {
    pub fn to_instance(id: InstanceId, reason: impl Into<String>) -> Self {
        Self {
            target: RouteTarget::Instance(id),
            reason: reason.into(),
            scores: BTreeMap::new(),
            priority_hint: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            target: RouteTarget::Reject,
            reason: reason.into(),
            scores: BTreeMap::new(),
            priority_hint: None,
        }
    }

    pub fn with_scores(mut self, scores: BTreeMap<InstanceId, f64>) -> Self {
        self.scores = scores;
        self
    }
}

/// Decides whether a request enters the cluster.
pub trait AdmissionPolicy {
    fn decide(&mut self, request: &RequestInfo, state: &RouterState) -> AdmissionDecision;

    fn name(&self) -> &str;
}

/// Computes the scheduling priority of a request.
pub trait PriorityPolicy {
    fn compute(&self, request: &RequestInfo, clock: Tick) -> f64;

    fn name(&self) -> &str;
}

/// Chooses the instance (or prefill/decode pair) for a request.
pub trait RoutingPolicy {
    fn route(&mut self, request: &RequestInfo, state: &RouterState) -> RoutingDecision;

    fn name(&self) -> &str;

    /// Policy-specific counters to include in the run summary.
    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// Orders an instance's wait queue and picks preemption victims.
pub trait InstanceScheduler {
    /// Comparator for the wait queue. `Less` runs first.
    fn compare(&self, a: &RequestInfo, b: &RequestInfo) -> Ordering;

    /// Positions in `queue` in run order: a stable sort by
    /// [`InstanceScheduler::compare`].
    fn order(&self, queue: &[RequestInfo]) -> Vec<usize> {
        let mut positions: Vec<usize> = (0..queue.len()).collect();
        positions.sort_by(|&a, &b| self.compare(&queue[a], &queue[b]));
        positions
    }

    /// Index into `running` of the request to preempt. Defaults to the most
    /// recently admitted request, which is the last one.
    fn choose_preemption_victim(&self, running: &[RequestInfo]) -> Option<usize> {
        running.len().checked_sub(1)
    }

    fn name(&self) -> &str;
}

/// Candidates able to take fresh requests.
pub fn prefill_candidates(snapshots: &[InstanceSnapshot]) -> Vec<&InstanceSnapshot> {
    snapshots
        .iter()
        .filter(|s| s.role.accepts_prefill())
        .collect()
}

/// Candidates with a specific role.
pub fn instances_with_role(
    snapshots: &[InstanceSnapshot],
    role: InstanceRole,
) -> Vec<&InstanceSnapshot> {
    snapshots.iter().filter(|s| s.role == role).collect()
}

/// Least effectively loaded snapshot; the lowest id wins ties.
pub fn least_loaded<'a>(candidates: &[&'a InstanceSnapshot]) -> Option<&'a InstanceSnapshot> {
    candidates
        .iter()
        .copied()
        .min_by_key(|s| (s.effective_load(), s.id))
}
