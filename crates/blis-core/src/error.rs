//! Error types for the simulation core.
//!
//! Three kinds of failure exist. Configuration errors surface from
//! construction, before any event runs. Resource exhaustion is an ordinary
//! return value ([`crate::kv_cache::KvCacheError::Exhausted`]) handled by
//! batch formation. Internal-consistency violations ([`InvariantViolation`])
//! halt the run.

use crate::config::ConfigError;
use crate::request::RequestState;
use crate::workload::WorkloadError;
use blis_policies::{InstanceId, RequestId, Tick};
use thiserror::Error;

/// KV-cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Tier {
    Gpu,
    Cpu,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Gpu => write!(f, "gpu"),
            Tier::Cpu => write!(f, "cpu"),
        }
    }
}

/// A broken internal invariant. Never recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("kv conservation broken on instance {instance} tier {tier}: used {used} + free {free} != total {total}")]
    KvConservation {
        instance: InstanceId,
        tier: Tier,
        used: u64,
        free: u64,
        total: u64,
    },
    #[error("refcount of block {block} on instance {instance} would go negative")]
    NegativeRefcount { instance: InstanceId, block: u32 },
    #[error("block {block} on instance {instance} evicted with refcount {refcount}")]
    EvictReferenced {
        instance: InstanceId,
        block: u32,
        refcount: u32,
    },
    #[error("block {block} does not exist on instance {instance}")]
    UnknownBlock { instance: InstanceId, block: u32 },
    #[error("event {kind} scheduled at {at} before current time {now}")]
    EventInPast {
        kind: &'static str,
        at: Tick,
        now: Tick,
    },
    #[error("request {request}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        request: RequestId,
        from: RequestState,
        to: RequestState,
    },
    #[error("request {request} not found on instance {instance}")]
    UnknownRequest {
        instance: InstanceId,
        request: RequestId,
    },
    #[error("event targets instance {instance} but the cluster has {count}")]
    UnknownInstance { instance: InstanceId, count: usize },
}

/// Errors that end a simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("internal consistency violation: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("workload error: {0}")]
    Workload(#[from] WorkloadError),
}
