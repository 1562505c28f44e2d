//! Built-in policies for the BLIS cluster simulator.
//!
//! The pipeline runs admission → priority → routing at the cluster level and
//! an instance scheduler inside every instance. Each stage is a trait with a
//! closed set of parameterized templates:
//!
//! | Stage | Templates |
//! |-------|-----------|
//! | [`AdmissionPolicy`] | `always-admit`, `token-bucket`, `reject-all` |
//! | [`PriorityPolicy`] | `constant`, `slo-based`, `inverted-slo` |
//! | [`RoutingPolicy`] | `round-robin`, `random`, `least-loaded`, `weighted`, `prefix-affinity`, `pd-split`, `always-busiest` |
//! | [`InstanceScheduler`] | `fcfs`, `priority-fcfs`, `sjf`, `reverse-priority` |
//!
//! `reject-all`, `inverted-slo`, `always-busiest` and `reverse-priority` are
//! deliberately pathological; they exist to exercise anomaly detection.
//!
//! Policies are pure functions of their arguments and their own fields. They
//! never read the wall clock and never fail: a policy that cannot decide
//! returns a reject decision with a reason.

pub mod admission;
pub mod least_loaded;
pub mod prefix;
pub mod prefix_affinity;
pub mod priority;
pub mod random;
pub mod round_robin;
pub mod routing;
pub mod scheduler;
pub mod traits;
pub mod weighted;

pub use admission::{AdmissionConfig, AdmissionTemplate, AlwaysAdmit, RejectAll, TokenBucket};
pub use least_loaded::{AlwaysBusiest, LeastLoaded, PdSplit};
pub use prefix_affinity::{PrefixAffinity, PrefixIndex};
pub use priority::{PriorityConfig, PriorityTemplate};
pub use random::RandomRouting;
pub use round_robin::RoundRobin;
pub use routing::{available_routing, RoutingConfig, RoutingTemplate};
pub use scheduler::{SchedulerConfig, SchedulerTemplate};
pub use traits::*;
pub use weighted::{default_scorers, parse_scorers, ScorerKind, ScorerWeight, WeightedScoring};

use thiserror::Error;

/// Malformed policy configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("{policy}: invalid parameter `{param}`: {reason}")]
    InvalidParameter {
        policy: &'static str,
        param: &'static str,
        reason: String,
    },
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },
}

impl PolicyError {
    pub fn invalid(policy: &'static str, param: &'static str, reason: impl Into<String>) -> Self {
        PolicyError::InvalidParameter {
            policy,
            param,
            reason: reason.into(),
        }
    }
}
