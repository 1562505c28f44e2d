//! BLIS: deterministic discrete-event simulator for LLM inference clusters.
//!
//! This crate provides the simulation core: the global event queue, the
//! per-instance KV cache and batch formation, and the cluster orchestrator
//! that drives requests through the policy pipeline from `blis-policies`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Workload │────▶│   Cluster    │────▶│   Metrics    │
//! │ / Trace  │     │ (EventQueue) │     │  + Decisions │
//! └──────────┘     └──────┬───────┘     └──────────────┘
//!                         │
//!         ┌───────────────┼────────────────┐
//!         │  Admission ─► Priority ─► Routing │
//!         └───────────────┬────────────────┘
//!                         │
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!    ┌───────────┐  ┌───────────┐  ┌───────────┐
//!    │Instance 0 │  │Instance 1 │  │Instance N │
//!    │ KV Cache  │  │ KV Cache  │  │ KV Cache  │
//!    │ Scheduler │  │ Scheduler │  │ Scheduler │
//!    └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Identical configuration, seed and workload produce an identical event
//! log and identical metrics.

pub mod batch;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod decision;
pub mod error;
pub mod event;
pub mod instance;
pub mod kv_cache;
pub mod kv_tier;
pub mod latency;
pub mod metrics;
pub mod request;
pub mod rng;
pub mod snapshot;
pub mod workload;

// Re-export key types for convenience.
pub use clock::SimClock;
pub use cluster::{ClusterSimulator, LoggedEvent};
pub use config::{ConfigError, SimConfig};
pub use decision::{DecisionRecord, DecisionSink, DecisionTrace, NullSink};
pub use error::{InvariantViolation, SimError};
pub use event::{EventKind, EventQueue};
pub use instance::Instance;
pub use kv_cache::{KvCacheError, KvCacheManager};
pub use latency::{LatencyConfig, LatencyModel, LatencyTemplate};
pub use metrics::{MetricsCollector, SimulationMetrics};
pub use request::{Request, RequestState};
pub use rng::PartitionedRng;
pub use workload::{load_trace, write_trace_file, WorkloadConfig};

use blis_policies::RoutingConfig;

/// Run `requests` through a cluster built from `config`.
pub fn run_with_requests(
    config: &SimConfig,
    requests: Vec<Request>,
) -> Result<SimulationMetrics, SimError> {
    let mut sim = ClusterSimulator::new(config)?;
    sim.inject_all(requests)?;
    sim.run()
}

/// Run the workload `config` describes: its trace if set, else a synthetic
/// workload drawn from the `workload` stream of the run's seed.
pub fn run_simulation(config: &SimConfig) -> Result<SimulationMetrics, SimError> {
    let mut sim = ClusterSimulator::new(config)?;
    let requests = workload::load_workload(&config.workload, sim.rng_mut())?;
    sim.inject_all(requests)?;
    sim.run()
}

/// Run the same requests under each named routing template.
pub fn compare_routing(
    config: &SimConfig,
    requests: &[Request],
    routing_names: &[&str],
) -> Result<Vec<SimulationMetrics>, SimError> {
    routing_names
        .iter()
        .map(|name| {
            let routing = RoutingConfig::by_name(name).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "unknown routing policy '{}', available: {:?}",
                    name,
                    blis_policies::available_routing()
                ))
            })?;
            run_with_requests(&config.with_routing(routing), requests.to_vec())
        })
        .collect()
}
