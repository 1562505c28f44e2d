//! TOML configuration for BLIS runs.
//!
//! Defines the complete schema for a simulation: run parameters, cluster
//! shape, latency model, the four policy templates, snapshot freshness,
//! workload and decision tracing. Every section has defaults, so an empty
//! file is a valid single-instance configuration.

use crate::batch::BatchLimits;
use crate::instance::InstanceSpec;
use crate::kv_tier::CpuTierConfig;
use crate::latency::{LatencyConfig, LatencyTemplate};
use crate::rng::{derive_seed, SUBSYSTEM_ROUTER};
use crate::snapshot::{RefreshMode, SnapshotConfig};
use crate::workload::WorkloadConfig;
use blis_policies::{
    AdmissionConfig, AdmissionTemplate, InstanceRole, PolicyError, PriorityConfig,
    PriorityTemplate, RoutingConfig, RoutingTemplate, SchedulerConfig, Tick,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub policies: PoliciesSection,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub trace: TraceSection,
}

/// General simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this simulation.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Master seed for every random stream.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Stop processing events after this tick. Unset runs to quiescence.
    #[serde(default)]
    pub horizon: Option<Tick>,
    /// Number of completions to discard from latency metrics.
    #[serde(default)]
    pub warmup_requests: u64,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}

fn default_seed() -> u64 {
    42
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            horizon: None,
            warmup_requests: 0,
        }
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// GPU KV blocks per instance.
    #[serde(default = "default_kv_blocks")]
    pub kv_blocks: u32,
    /// Tokens per KV block.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_max_running_requests")]
    pub max_running_requests: u32,
    /// Token budget per step.
    #[serde(default = "default_max_scheduled_tokens")]
    pub max_scheduled_tokens: u32,
    /// Largest prefill chunk; 0 disables the cap.
    #[serde(default)]
    pub long_prefill_threshold: u32,
    #[serde(default = "default_chunked_prefill")]
    pub chunked_prefill: bool,
    /// Ticks from arrival to the admission decision.
    #[serde(default)]
    pub admission_latency: Tick,
    /// Ticks from admission to the routing decision.
    #[serde(default)]
    pub routing_latency: Tick,
    #[serde(default)]
    pub cpu_tier: Option<CpuTierConfig>,
    #[serde(default)]
    pub disaggregated: DisaggregatedSection,
}

fn default_instances() -> u32 {
    1
}
fn default_kv_blocks() -> u32 {
    8192
}
fn default_block_size() -> u32 {
    16
}
fn default_max_running_requests() -> u32 {
    256
}
fn default_max_scheduled_tokens() -> u32 {
    2048
}
fn default_chunked_prefill() -> bool {
    true
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            kv_blocks: default_kv_blocks(),
            block_size: default_block_size(),
            max_running_requests: default_max_running_requests(),
            max_scheduled_tokens: default_max_scheduled_tokens(),
            long_prefill_threshold: 0,
            chunked_prefill: default_chunked_prefill(),
            admission_latency: 0,
            routing_latency: 0,
            cpu_tier: None,
            disaggregated: DisaggregatedSection::default(),
        }
    }
}

impl ClusterSection {
    pub fn instance_spec(&self) -> InstanceSpec {
        InstanceSpec {
            kv_blocks: self.kv_blocks,
            block_size: self.block_size,
            limits: BatchLimits {
                max_running_requests: self.max_running_requests,
                max_scheduled_tokens: self.max_scheduled_tokens,
                long_prefill_threshold: self.long_prefill_threshold,
                chunked_prefill: self.chunked_prefill,
            },
            cpu_tier: self.cpu_tier.clone(),
        }
    }

    /// Role of each instance, indexed by id. Prefill instances come first.
    pub fn roles(&self) -> Vec<InstanceRole> {
        if !self.disaggregated.enabled {
            return vec![InstanceRole::Unified; self.instances as usize];
        }
        let prefill = self.disaggregated.prefill_instances as usize;
        (0..self.instances as usize)
            .map(|i| {
                if i < prefill {
                    InstanceRole::Prefill
                } else {
                    InstanceRole::Decode
                }
            })
            .collect()
    }
}

/// Prefill/decode split and its KV transfer cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisaggregatedSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub prefill_instances: u32,
    #[serde(default)]
    pub decode_instances: u32,
    /// Fixed cost per transfer, in ticks.
    #[serde(default = "default_transfer_base_latency")]
    pub transfer_base_latency: Tick,
    /// Link bandwidth in GB/s.
    #[serde(default = "default_transfer_bandwidth")]
    pub transfer_bandwidth_gb_s: f64,
    #[serde(default = "default_num_layers")]
    pub num_layers: u32,
    #[serde(default = "default_head_dim")]
    pub head_dim: u32,
    #[serde(default = "default_num_kv_heads")]
    pub num_kv_heads: u32,
    /// Bytes per KV element.
    #[serde(default = "default_dtype_bytes")]
    pub dtype_bytes: u32,
}

fn default_transfer_base_latency() -> Tick {
    500
}
fn default_transfer_bandwidth() -> f64 {
    50.0
}
fn default_num_layers() -> u32 {
    80
}
fn default_head_dim() -> u32 {
    128
}
fn default_num_kv_heads() -> u32 {
    8
}
fn default_dtype_bytes() -> u32 {
    2
}

impl Default for DisaggregatedSection {
    fn default() -> Self {
        Self {
            enabled: false,
            prefill_instances: 0,
            decode_instances: 0,
            transfer_base_latency: default_transfer_base_latency(),
            transfer_bandwidth_gb_s: default_transfer_bandwidth(),
            num_layers: default_num_layers(),
            head_dim: default_head_dim(),
            num_kv_heads: default_num_kv_heads(),
            dtype_bytes: default_dtype_bytes(),
        }
    }
}

impl DisaggregatedSection {
    /// KV bytes per token: K and V for every layer and KV head.
    pub fn bytes_per_token(&self) -> u64 {
        2 * self.num_layers as u64
            * self.num_kv_heads as u64
            * self.head_dim as u64
            * self.dtype_bytes as u64
    }

    /// Ticks to move `blocks` KV blocks from prefill to decode:
    /// `base + blocks * block_size * bytes_per_token / bandwidth`, rounded up.
    pub fn transfer_latency(&self, blocks: u64, block_size: u32) -> Tick {
        let bytes = blocks as f64 * block_size as f64 * self.bytes_per_token() as f64;
        // GB/s is 1e3 bytes per tick
        let bytes_per_tick = self.transfer_bandwidth_gb_s * 1e3;
        let transfer = if bytes_per_tick > 0.0 {
            (bytes / bytes_per_tick).ceil() as Tick
        } else {
            0
        };
        self.transfer_base_latency + transfer
    }
}

/// The four policy templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoliciesSection {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Decision trace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSection {
    /// Record decisions in memory.
    #[serde(default)]
    pub enabled: bool,
    /// Candidates kept per routing record for counterfactual analysis.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: default_top_k(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Same configuration with a different routing template.
    pub fn with_routing(&self, routing: RoutingConfig) -> Self {
        let mut config = self.clone();
        config.policies.routing = routing;
        config
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cluster;
        if c.instances == 0 {
            return Err(invalid("instances must be > 0"));
        }
        if c.kv_blocks == 0 {
            return Err(invalid("kv_blocks must be > 0"));
        }
        if c.block_size == 0 {
            return Err(invalid("block_size must be > 0"));
        }
        if c.max_running_requests == 0 {
            return Err(invalid("max_running_requests must be > 0"));
        }
        if c.max_scheduled_tokens == 0 {
            return Err(invalid("max_scheduled_tokens must be > 0"));
        }
        if let Some(tier) = &c.cpu_tier {
            if tier.bandwidth.is_nan() || tier.bandwidth <= 0.0 {
                return Err(invalid("cpu_tier.bandwidth must be > 0"));
            }
        }

        let d = &c.disaggregated;
        if d.enabled {
            if d.prefill_instances == 0 || d.decode_instances == 0 {
                return Err(invalid(
                    "disaggregated mode needs at least one prefill and one decode instance",
                ));
            }
            if d.prefill_instances + d.decode_instances != c.instances {
                return Err(invalid(format!(
                    "Disaggregated prefill ({}) + decode ({}) must equal instances ({})",
                    d.prefill_instances, d.decode_instances, c.instances,
                )));
            }
            if d.transfer_bandwidth_gb_s.is_nan() || d.transfer_bandwidth_gb_s <= 0.0 {
                return Err(invalid(
                    "transfer_bandwidth_gb_s must be > 0 when disaggregated is enabled",
                ));
            }
        }
        if d.enabled != self.policies.routing.is_disaggregated() {
            return Err(invalid(
                "pd-split routing and cluster.disaggregated.enabled must be set together",
            ));
        }

        for (name, mode) in [
            ("queue_depth", self.snapshot.queue_depth),
            ("batch_size", self.snapshot.batch_size),
            ("kv_utilization", self.snapshot.kv_utilization),
        ] {
            if mode == (RefreshMode::Periodic { interval: 0 }) {
                return Err(invalid(format!(
                    "snapshot.{} periodic interval must be > 0",
                    name
                )));
            }
        }

        if let Some(problem) = self.workload.problem() {
            return Err(invalid(problem));
        }
        if self.trace.enabled && self.trace.top_k == 0 {
            tracing::warn!("decision trace enabled with top_k = 0, regret will not be computed");
        }

        // Constructing each template checks its parameters.
        AdmissionTemplate::from_config(&self.policies.admission)?;
        PriorityTemplate::from_config(&self.policies.priority)?;
        RoutingTemplate::from_config(
            &self.policies.routing,
            c.block_size,
            derive_seed(self.simulation.seed, SUBSYSTEM_ROUTER),
        )?;
        LatencyTemplate::from_config(&self.latency)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[simulation]
name = "test-sim"
seed = 123
horizon = 60000000

[cluster]
instances = 4
kv_blocks = 16384
block_size = 16
max_scheduled_tokens = 4096
long_prefill_threshold = 512

[cluster.cpu_tier]
blocks = 2048

[latency]
model = "blackbox"
alpha = [1000.0, 1.0]
beta = [5000.0, 10.0, 50.0]

[policies]
admission = { name = "token-bucket", capacity = 100000.0, refill_rate = 50000.0 }
priority = { name = "slo-based", base = 1.0 }
routing = { name = "weighted", scorers = [
    { scorer = "queue-depth", weight = 1.0 },
    { scorer = "kv-utilization", weight = 1.0 },
] }
scheduler = { name = "priority-fcfs" }

[snapshot]
kv_utilization = { mode = "periodic", interval = 10000 }

[workload]
rate = 25.0
num_requests = 1000
prefix_groups = 8
"#;

    #[test]
    fn test_parse_config() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.simulation.name, "test-sim");
        assert_eq!(config.simulation.seed, 123);
        assert_eq!(config.simulation.horizon, Some(60_000_000));
        assert_eq!(config.cluster.instances, 4);
        assert_eq!(config.cluster.max_running_requests, 256);
        assert_eq!(config.cluster.cpu_tier.as_ref().map(|t| t.bandwidth), Some(100.0));
        assert_eq!(config.policies.scheduler, SchedulerConfig::PriorityFcfs);
        assert!(matches!(config.policies.routing, RoutingConfig::Weighted { .. }));
        assert_eq!(config.workload.prefix_groups, 8);
        assert_eq!(
            config.snapshot.kv_utilization,
            RefreshMode::Periodic { interval: 10_000 }
        );
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = SimConfig::from_str("").unwrap();
        assert_eq!(config.cluster.instances, 1);
        assert_eq!(config.simulation.seed, 42);
        assert_eq!(config.policies.routing, RoutingConfig::RoundRobin);
        assert_eq!(config.latency, LatencyConfig::default());
    }

    #[test]
    fn test_validation_zero_instances() {
        let toml = "[cluster]\ninstances = 0\n";
        assert!(matches!(
            SimConfig::from_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_zero_budget() {
        assert!(SimConfig::from_str("[cluster]\nmax_scheduled_tokens = 0\n").is_err());
        assert!(SimConfig::from_str("[cluster]\nkv_blocks = 0\n").is_err());
    }

    #[test]
    fn test_validation_disaggregated_mismatch() {
        let toml = r#"
[cluster]
instances = 8

[cluster.disaggregated]
enabled = true
prefill_instances = 2
decode_instances = 4

[policies]
routing = { name = "pd-split" }
"#;
        let err = SimConfig::from_str(toml).unwrap_err();
        assert!(err.to_string().contains("must equal instances"));
    }

    #[test]
    fn test_validation_pd_split_requires_disaggregation() {
        let toml = "[policies]\nrouting = { name = \"pd-split\" }\n";
        assert!(SimConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_malformed_policy_is_config_error() {
        let toml = r#"
[policies]
admission = { name = "token-bucket", capacity = -1.0, refill_rate = 10.0 }
"#;
        assert!(matches!(
            SimConfig::from_str(toml),
            Err(ConfigError::Policy(_))
        ));
    }

    #[test]
    fn test_unknown_policy_name_is_parse_error() {
        let toml = "[policies]\nrouting = { name = \"telepathy\" }\n";
        assert!(matches!(
            SimConfig::from_str(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_roles_put_prefill_first() {
        let toml = r#"
[cluster]
instances = 3

[cluster.disaggregated]
enabled = true
prefill_instances = 1
decode_instances = 2

[policies]
routing = { name = "pd-split" }
"#;
        let config = SimConfig::from_str(toml).unwrap();
        assert_eq!(
            config.cluster.roles(),
            vec![InstanceRole::Prefill, InstanceRole::Decode, InstanceRole::Decode]
        );
    }

    #[test]
    fn test_transfer_latency() {
        let d = DisaggregatedSection {
            transfer_base_latency: 100,
            transfer_bandwidth_gb_s: 1.0,
            num_layers: 1,
            num_kv_heads: 1,
            head_dim: 250,
            dtype_bytes: 2,
            ..Default::default()
        };
        // 1000 bytes per token; 4 blocks of 16 tokens at 1000 bytes per tick
        assert_eq!(d.bytes_per_token(), 1000);
        assert_eq!(d.transfer_latency(4, 16), 100 + 64);
        assert_eq!(d.transfer_latency(0, 16), 100);
    }

    #[test]
    fn test_with_routing_keeps_everything_else() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        let rr = config.with_routing(RoutingConfig::RoundRobin);
        assert_eq!(rr.policies.routing, RoutingConfig::RoundRobin);
        assert_eq!(rr.cluster.instances, 4);
    }
}
