//! Workload sources: a seeded synthetic generator and compact JSONL traces.
//!
//! Both produce plain [`Request`]s in arrival order with ids `0..n`, which the
//! cluster receives through `inject_arrival`.

use crate::clock::TICKS_PER_SEC;
use crate::request::Request;
use crate::rng::{PartitionedRng, SUBSYSTEM_WORKLOAD};
use blis_policies::{SloClass, Tick};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Failed to read workload: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON at line {line}: {source}")]
    JsonParse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Invalid trace record at line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },
    #[error("Failed to encode request {id}: {source}")]
    Encode { id: u64, source: serde_json::Error },
}

fn default_rate() -> f64 {
    10.0
}
fn default_num_requests() -> u64 {
    200
}
fn default_input_mean() -> f64 {
    512.0
}
fn default_input_std() -> f64 {
    128.0
}
fn default_output_mean() -> f64 {
    128.0
}
fn default_output_std() -> f64 {
    32.0
}
fn default_min_tokens() -> u32 {
    1
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_prefix_tokens() -> u32 {
    256
}
fn default_tenants() -> u32 {
    1
}
fn default_slo_classes() -> Vec<SloClass> {
    vec![SloClass::Standard]
}

/// Synthetic generator parameters, plus an optional trace to replay instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Replay this compact JSONL trace instead of generating.
    #[serde(default)]
    pub trace: Option<PathBuf>,
    /// Mean arrival rate in requests per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default = "default_num_requests")]
    pub num_requests: u64,
    #[serde(default = "default_input_mean")]
    pub input_mean: f64,
    /// Half-width of the uniform perturbation around `input_mean`.
    #[serde(default = "default_input_std")]
    pub input_std: f64,
    #[serde(default = "default_output_mean")]
    pub output_mean: f64,
    #[serde(default = "default_output_std")]
    pub output_std: f64,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Distinct shared-prefix groups; 0 disables shared prefixes.
    #[serde(default)]
    pub prefix_groups: u32,
    #[serde(default = "default_prefix_tokens")]
    pub prefix_tokens: u32,
    #[serde(default = "default_tenants")]
    pub tenants: u32,
    /// Classes drawn uniformly per request.
    #[serde(default = "default_slo_classes")]
    pub slo_classes: Vec<SloClass>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            trace: None,
            rate: default_rate(),
            num_requests: default_num_requests(),
            input_mean: default_input_mean(),
            input_std: default_input_std(),
            output_mean: default_output_mean(),
            output_std: default_output_std(),
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            prefix_groups: 0,
            prefix_tokens: default_prefix_tokens(),
            tenants: default_tenants(),
            slo_classes: default_slo_classes(),
        }
    }
}

impl WorkloadConfig {
    /// First problem found in the generator parameters, if any.
    pub fn problem(&self) -> Option<String> {
        if self.trace.is_some() {
            return None;
        }
        if self.rate.is_nan() || self.rate <= 0.0 {
            return Some(format!("workload rate must be > 0, got {}", self.rate));
        }
        if self.min_tokens > self.max_tokens {
            return Some(format!(
                "workload min_tokens ({}) exceeds max_tokens ({})",
                self.min_tokens, self.max_tokens
            ));
        }
        if self.input_std < 0.0 || self.output_std < 0.0 {
            return Some("workload length spreads must be >= 0".to_string());
        }
        if self.tenants == 0 {
            return Some("workload tenants must be > 0".to_string());
        }
        if self.slo_classes.is_empty() {
            return Some("workload slo_classes must not be empty".to_string());
        }
        None
    }
}

/// Uniform perturbation of `mean` by up to `spread`, clamped to `[min, max]`.
fn perturbed<R: Rng>(rng: &mut R, mean: f64, spread: f64, min: u32, max: u32) -> u32 {
    let value = mean + rng.gen::<f64>() * spread * 2.0 - spread;
    (value.round().max(0.0) as u32).clamp(min, max)
}

/// Generate requests from the `workload` stream of `rng`.
pub fn generate(config: &WorkloadConfig, rng: &mut PartitionedRng) -> Vec<Request> {
    let rng = rng.stream_for(SUBSYSTEM_WORKLOAD);
    let mut requests = Vec::with_capacity(config.num_requests as usize);
    let mut clock = 0.0f64;

    for id in 0..config.num_requests {
        // Exponential inter-arrival gap, in seconds.
        let u: f64 = rng.gen();
        clock += -(1.0 - u).ln() / config.rate;
        let arrival = (clock * TICKS_PER_SEC as f64) as Tick;

        let input = perturbed(
            rng,
            config.input_mean,
            config.input_std,
            config.min_tokens.max(1),
            config.max_tokens,
        );
        let output = perturbed(
            rng,
            config.output_mean,
            config.output_std,
            config.min_tokens,
            config.max_tokens,
        );
        let mut req = Request::new(id, arrival, input, output);

        if config.prefix_groups > 0 {
            let group = rng.gen_range(0..config.prefix_groups) as u64;
            req = req.with_prefix(group, config.prefix_tokens);
        }
        if config.tenants > 1 {
            req = req.with_tenant(rng.gen_range(0..config.tenants));
        }
        if config.slo_classes.len() > 1 {
            let idx = rng.gen_range(0..config.slo_classes.len());
            req = req.with_slo(config.slo_classes[idx]);
        } else if let Some(class) = config.slo_classes.first() {
            req = req.with_slo(*class);
        }
        requests.push(req);
    }
    tracing::debug!(requests = requests.len(), "synthetic workload generated");
    requests
}

/// Load the configured workload: the trace if one is set, else synthetic.
pub fn load_workload(
    config: &WorkloadConfig,
    rng: &mut PartitionedRng,
) -> Result<Vec<Request>, WorkloadError> {
    match &config.trace {
        Some(path) => load_trace(path),
        None => Ok(generate(config, rng)),
    }
}

/// One line of a compact JSONL trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Arrival time in ticks (microseconds).
    pub ts: Tick,
    pub prompt_tokens: u32,
    pub gen_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_group: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_len: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slo_class: Option<SloClass>,
}

impl TraceRecord {
    fn from_request(req: &Request) -> Self {
        Self {
            ts: req.arrival_time,
            prompt_tokens: req.input_tokens,
            gen_tokens: req.output_tokens,
            prefix_group: req.prefix.map(|p| p.group),
            prefix_len: req.prefix.map(|p| p.tokens),
            tenant: (req.tenant_id != 0).then_some(req.tenant_id),
            slo_class: Some(req.slo_class),
        }
    }

    fn into_request(self, id: u64) -> Request {
        let mut req = Request::new(id, self.ts, self.prompt_tokens, self.gen_tokens)
            .with_tenant(self.tenant.unwrap_or(0))
            .with_slo(self.slo_class.unwrap_or_default());
        if let Some(group) = self.prefix_group {
            req = req.with_prefix(group, self.prefix_len.unwrap_or(0));
        }
        req
    }
}

/// Load a compact JSONL trace file.
pub fn load_trace(path: &Path) -> Result<Vec<Request>, WorkloadError> {
    let file = std::fs::File::open(path)?;
    parse_trace(BufReader::new(file))
}

/// Parse compact JSONL from any reader. Blank lines and `#` comments are
/// skipped; records are stably sorted by arrival and numbered in that order.
pub fn parse_trace<R: Read>(reader: BufReader<R>) -> Result<Vec<Request>, WorkloadError> {
    let mut records = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: TraceRecord =
            serde_json::from_str(trimmed).map_err(|e| WorkloadError::JsonParse {
                line: line_num + 1,
                source: e,
            })?;
        if record.prompt_tokens == 0 {
            return Err(WorkloadError::InvalidRecord {
                line: line_num + 1,
                reason: "prompt_tokens must be > 0".to_string(),
            });
        }
        records.push(record);
    }
    records.sort_by_key(|r| r.ts);
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(id, r)| r.into_request(id as u64))
        .collect())
}

/// Write requests as compact JSONL.
pub fn write_trace<W: Write>(requests: &[Request], mut writer: W) -> Result<(), WorkloadError> {
    for req in requests {
        serde_json::to_writer(&mut writer, &TraceRecord::from_request(req))
            .map_err(|e| WorkloadError::Encode { id: req.id, source: e })?;
        writeln!(writer)?;
    }
    Ok(())
}

/// Write requests to a compact JSONL file.
pub fn write_trace_file(requests: &[Request], path: &Path) -> Result<(), WorkloadError> {
    let file = std::fs::File::create(path)?;
    write_trace(requests, std::io::BufWriter::new(file))
}
