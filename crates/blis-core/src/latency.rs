//! Step-time and queueing-delay estimation.
//!
//! The simulator treats latency as opaque: a [`LatencyModel`] maps the shape of
//! a batch to a step duration in ticks. Two models ship:
//!
//! - [`BlackboxModel`]: fitted regression, `beta0 + beta1 * prefill + beta2 * decode`
//! - [`ThroughputModel`]: prefill rate plus a decode throughput curve that
//!   saturates at a batch size

use crate::config::ConfigError;
use crate::request::Request;
use blis_policies::Tick;
use serde::{Deserialize, Serialize};

/// Shape of the batch executed by one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepBatch {
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub prefill_requests: u32,
    pub decode_requests: u32,
    pub max_prefill_chunk: u32,
}

impl StepBatch {
    pub fn is_empty(&self) -> bool {
        self.prefill_tokens == 0 && self.decode_tokens == 0
    }

    pub fn requests(&self) -> u32 {
        self.prefill_requests + self.decode_requests
    }
}

/// Latency estimation used during execution.
pub trait LatencyModel {
    /// Duration of one step over `batch`.
    fn step_time(&self, batch: &StepBatch) -> Tick;

    /// Delay between routing and the request reaching the instance queue.
    fn queueing_delay(&self, _request: &Request) -> Tick {
        0
    }

    /// Per-admission scheduling cost added to the step.
    fn scheduling_overhead(&self) -> Tick {
        0
    }

    /// Per-preemption cost added to the step.
    fn preemption_overhead(&self) -> Tick {
        0
    }

    fn name(&self) -> &str;
}

fn default_alpha() -> Vec<f64> {
    vec![1500.0, 2.0]
}

fn default_beta() -> Vec<f64> {
    vec![6000.0, 15.0, 80.0]
}

/// Latency model selected by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "kebab-case")]
pub enum LatencyConfig {
    Blackbox {
        /// `[alpha0, alpha1]`: queueing delay `alpha0 + alpha1 * input`.
        #[serde(default = "default_alpha")]
        alpha: Vec<f64>,
        /// `[beta0, beta1, beta2]`: step time.
        #[serde(default = "default_beta")]
        beta: Vec<f64>,
        #[serde(default)]
        scheduling_overhead: Tick,
        #[serde(default)]
        preemption_overhead: Tick,
    },
    Throughput(ThroughputModel),
}

impl Default for LatencyConfig {
    fn default() -> Self {
        LatencyConfig::Blackbox {
            alpha: default_alpha(),
            beta: default_beta(),
            scheduling_overhead: 0,
            preemption_overhead: 0,
        }
    }
}

/// Fitted alpha/beta regression.
#[derive(Debug, Clone, PartialEq)]
pub struct BlackboxModel {
    alpha: [f64; 2],
    beta: [f64; 3],
    scheduling_overhead: Tick,
    preemption_overhead: Tick,
}

impl BlackboxModel {
    pub fn new(alpha: &[f64], beta: &[f64]) -> Result<Self, ConfigError> {
        let (&[a0, a1], &[b0, b1, b2]) = (alpha, beta) else {
            return Err(ConfigError::Validation(format!(
                "blackbox latency needs 2 alpha and 3 beta coefficients, got {} and {}",
                alpha.len(),
                beta.len()
            )));
        };
        if alpha.iter().chain(beta).any(|c| !c.is_finite() || *c < 0.0) {
            return Err(ConfigError::Validation(
                "blackbox latency coefficients must be finite and >= 0".to_string(),
            ));
        }
        Ok(Self {
            alpha: [a0, a1],
            beta: [b0, b1, b2],
            scheduling_overhead: 0,
            preemption_overhead: 0,
        })
    }

    pub fn with_overheads(mut self, scheduling: Tick, preemption: Tick) -> Self {
        self.scheduling_overhead = scheduling;
        self.preemption_overhead = preemption;
        self
    }
}

impl LatencyModel for BlackboxModel {
    fn step_time(&self, batch: &StepBatch) -> Tick {
        let t = self.beta[0]
            + self.beta[1] * batch.prefill_tokens as f64
            + self.beta[2] * batch.decode_tokens as f64;
        t.round() as Tick
    }

    fn queueing_delay(&self, request: &Request) -> Tick {
        (self.alpha[0] + self.alpha[1] * request.input_tokens as f64).round() as Tick
    }

    fn scheduling_overhead(&self) -> Tick {
        self.scheduling_overhead
    }

    fn preemption_overhead(&self) -> Tick {
        self.preemption_overhead
    }

    fn name(&self) -> &str {
        "blackbox"
    }
}

fn default_prefill_rate() -> f64 {
    50_000.0
}

fn default_decode_batch1() -> f64 {
    80.0
}

fn default_saturation_batch() -> u32 {
    64
}

fn default_decode_saturated() -> f64 {
    3200.0
}

/// Throughput-curve model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputModel {
    /// Prefill throughput in tokens/sec.
    #[serde(default = "default_prefill_rate")]
    pub prefill_tokens_per_sec: f64,
    /// Decode throughput at batch size 1 in tokens/sec.
    #[serde(default = "default_decode_batch1")]
    pub decode_tokens_per_sec_batch1: f64,
    /// Batch size at which decode throughput saturates.
    #[serde(default = "default_saturation_batch")]
    pub decode_throughput_saturation_batch: u32,
    /// Decode throughput at saturation in tokens/sec.
    #[serde(default = "default_decode_saturated")]
    pub decode_tokens_per_sec_saturated: f64,
    /// Fixed per-step overhead in ticks.
    #[serde(default)]
    pub step_overhead: Tick,
}

impl Default for ThroughputModel {
    fn default() -> Self {
        // H100-like parameters
        Self {
            prefill_tokens_per_sec: default_prefill_rate(),
            decode_tokens_per_sec_batch1: default_decode_batch1(),
            decode_throughput_saturation_batch: default_saturation_batch(),
            decode_tokens_per_sec_saturated: default_decode_saturated(),
            step_overhead: 0,
        }
    }
}

impl ThroughputModel {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefill_tokens_per_sec <= 0.0
            || self.decode_tokens_per_sec_batch1 <= 0.0
            || self.decode_tokens_per_sec_saturated <= 0.0
        {
            return Err(ConfigError::Validation(
                "throughput latency rates must be > 0".to_string(),
            ));
        }
        if self.decode_throughput_saturation_batch == 0 {
            return Err(ConfigError::Validation(
                "decode_throughput_saturation_batch must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode throughput for a given batch size using piecewise-linear
    /// interpolation, flat past the saturation point.
    pub fn decode_throughput_at_batch(&self, batch_size: u32) -> f64 {
        if batch_size == 0 {
            return 0.0;
        }
        if batch_size >= self.decode_throughput_saturation_batch {
            return self.decode_tokens_per_sec_saturated;
        }
        let t =
            (batch_size - 1) as f64 / (self.decode_throughput_saturation_batch - 1).max(1) as f64;
        self.decode_tokens_per_sec_batch1
            + t * (self.decode_tokens_per_sec_saturated - self.decode_tokens_per_sec_batch1)
    }
}

impl LatencyModel for ThroughputModel {
    fn step_time(&self, batch: &StepBatch) -> Tick {
        let prefill_us = batch.prefill_tokens as f64 * 1e6 / self.prefill_tokens_per_sec;
        let throughput = self.decode_throughput_at_batch(batch.decode_requests);
        let decode_us = if throughput > 0.0 {
            batch.decode_tokens as f64 * 1e6 / throughput
        } else {
            0.0
        };
        self.step_overhead + (prefill_us + decode_us).ceil() as Tick
    }

    fn name(&self) -> &str {
        "throughput"
    }
}

/// Closed set of latency models.
#[derive(Debug, Clone, PartialEq)]
pub enum LatencyTemplate {
    Blackbox(BlackboxModel),
    Throughput(ThroughputModel),
}

impl LatencyTemplate {
    pub fn from_config(config: &LatencyConfig) -> Result<Self, ConfigError> {
        match config {
            LatencyConfig::Blackbox {
                alpha,
                beta,
                scheduling_overhead,
                preemption_overhead,
            } => Ok(LatencyTemplate::Blackbox(
                BlackboxModel::new(alpha, beta)?
                    .with_overheads(*scheduling_overhead, *preemption_overhead),
            )),
            LatencyConfig::Throughput(model) => {
                model.validate()?;
                Ok(LatencyTemplate::Throughput(model.clone()))
            }
        }
    }

    fn inner(&self) -> &dyn LatencyModel {
        match self {
            LatencyTemplate::Blackbox(m) => m,
            LatencyTemplate::Throughput(m) => m,
        }
    }
}

impl LatencyModel for LatencyTemplate {
    fn step_time(&self, batch: &StepBatch) -> Tick {
        self.inner().step_time(batch)
    }

    fn queueing_delay(&self, request: &Request) -> Tick {
        self.inner().queueing_delay(request)
    }

    fn scheduling_overhead(&self) -> Tick {
        self.inner().scheduling_overhead()
    }

    fn preemption_overhead(&self) -> Tick {
        self.inner().preemption_overhead()
    }

    fn name(&self) -> &str {
        self.inner().name()
    }
}
