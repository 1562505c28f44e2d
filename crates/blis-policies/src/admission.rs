//! Admission policies.
//!
//! Admission runs first in the pipeline and decides whether a request enters
//! the cluster at all, may be held back, or is turned away.

use crate::traits::*;
use crate::PolicyError;
use serde::{Deserialize, Serialize};

/// Admission template selected by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum AdmissionConfig {
    AlwaysAdmit,
    TokenBucket {
        /// Maximum tokens the bucket holds.
        capacity: f64,
        /// Tokens added per simulated second.
        refill_rate: f64,
        /// Delay instead of rejecting when the bucket is short.
        #[serde(default)]
        delay_when_empty: bool,
    },
    RejectAll,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig::AlwaysAdmit
    }
}

/// Admits everything.
#[derive(Debug, Clone, Default)]
pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn decide(&mut self, _request: &RequestInfo, _state: &RouterState) -> AdmissionDecision {
        AdmissionDecision::Admit {
            reason: "always-admit".to_string(),
        }
    }

    fn name(&self) -> &str {
        "always-admit"
    }
}

/// Rate limiter charging each request its input token count.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    delay_when_empty: bool,
    tokens: f64,
    last_refill: Tick,
}

impl TokenBucket {
    /// A full bucket. `refill_rate` is in tokens per simulated second.
    pub fn new(capacity: f64, refill_rate: f64, delay_when_empty: bool) -> Result<Self, PolicyError> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(PolicyError::invalid("token-bucket", "capacity", "must be > 0"));
        }
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(PolicyError::invalid(
                "token-bucket",
                "refill_rate",
                "must be > 0",
            ));
        }
        Ok(Self {
            capacity,
            refill_rate,
            delay_when_empty,
            tokens: capacity,
            last_refill: 0,
        })
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, clock: Tick) {
        let elapsed = clock.saturating_sub(self.last_refill);
        if elapsed > 0 {
            let refill = elapsed as f64 * self.refill_rate / 1e6;
            self.tokens = (self.tokens + refill).min(self.capacity);
            self.last_refill = clock;
        }
    }
}

impl AdmissionPolicy for TokenBucket {
    fn decide(&mut self, request: &RequestInfo, state: &RouterState) -> AdmissionDecision {
        self.refill(state.clock);
        let cost = request.input_tokens as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            return AdmissionDecision::Admit {
                reason: format!("token-bucket: charged {cost}, {:.1} left", self.tokens),
            };
        }
        if self.delay_when_empty && cost <= self.capacity {
            let deficit = cost - self.tokens;
            let wait = (deficit * 1e6 / self.refill_rate).ceil().max(1.0) as Tick;
            return AdmissionDecision::Delay {
                duration: wait,
                reason: format!("token-bucket: short by {deficit:.1}, retry in {wait}"),
            };
        }
        tracing::debug!(
            request = request.id,
            cost,
            available = self.tokens,
            "token bucket exhausted"
        );
        AdmissionDecision::Reject {
            reason: format!(
                "token-bucket: need {cost}, have {:.1} of {}",
                self.tokens, self.capacity
            ),
        }
    }

    fn name(&self) -> &str {
        "token-bucket"
    }
}

/// Pathological: rejects everything.
#[derive(Debug, Clone, Default)]
pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn decide(&mut self, _request: &RequestInfo, _state: &RouterState) -> AdmissionDecision {
        AdmissionDecision::Reject {
            reason: "reject-all".to_string(),
        }
    }

    fn name(&self) -> &str {
        "reject-all"
    }
}

/// Closed set of admission templates.
#[derive(Debug, Clone)]
pub enum AdmissionTemplate {
    AlwaysAdmit(AlwaysAdmit),
    TokenBucket(TokenBucket),
    RejectAll(RejectAll),
}

impl AdmissionTemplate {
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, PolicyError> {
        Ok(match config {
            AdmissionConfig::AlwaysAdmit => AdmissionTemplate::AlwaysAdmit(AlwaysAdmit),
            AdmissionConfig::TokenBucket {
                capacity,
                refill_rate,
                delay_when_empty,
            } => AdmissionTemplate::TokenBucket(TokenBucket::new(
                *capacity,
                *refill_rate,
                *delay_when_empty,
            )?),
            AdmissionConfig::RejectAll => AdmissionTemplate::RejectAll(RejectAll),
        })
    }
}

impl AdmissionPolicy for AdmissionTemplate {
    fn decide(&mut self, request: &RequestInfo, state: &RouterState) -> AdmissionDecision {
        match self {
            AdmissionTemplate::AlwaysAdmit(p) => p.decide(request, state),
            AdmissionTemplate::TokenBucket(p) => p.decide(request, state),
            AdmissionTemplate::RejectAll(p) => p.decide(request, state),
        }
    }

    fn name(&self) -> &str {
        match self {
            AdmissionTemplate::AlwaysAdmit(p) => p.name(),
            AdmissionTemplate::TokenBucket(p) => p.name(),
            AdmissionTemplate::RejectAll(p) => p.name(),
        }
    }
}
