//! Priority policies.
//!
//! A score is first computed at routing time, then recomputed for every
//! queued request after each step so age-based policies keep moving.
//! Priority-aware instance schedulers order their wait queues by it.

use crate::traits::*;
use crate::PolicyError;
use serde::{Deserialize, Serialize};

const DEFAULT_AGE_WEIGHT: f64 = 1e-6;

fn default_age_weight() -> f64 {
    DEFAULT_AGE_WEIGHT
}

/// Priority template selected by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum PriorityConfig {
    Constant {
        #[serde(default)]
        score: f64,
    },
    SloBased {
        #[serde(default)]
        base: f64,
        #[serde(default = "default_age_weight")]
        age_weight: f64,
    },
    InvertedSlo {
        #[serde(default)]
        base: f64,
        #[serde(default = "default_age_weight")]
        age_weight: f64,
    },
}

impl Default for PriorityConfig {
    fn default() -> Self {
        PriorityConfig::Constant { score: 0.0 }
    }
}

/// Same score for every request.
#[derive(Debug, Clone)]
pub struct ConstantPriority {
    score: f64,
}

impl ConstantPriority {
    pub fn new(score: f64) -> Self {
        Self { score }
    }
}

impl PriorityPolicy for ConstantPriority {
    fn compute(&self, _request: &RequestInfo, _clock: Tick) -> f64 {
        self.score
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Older requests get higher priority: `base + age_weight * age`.
#[derive(Debug, Clone)]
pub struct SloBasedPriority {
    base: f64,
    age_weight: f64,
}

impl SloBasedPriority {
    pub fn new(base: f64, age_weight: f64) -> Self {
        Self { base, age_weight }
    }
}

impl PriorityPolicy for SloBasedPriority {
    fn compute(&self, request: &RequestInfo, clock: Tick) -> f64 {
        let age = clock.saturating_sub(request.arrival_time) as f64;
        self.base + self.age_weight * age
    }

    fn name(&self) -> &str {
        "slo-based"
    }
}

/// Pathological: older requests get *lower* priority, starving them.
#[derive(Debug, Clone)]
pub struct InvertedSloPriority {
    base: f64,
    age_weight: f64,
}

impl InvertedSloPriority {
    pub fn new(base: f64, age_weight: f64) -> Self {
        Self { base, age_weight }
    }
}

impl PriorityPolicy for InvertedSloPriority {
    fn compute(&self, request: &RequestInfo, clock: Tick) -> f64 {
        let age = clock.saturating_sub(request.arrival_time) as f64;
        self.base - self.age_weight * age
    }

    fn name(&self) -> &str {
        "inverted-slo"
    }
}

/// Closed set of priority templates.
#[derive(Debug, Clone)]
pub enum PriorityTemplate {
    Constant(ConstantPriority),
    SloBased(SloBasedPriority),
    InvertedSlo(InvertedSloPriority),
}

impl PriorityTemplate {
    pub fn from_config(config: &PriorityConfig) -> Result<Self, PolicyError> {
        let check = |name: &'static str, age_weight: f64| {
            if age_weight.is_finite() && age_weight >= 0.0 {
                Ok(())
            } else {
                Err(PolicyError::invalid(name, "age_weight", "must be finite and >= 0"))
            }
        };
        Ok(match *config {
            PriorityConfig::Constant { score } => {
                if !score.is_finite() {
                    return Err(PolicyError::invalid("constant", "score", "must be finite"));
                }
                PriorityTemplate::Constant(ConstantPriority::new(score))
            }
            PriorityConfig::SloBased { base, age_weight } => {
                check("slo-based", age_weight)?;
                PriorityTemplate::SloBased(SloBasedPriority::new(base, age_weight))
            }
            PriorityConfig::InvertedSlo { base, age_weight } => {
                check("inverted-slo", age_weight)?;
                PriorityTemplate::InvertedSlo(InvertedSloPriority::new(base, age_weight))
            }
        })
    }

    /// Whether this policy assigns every request the same score.
    pub fn is_constant(&self) -> bool {
        matches!(self, PriorityTemplate::Constant(_))
    }
}

impl PriorityPolicy for PriorityTemplate {
    fn compute(&self, request: &RequestInfo, clock: Tick) -> f64 {
        match self {
            PriorityTemplate::Constant(p) => p.compute(request, clock),
            PriorityTemplate::SloBased(p) => p.compute(request, clock),
            PriorityTemplate::InvertedSlo(p) => p.compute(request, clock),
        }
    }

    fn name(&self) -> &str {
        match self {
            PriorityTemplate::Constant(p) => p.name(),
            PriorityTemplate::SloBased(p) => p.name(),
            PriorityTemplate::InvertedSlo(p) => p.name(),
        }
    }
}
