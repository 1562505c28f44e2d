//! Routing configuration and the closed set of routing templates.

use crate::least_loaded::{AlwaysBusiest, LeastLoaded, PdSplit};
use crate::prefix_affinity::PrefixAffinity;
use crate::random::RandomRouting;
use crate::round_robin::RoundRobin;
use crate::traits::*;
use crate::weighted::{default_scorers, ScorerWeight, WeightedScoring};
use crate::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routing template selected by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum RoutingConfig {
    RoundRobin,
    Random,
    LeastLoaded,
    Weighted {
        #[serde(default = "default_scorers")]
        scorers: Vec<ScorerWeight>,
    },
    PrefixAffinity,
    PdSplit,
    AlwaysBusiest,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig::RoundRobin
    }
}

impl RoutingConfig {
    /// Template for a bare name, with default parameters.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "round-robin" => Some(RoutingConfig::RoundRobin),
            "random" => Some(RoutingConfig::Random),
            "least-loaded" => Some(RoutingConfig::LeastLoaded),
            "weighted" => Some(RoutingConfig::Weighted {
                scorers: default_scorers(),
            }),
            "prefix-affinity" => Some(RoutingConfig::PrefixAffinity),
            "pd-split" => Some(RoutingConfig::PdSplit),
            "always-busiest" => Some(RoutingConfig::AlwaysBusiest),
            _ => None,
        }
    }

    /// Whether the template emits prefill/decode pairs.
    pub fn is_disaggregated(&self) -> bool {
        matches!(self, RoutingConfig::PdSplit)
    }
}

/// Names accepted by [`RoutingConfig::by_name`].
pub fn available_routing() -> Vec<&'static str> {
    vec![
        "round-robin",
        "random",
        "least-loaded",
        "weighted",
        "prefix-affinity",
        "pd-split",
        "always-busiest",
    ]
}

/// Closed set of routing templates.
#[derive(Debug, Clone)]
pub enum RoutingTemplate {
    RoundRobin(RoundRobin),
    Random(RandomRouting),
    LeastLoaded(LeastLoaded),
    Weighted(WeightedScoring),
    PrefixAffinity(PrefixAffinity),
    PdSplit(PdSplit),
    AlwaysBusiest(AlwaysBusiest),
}

impl RoutingTemplate {
    /// `block_size` must match the instances' KV block size so router-side
    /// prefix hashes agree with the caches. `seed` feeds the templates that
    /// draw random numbers.
    pub fn from_config(
        config: &RoutingConfig,
        block_size: u32,
        seed: u64,
    ) -> Result<Self, PolicyError> {
        Ok(match config {
            RoutingConfig::RoundRobin => RoutingTemplate::RoundRobin(RoundRobin::new()),
            RoutingConfig::Random => RoutingTemplate::Random(RandomRouting::new(seed)),
            RoutingConfig::LeastLoaded => RoutingTemplate::LeastLoaded(LeastLoaded::new()),
            RoutingConfig::Weighted { scorers } => {
                RoutingTemplate::Weighted(WeightedScoring::new(scorers, block_size)?)
            }
            RoutingConfig::PrefixAffinity => {
                RoutingTemplate::PrefixAffinity(PrefixAffinity::new(block_size))
            }
            RoutingConfig::PdSplit => RoutingTemplate::PdSplit(PdSplit),
            RoutingConfig::AlwaysBusiest => RoutingTemplate::AlwaysBusiest(AlwaysBusiest),
        })
    }

    fn inner(&self) -> &dyn RoutingPolicy {
        match self {
            RoutingTemplate::RoundRobin(p) => p,
            RoutingTemplate::Random(p) => p,
            RoutingTemplate::LeastLoaded(p) => p,
            RoutingTemplate::Weighted(p) => p,
            RoutingTemplate::PrefixAffinity(p) => p,
            RoutingTemplate::PdSplit(p) => p,
            RoutingTemplate::AlwaysBusiest(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RoutingPolicy {
        match self {
            RoutingTemplate::RoundRobin(p) => p,
            RoutingTemplate::Random(p) => p,
            RoutingTemplate::LeastLoaded(p) => p,
            RoutingTemplate::Weighted(p) => p,
            RoutingTemplate::PrefixAffinity(p) => p,
            RoutingTemplate::PdSplit(p) => p,
            RoutingTemplate::AlwaysBusiest(p) => p,
        }
    }
}

impl RoutingPolicy for RoutingTemplate {
    fn route(&mut self, request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        self.inner_mut().route(request, state)
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        self.inner().custom_metrics()
    }
}
