//! Weighted multi-scorer routing.
//!
//! Each scorer maps every candidate to a value in `[0, 1]` (higher is
//! better). The router combines them with normalized weights and picks the
//! argmax; strict comparison while iterating in id order makes the lowest id
//! win ties.

use crate::prefix_affinity::{PrefixIndex, DEFAULT_INDEX_CAPACITY};
use crate::traits::*;
use crate::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Available scorers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScorerKind {
    /// Min-max normalized effective load, inverted.
    QueueDepth,
    /// `1 - kv_utilization`.
    KvUtilization,
    /// `1 / (1 + effective_load)`.
    LoadBalance,
    /// Fraction of prompt blocks recorded on the instance.
    PrefixAffinity,
}

impl ScorerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScorerKind::QueueDepth => "queue-depth",
            ScorerKind::KvUtilization => "kv-utilization",
            ScorerKind::LoadBalance => "load-balance",
            ScorerKind::PrefixAffinity => "prefix-affinity",
        }
    }
}

impl FromStr for ScorerKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue-depth" => Ok(ScorerKind::QueueDepth),
            "kv-utilization" => Ok(ScorerKind::KvUtilization),
            "load-balance" => Ok(ScorerKind::LoadBalance),
            "prefix-affinity" => Ok(ScorerKind::PrefixAffinity),
            other => Err(PolicyError::UnknownName {
                kind: "scorer",
                name: other.to_string(),
            }),
        }
    }
}

/// One scorer and its weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerWeight {
    pub scorer: ScorerKind,
    pub weight: f64,
}

impl fmt::Display for ScorerWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scorer.as_str(), self.weight)
    }
}

/// Default scorer mix: `prefix-affinity:3, queue-depth:2, kv-utilization:2`.
pub fn default_scorers() -> Vec<ScorerWeight> {
    vec![
        ScorerWeight {
            scorer: ScorerKind::PrefixAffinity,
            weight: 3.0,
        },
        ScorerWeight {
            scorer: ScorerKind::QueueDepth,
            weight: 2.0,
        },
        ScorerWeight {
            scorer: ScorerKind::KvUtilization,
            weight: 2.0,
        },
    ]
}

/// Parse `"name:weight,name:weight"`.
pub fn parse_scorers(spec: &str) -> Result<Vec<ScorerWeight>, PolicyError> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, weight) = entry.split_once(':').ok_or_else(|| {
                PolicyError::invalid("weighted", "scorers", format!("`{entry}` is not name:weight"))
            })?;
            let weight: f64 = weight.trim().parse().map_err(|_| {
                PolicyError::invalid("weighted", "scorers", format!("bad weight in `{entry}`"))
            })?;
            Ok(ScorerWeight {
                scorer: name.trim().parse()?,
                weight,
            })
        })
        .collect()
}

/// Weighted-scoring router.
#[derive(Debug, Clone)]
pub struct WeightedScoring {
    scorers: Vec<ScorerWeight>,
    prefix_index: Option<PrefixIndex>,
}

impl WeightedScoring {
    /// Validates weights and normalizes them to sum to one.
    pub fn new(scorers: &[ScorerWeight], block_size: u32) -> Result<Self, PolicyError> {
        if scorers.is_empty() {
            return Err(PolicyError::invalid("weighted", "scorers", "must not be empty"));
        }
        for s in scorers {
            if !(s.weight.is_finite() && s.weight > 0.0) {
                return Err(PolicyError::invalid(
                    "weighted",
                    "scorers",
                    format!("weight of {} must be > 0", s.scorer.as_str()),
                ));
            }
        }
        let total: f64 = scorers.iter().map(|s| s.weight).sum();
        let normalized = scorers
            .iter()
            .map(|s| ScorerWeight {
                scorer: s.scorer,
                weight: s.weight / total,
            })
            .collect::<Vec<_>>();
        let prefix_index = normalized
            .iter()
            .any(|s| s.scorer == ScorerKind::PrefixAffinity)
            .then(|| PrefixIndex::new(block_size, DEFAULT_INDEX_CAPACITY));
        Ok(Self {
            scorers: normalized,
            prefix_index,
        })
    }

    /// Normalized weights.
    pub fn weights(&self) -> &[ScorerWeight] {
        &self.scorers
    }

    fn score(
        &self,
        kind: ScorerKind,
        candidates: &[&InstanceSnapshot],
        hashes: &[u64],
    ) -> BTreeMap<InstanceId, f64> {
        match kind {
            ScorerKind::QueueDepth => {
                let loads = candidates.iter().map(|s| s.effective_load());
                let min = loads.clone().min().unwrap_or(0);
                let max = loads.max().unwrap_or(0);
                candidates
                    .iter()
                    .map(|s| {
                        let v = if max == min {
                            1.0
                        } else {
                            (max - s.effective_load()) as f64 / (max - min) as f64
                        };
                        (s.id, v)
                    })
                    .collect()
            }
            ScorerKind::KvUtilization => candidates
                .iter()
                .map(|s| (s.id, 1.0 - s.kv_utilization))
                .collect(),
            ScorerKind::LoadBalance => candidates
                .iter()
                .map(|s| (s.id, 1.0 / (1.0 + s.effective_load() as f64)))
                .collect(),
            ScorerKind::PrefixAffinity => candidates
                .iter()
                .map(|s| {
                    let v = match &self.prefix_index {
                        Some(idx) if !hashes.is_empty() => {
                            idx.match_length(hashes, s.id) as f64 / hashes.len() as f64
                        }
                        _ => 0.0,
                    };
                    (s.id, v)
                })
                .collect(),
        }
    }
}

impl RoutingPolicy for WeightedScoring {
    fn route(&mut self, request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let mut candidates = prefill_candidates(&state.snapshots);
        candidates.sort_by_key(|s| s.id);
        if candidates.is_empty() {
            return RoutingDecision::reject("weighted: no prefill-capable instance");
        }
        let hashes = self
            .prefix_index
            .as_ref()
            .map(|idx| idx.hashes_for(request))
            .unwrap_or_default();

        let mut combined: BTreeMap<InstanceId, f64> =
            candidates.iter().map(|s| (s.id, 0.0)).collect();
        for sw in &self.scorers {
            for (id, v) in self.score(sw.scorer, &candidates, &hashes) {
                if let Some(total) = combined.get_mut(&id) {
                    *total += sw.weight * v.clamp(0.0, 1.0);
                }
            }
        }

        let mut best: Option<(InstanceId, f64)> = None;
        for (&id, &score) in &combined {
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((id, score));
            }
        }
        let Some((chosen, score)) = best else {
            return RoutingDecision::reject("weighted: no scores");
        };

        if let Some(idx) = self.prefix_index.as_mut() {
            idx.record(&hashes, chosen);
        }
        tracing::trace!(request = request.id, chosen, score, "weighted route");
        RoutingDecision::to_instance(chosen, format!("weighted: score {score:.3}"))
            .with_scores(combined)
    }

    fn name(&self) -> &str {
        "weighted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{make_snapshots, sample_request};

    fn only(kind: ScorerKind) -> WeightedScoring {
        WeightedScoring::new(&[ScorerWeight { scorer: kind, weight: 1.0 }], 16).unwrap()
    }

    #[test]
    fn test_weights_are_normalized() {
        let w = WeightedScoring::new(&default_scorers(), 16).unwrap();
        let sum: f64 = w.weights().iter().map(|s| s.weight).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((w.weights()[0].weight - 3.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_queue_depth_prefers_idle() {
        let mut snaps = make_snapshots(3);
        snaps[0].queue_depth = 4;
        snaps[1].queue_depth = 0;
        snaps[2].queue_depth = 2;
        let d = only(ScorerKind::QueueDepth).route(&sample_request(0), &RouterState::new(0, snaps));
        assert_eq!(d.target, RouteTarget::Instance(1));
        assert_eq!(d.scores[&0], 0.0);
        assert_eq!(d.scores[&2], 0.5);
    }

    #[test]
    fn test_kv_utilization() {
        let mut snaps = make_snapshots(2);
        snaps[0].kv_utilization = 0.9;
        snaps[1].kv_utilization = 0.2;
        let d = only(ScorerKind::KvUtilization).route(&sample_request(0), &RouterState::new(0, snaps));
        assert_eq!(d.target, RouteTarget::Instance(1));
    }

    #[test]
    fn test_all_equal_lowest_id_wins() {
        let d = only(ScorerKind::LoadBalance)
            .route(&sample_request(0), &RouterState::new(0, make_snapshots(4)));
        assert_eq!(d.target, RouteTarget::Instance(0));
    }

    #[test]
    fn test_prefix_affinity_scorer_sticks() {
        let mut w = WeightedScoring::new(&default_scorers(), 16).unwrap();
        let mut req = sample_request(1);
        req.prefix = Some(SharedPrefix { group: 3, tokens: 512 });
        let mut snaps = make_snapshots(2);
        snaps[0].queue_depth = 1;
        let first = w.route(&req, &RouterState::new(0, snaps.clone()));
        assert_eq!(first.target, RouteTarget::Instance(1));

        // Same prefix, instance 1 a little busier: affinity outweighs load.
        req.id = 2;
        snaps[0].queue_depth = 0;
        snaps[1].queue_depth = 1;
        let second = w.route(&req, &RouterState::new(0, snaps));
        assert_eq!(second.target, RouteTarget::Instance(1));
    }

    #[test]
    fn test_parse_scorers() {
        let parsed = parse_scorers("prefix-affinity:3, queue-depth:2,kv-utilization:2").unwrap();
        assert_eq!(parsed, default_scorers());
        assert!(parse_scorers("bogus:1").is_err());
        assert!(parse_scorers("queue-depth").is_err());
    }

    #[test]
    fn test_invalid_weights() {
        assert!(WeightedScoring::new(&[], 16).is_err());
        let bad = [ScorerWeight {
            scorer: ScorerKind::QueueDepth,
            weight: 0.0,
        }];
        assert!(WeightedScoring::new(&bad, 16).is_err());
    }
}
