//! Load-driven routing: least-loaded, its pathological mirror, and the
//! prefill/decode split.
//!
//! Load is [`InstanceSnapshot::effective_load`], which counts requests that
//! were routed but not yet enqueued so that a burst of same-tick arrivals
//! does not pile onto one instance.

use crate::traits::*;
use std::cmp::Reverse;

/// Routes to the instance with the smallest effective load.
#[derive(Debug, Clone, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingPolicy for LeastLoaded {
    fn route(&mut self, _request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let candidates = prefill_candidates(&state.snapshots);
        match least_loaded(&candidates) {
            Some(best) => RoutingDecision::to_instance(
                best.id,
                format!("least-loaded: load {}", best.effective_load()),
            ),
            None => RoutingDecision::reject("least-loaded: no prefill-capable instance"),
        }
    }

    fn name(&self) -> &str {
        "least-loaded"
    }
}

/// Pathological: routes to the busiest instance.
#[derive(Debug, Clone, Default)]
pub struct AlwaysBusiest;

impl RoutingPolicy for AlwaysBusiest {
    fn route(&mut self, _request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let busiest = prefill_candidates(&state.snapshots)
            .into_iter()
            .max_by_key(|s| (s.effective_load(), Reverse(s.id)));
        match busiest {
            Some(snap) => RoutingDecision::to_instance(
                snap.id,
                format!("always-busiest: load {}", snap.effective_load()),
            ),
            None => RoutingDecision::reject("always-busiest: no prefill-capable instance"),
        }
    }

    fn name(&self) -> &str {
        "always-busiest"
    }
}

/// Least-loaded prefill instance paired with the least-loaded decode instance.
#[derive(Debug, Clone, Default)]
pub struct PdSplit;

impl RoutingPolicy for PdSplit {
    fn route(&mut self, _request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let prefill = least_loaded(&instances_with_role(&state.snapshots, InstanceRole::Prefill));
        let decode = least_loaded(&instances_with_role(&state.snapshots, InstanceRole::Decode));
        match (prefill, decode) {
            (Some(p), Some(d)) => RoutingDecision {
                target: RouteTarget::Disaggregated {
                    prefill: p.id,
                    decode: d.id,
                },
                reason: format!(
                    "pd-split: prefill load {}, decode load {}",
                    p.effective_load(),
                    d.effective_load()
                ),
                scores: Default::default(),
                priority_hint: None,
            },
            _ => RoutingDecision::reject("pd-split: need both prefill and decode instances"),
        }
    }

    fn name(&self) -> &str {
        "pd-split"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{make_snapshots, sample_request};

    #[test]
    fn test_least_loaded_picks_least_loaded() {
        let mut snaps = make_snapshots(3);
        snaps[0].queue_depth = 10;
        snaps[1].queue_depth = 2;
        snaps[2].queue_depth = 5;
        let state = RouterState::new(0, snaps);
        let d = LeastLoaded::new().route(&sample_request(0), &state);
        assert_eq!(d.target, RouteTarget::Instance(1));
    }

    #[test]
    fn test_least_loaded_counts_pending() {
        let mut snaps = make_snapshots(2);
        snaps[0].pending = 3;
        snaps[1].batch_size = 2;
        let state = RouterState::new(0, snaps);
        let d = LeastLoaded::new().route(&sample_request(0), &state);
        assert_eq!(d.target, RouteTarget::Instance(1));
    }

    #[test]
    fn test_least_loaded_tie_goes_to_lowest_id() {
        let state = RouterState::new(0, make_snapshots(4));
        let d = LeastLoaded::new().route(&sample_request(0), &state);
        assert_eq!(d.target, RouteTarget::Instance(0));
    }

    #[test]
    fn test_always_busiest() {
        let mut snaps = make_snapshots(3);
        snaps[2].queue_depth = 7;
        let state = RouterState::new(0, snaps);
        let d = AlwaysBusiest.route(&sample_request(0), &state);
        assert_eq!(d.target, RouteTarget::Instance(2));
    }

    #[test]
    fn test_always_busiest_tie_goes_to_lowest_id() {
        let state = RouterState::new(0, make_snapshots(3));
        let d = AlwaysBusiest.route(&sample_request(0), &state);
        assert_eq!(d.target, RouteTarget::Instance(0));
    }

    #[test]
    fn test_pd_split() {
        let mut snaps = make_snapshots(4);
        snaps[0].role = InstanceRole::Prefill;
        snaps[1].role = InstanceRole::Prefill;
        snaps[2].role = InstanceRole::Decode;
        snaps[3].role = InstanceRole::Decode;
        snaps[0].queue_depth = 4;
        snaps[2].batch_size = 9;
        let state = RouterState::new(0, snaps);
        let d = PdSplit.route(&sample_request(0), &state);
        assert_eq!(
            d.target,
            RouteTarget::Disaggregated {
                prefill: 1,
                decode: 3
            }
        );
    }

    #[test]
    fn test_pd_split_rejects_without_decode_pool() {
        let state = RouterState::new(0, make_snapshots(2));
        assert_eq!(PdSplit.route(&sample_request(0), &state).target, RouteTarget::Reject);
    }
}
