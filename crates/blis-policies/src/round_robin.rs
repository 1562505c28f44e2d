//! Round-robin routing.
//!
//! Distributes requests evenly across instances in a circular fashion,
//! ignoring their load.

use crate::traits::*;

/// Round-robin router.
///
/// Tracks the last-used instance by id rather than positional index, so the
/// rotation is stable when the candidate set changes (for example when only
/// prefill-capable instances are eligible).
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    last_instance: Option<InstanceId>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            last_instance: None,
        }
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(&mut self, _request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let candidates = prefill_candidates(&state.snapshots);
        let chosen = match self.last_instance {
            Some(last) => candidates
                .iter()
                .find(|s| s.id > last)
                .or_else(|| candidates.first()),
            None => candidates.first(),
        };
        match chosen {
            Some(snap) => {
                self.last_instance = Some(snap.id);
                RoutingDecision::to_instance(snap.id, "round-robin")
            }
            None => RoutingDecision::reject("round-robin: no prefill-capable instance"),
        }
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}
