//! Uniform random routing.
//!
//! Picks one prefill-capable instance uniformly at random. The generator is
//! owned by the policy and seeded by the caller, so a fixed seed replays the
//! same sequence of picks.

use crate::traits::*;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Random router.
#[derive(Debug, Clone)]
pub struct RandomRouting {
    rng: ChaCha8Rng,
}

impl RandomRouting {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl RoutingPolicy for RandomRouting {
    fn route(&mut self, _request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let candidates = prefill_candidates(&state.snapshots);
        if candidates.is_empty() {
            return RoutingDecision::reject("random: no prefill-capable instance");
        }
        let idx = self.rng.gen_range(0..candidates.len());
        RoutingDecision::to_instance(candidates[idx].id, "random")
    }

    fn name(&self) -> &str {
        "random"
    }
}
