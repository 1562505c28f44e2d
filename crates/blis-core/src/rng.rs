//! Partitioned deterministic randomness.
//!
//! Every consumer of randomness asks for a stream by subsystem name. Streams
//! are derived from the master seed and the name only, so adding a new
//! consumer never shifts the draws of an existing one.

use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use xxhash_rust::xxh3::xxh3_64;

/// Workload generation. Seeded with the master seed itself.
pub const SUBSYSTEM_WORKLOAD: &str = "workload";
/// Cluster-level routing. Seeds the `random` routing template.
pub const SUBSYSTEM_ROUTER: &str = "router";

/// Seed of a subsystem stream.
pub fn derive_seed(master_seed: u64, name: &str) -> u64 {
    if name == SUBSYSTEM_WORKLOAD {
        master_seed
    } else {
        master_seed ^ xxh3_64(name.as_bytes())
    }
}

/// Lazily created, cached per-subsystem generators.
#[derive(Debug, Clone)]
pub struct PartitionedRng {
    master_seed: u64,
    streams: BTreeMap<String, ChaCha8Rng>,
}

impl PartitionedRng {
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            streams: BTreeMap::new(),
        }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// The generator for `name`. Repeated calls continue the same sequence.
    pub fn stream_for(&mut self, name: &str) -> &mut ChaCha8Rng {
        let seed = derive_seed(self.master_seed, name);
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| ChaCha8Rng::seed_from_u64(seed))
    }

    /// Names of the streams created so far, in sorted order.
    pub fn subsystems(&self) -> Vec<&str> {
        self.streams.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn draws(rng: &mut PartitionedRng, name: &str, n: usize) -> Vec<u64> {
        (0..n).map(|_| rng.stream_for(name).gen::<u64>()).collect()
    }

    #[test]
    fn test_same_seed_same_draws() {
        let mut a = PartitionedRng::new(42);
        let mut b = PartitionedRng::new(42);
        assert_eq!(draws(&mut a, "router", 8), draws(&mut b, "router", 8));
    }

    #[test]
    fn test_new_consumer_does_not_perturb_existing() {
        let mut a = PartitionedRng::new(42);
        let mut b = PartitionedRng::new(42);
        let first = draws(&mut a, SUBSYSTEM_WORKLOAD, 4);
        // b interleaves draws from another subsystem
        let mut second = Vec::new();
        for _ in 0..4 {
            second.push(b.stream_for(SUBSYSTEM_WORKLOAD).gen::<u64>());
            b.stream_for("instance_3").gen::<u64>();
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_subsystems_are_independent() {
        let mut rng = PartitionedRng::new(42);
        assert_ne!(draws(&mut rng, "router", 4), draws(&mut rng, "instance_0", 4));
    }

    #[test]
    fn test_workload_uses_master_seed() {
        assert_eq!(derive_seed(7, SUBSYSTEM_WORKLOAD), 7);
        assert_ne!(derive_seed(7, SUBSYSTEM_ROUTER), 7);
        assert_ne!(derive_seed(42, "instance_0"), derive_seed(42, "instance_1"));
    }

    #[test]
    fn test_streams_are_cached() {
        let mut rng = PartitionedRng::new(1);
        let a = rng.stream_for("router").gen::<u64>();
        let b = rng.stream_for("router").gen::<u64>();
        assert_ne!(a, b);
        assert_eq!(rng.subsystems(), vec!["router"]);
    }
}
