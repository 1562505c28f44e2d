//! Prefix-affinity routing.
//!
//! Keeps a router-side record of which prompt blocks were sent to which
//! instance and routes each request to the instance with the longest matching
//! prefix. The index is updated synchronously after each decision, so unlike
//! the instance snapshots it is never stale.

use crate::prefix::prompt_block_hashes;
use crate::traits::*;
use std::collections::{BTreeMap, HashMap};

/// Block hashes remembered per instance before the oldest are forgotten.
pub const DEFAULT_INDEX_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Default)]
struct InstanceBlocks {
    last_used: HashMap<u64, u64>,
    by_age: BTreeMap<u64, u64>,
}

/// Router-side approximation of each instance's prefix cache.
#[derive(Debug, Clone)]
pub struct PrefixIndex {
    block_size: u32,
    capacity: usize,
    instances: BTreeMap<InstanceId, InstanceBlocks>,
    stamp: u64,
}

impl PrefixIndex {
    pub fn new(block_size: u32, capacity: usize) -> Self {
        Self {
            block_size,
            capacity: capacity.max(1),
            instances: BTreeMap::new(),
            stamp: 0,
        }
    }

    /// Full prompt-block hashes of a request.
    pub fn hashes_for(&self, request: &RequestInfo) -> Vec<u64> {
        prompt_block_hashes(
            request.id,
            request.prefix,
            request.input_tokens,
            self.block_size,
        )
    }

    /// Number of leading `hashes` recorded for `instance`.
    pub fn match_length(&self, hashes: &[u64], instance: InstanceId) -> usize {
        match self.instances.get(&instance) {
            Some(blocks) => hashes
                .iter()
                .take_while(|h| blocks.last_used.contains_key(*h))
                .count(),
            None => 0,
        }
    }

    /// Remember that `hashes` now live on `instance`, evicting the least
    /// recently recorded entries past capacity.
    pub fn record(&mut self, hashes: &[u64], instance: InstanceId) {
        let blocks = self.instances.entry(instance).or_default();
        for &h in hashes {
            self.stamp += 1;
            if let Some(old) = blocks.last_used.insert(h, self.stamp) {
                blocks.by_age.remove(&old);
            }
            blocks.by_age.insert(self.stamp, h);
        }
        while blocks.last_used.len() > self.capacity {
            match blocks.by_age.pop_first() {
                Some((_, oldest)) => {
                    blocks.last_used.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Entries recorded for `instance`.
    pub fn len_for(&self, instance: InstanceId) -> usize {
        self.instances
            .get(&instance)
            .map_or(0, |b| b.last_used.len())
    }
}

/// Routes to the longest recorded prefix match, else to the least loaded.
#[derive(Debug, Clone)]
pub struct PrefixAffinity {
    index: PrefixIndex,
    affinity_hits: u64,
    fallbacks: u64,
}

impl PrefixAffinity {
    pub fn new(block_size: u32) -> Self {
        Self::with_capacity(block_size, DEFAULT_INDEX_CAPACITY)
    }

    pub fn with_capacity(block_size: u32, capacity: usize) -> Self {
        Self {
            index: PrefixIndex::new(block_size, capacity),
            affinity_hits: 0,
            fallbacks: 0,
        }
    }
}

impl RoutingPolicy for PrefixAffinity {
    fn route(&mut self, request: &RequestInfo, state: &RouterState) -> RoutingDecision {
        let candidates = prefill_candidates(&state.snapshots);
        let hashes = self.index.hashes_for(request);

        let mut scores = BTreeMap::new();
        let mut best: Option<(&InstanceSnapshot, usize)> = None;
        for snap in candidates.iter().copied() {
            let matched = self.index.match_length(&hashes, snap.id);
            if !hashes.is_empty() {
                scores.insert(snap.id, matched as f64 / hashes.len() as f64);
            }
            let better = match best {
                None => true,
                Some((b, m)) => {
                    matched > m || (matched == m && snap.effective_load() < b.effective_load())
                }
            };
            if better {
                best = Some((snap, matched));
            }
        }

        let decision = match best {
            Some((snap, matched)) if matched > 0 => {
                self.affinity_hits += 1;
                RoutingDecision::to_instance(
                    snap.id,
                    format!("prefix-affinity: {matched}/{} blocks", hashes.len()),
                )
            }
            _ => match least_loaded(&candidates) {
                Some(snap) => {
                    self.fallbacks += 1;
                    RoutingDecision::to_instance(snap.id, "prefix-affinity: no match, least-loaded")
                }
                None => return RoutingDecision::reject("prefix-affinity: no prefill-capable instance"),
            },
        };

        if let RouteTarget::Instance(id) = decision.target {
            self.index.record(&hashes, id);
        }
        decision.with_scores(scores)
    }

    fn name(&self) -> &str {
        "prefix-affinity"
    }

    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("affinity_hits".to_string(), self.affinity_hits as f64);
        m.insert("affinity_fallbacks".to_string(), self.fallbacks as f64);
        m
    }
}
