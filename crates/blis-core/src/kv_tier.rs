//! Slower CPU tier behind the GPU KV cache.
//!
//! The tier stores only content hashes: a block evicted from the GPU is
//! offloaded here, and a later prefix match on that hash reloads it into a
//! fresh GPU block at a transfer cost instead of recomputing it.

use crate::error::{InvariantViolation, Tier};
use blis_policies::{InstanceId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

fn default_bandwidth() -> f64 {
    100.0
}

fn default_thrash_window() -> Tick {
    1_000
}

/// CPU tier parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuTierConfig {
    /// Capacity in blocks.
    pub blocks: u64,
    /// Transfer bandwidth in tokens per tick.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: f64,
    /// Fixed cost per reload batch, in ticks.
    #[serde(default)]
    pub base_latency: Tick,
    /// A reload this soon after the offload counts as thrash.
    #[serde(default = "default_thrash_window")]
    pub thrash_window: Tick,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    stamp: u64,
    offloaded_at: Tick,
}

/// Hash-only CPU tier with LRU replacement.
#[derive(Debug, Clone)]
pub struct CpuTier {
    instance: InstanceId,
    capacity: u64,
    free: u64,
    block_size: u32,
    bandwidth: f64,
    base_latency: Tick,
    thrash_window: Tick,
    entries: HashMap<u64, Entry>,
    lru: BTreeSet<(u64, u64)>,
    stamp: u64,
    pending_latency: Tick,
    pub offloads: u64,
    pub reloads: u64,
    pub thrashes: u64,
    pub dropped: u64,
}

impl CpuTier {
    pub fn new(instance: InstanceId, config: &CpuTierConfig, block_size: u32) -> Self {
        Self {
            instance,
            capacity: config.blocks,
            free: config.blocks,
            block_size,
            bandwidth: config.bandwidth,
            base_latency: config.base_latency,
            thrash_window: config.thrash_window,
            entries: HashMap::new(),
            lru: BTreeSet::new(),
            stamp: 0,
            pending_latency: 0,
            offloads: 0,
            reloads: 0,
            thrashes: 0,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.contains_key(&hash)
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Store the hash of a block just evicted from the GPU.
    pub fn offload(&mut self, hash: u64, now: Tick) -> Result<(), InvariantViolation> {
        if self.capacity == 0 {
            return Ok(());
        }
        let stamp = self.next_stamp();
        if let Some(entry) = self.entries.get_mut(&hash) {
            self.lru.remove(&(entry.stamp, hash));
            entry.stamp = stamp;
            entry.offloaded_at = now;
            self.lru.insert((stamp, hash));
            return Ok(());
        }
        if self.free == 0 {
            if let Some((_, oldest)) = self.lru.pop_first() {
                self.entries.remove(&oldest);
                self.free += 1;
                self.dropped += 1;
            }
        }
        self.entries.insert(
            hash,
            Entry {
                stamp,
                offloaded_at: now,
            },
        );
        self.lru.insert((stamp, hash));
        self.free -= 1;
        self.offloads += 1;
        self.check_conservation()
    }

    /// Move `hashes` back to the GPU and accrue their transfer latency.
    pub fn reload(&mut self, hashes: &[u64], now: Tick) -> Result<(), InvariantViolation> {
        let mut moved = 0u64;
        for &hash in hashes {
            let Some(entry) = self.entries.remove(&hash) else {
                continue;
            };
            self.lru.remove(&(entry.stamp, hash));
            self.free += 1;
            moved += 1;
            if now.saturating_sub(entry.offloaded_at) <= self.thrash_window {
                self.thrashes += 1;
                tracing::debug!(
                    instance = self.instance,
                    hash,
                    offloaded_at = entry.offloaded_at,
                    now,
                    "kv block reloaded inside thrash window"
                );
            }
        }
        if moved > 0 {
            self.reloads += moved;
            self.pending_latency += self.transfer_latency(moved);
        }
        self.check_conservation()
    }

    /// `base + blocks * block_size / bandwidth`, rounded up.
    pub fn transfer_latency(&self, blocks: u64) -> Tick {
        if blocks == 0 {
            return 0;
        }
        let tokens = blocks as f64 * self.block_size as f64;
        let transfer = if self.bandwidth > 0.0 {
            (tokens / self.bandwidth).ceil() as Tick
        } else {
            0
        };
        self.base_latency + transfer
    }

    pub fn pending_transfer_latency(&self) -> Tick {
        self.pending_latency
    }

    /// Read and clear the accrued transfer latency.
    pub fn consume_pending_transfer_latency(&mut self) -> Tick {
        std::mem::take(&mut self.pending_latency)
    }

    pub fn thrash_rate(&self) -> f64 {
        if self.reloads == 0 {
            0.0
        } else {
            self.thrashes as f64 / self.reloads as f64
        }
    }

    pub fn check_conservation(&self) -> Result<(), InvariantViolation> {
        if self.used() + self.free != self.capacity {
            let err = InvariantViolation::KvConservation {
                instance: self.instance,
                tier: Tier::Cpu,
                used: self.used(),
                free: self.free,
                total: self.capacity,
            };
            tracing::error!(%err, "cpu tier conservation broken");
            return Err(err);
        }
        Ok(())
    }
}
