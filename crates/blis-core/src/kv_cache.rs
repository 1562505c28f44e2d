//! Block-structured KV cache with prefix reuse, reference counting and LRU
//! eviction.
//!
//! Models the memory management of a paged KV cache:
//! - Blocks live in an arena indexed by [`BlockId`]; requests hold ids only
//! - Full blocks carry a chained content hash and stay cached after release
//! - Shared blocks are reference counted and never evicted while referenced
//! - Clean blocks are reused lowest id first, cached ones least recently used
//!   first (ties on lowest id)
//! - An optional CPU tier receives hashes of evicted blocks

use crate::error::{InvariantViolation, Tier};
use crate::kv_tier::{CpuTier, CpuTierConfig};
use crate::request::Request;
use blis_policies::prefix::{block_hashes, prompt_block_hashes};
use blis_policies::{InstanceId, RequestId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Index of a block in the arena.
pub type BlockId = u32;

/// Errors returned by allocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvCacheError {
    /// Not enough free or evictable blocks. Nothing was changed.
    #[error("kv cache exhausted: need {needed} blocks, {available} available")]
    Exhausted { needed: u64, available: u64 },
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

#[derive(Debug, Clone, Default)]
struct Block {
    hash: Option<u64>,
    refcount: u32,
    filled: u32,
    recency: u64,
}

/// A resident prompt block found by [`KvCacheManager::lookup_prefix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBlock {
    Gpu(BlockId),
    /// Resident only in the CPU tier; reloaded on allocation.
    Cpu(u64),
}

/// Leading prompt blocks already resident in some tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefixMatch {
    pub blocks: Vec<MatchedBlock>,
    /// Full prompt blocks the request has in total.
    pub prompt_blocks: u32,
}

impl PrefixMatch {
    pub fn len(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn cached_tokens(&self, block_size: u32) -> u32 {
        self.len() * block_size
    }

    pub fn cpu_blocks(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|b| matches!(b, MatchedBlock::Cpu(_)))
            .count() as u32
    }
}

/// What an allocation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub new_blocks: u32,
    pub cached_blocks: u32,
    pub reloaded_blocks: u32,
    pub evicted_blocks: u32,
}

/// CPU tier counters for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTierStats {
    pub capacity: u64,
    pub used: u64,
    pub offloads: u64,
    pub reloads: u64,
    pub thrashes: u64,
    pub thrash_rate: f64,
}

/// Statistics snapshot for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub cached_blocks: u64,
    pub utilization: f64,
    pub hit_blocks: u64,
    pub miss_blocks: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub cpu: Option<CpuTierStats>,
}

#[derive(Debug, Clone, Default)]
struct Held {
    blocks: Vec<BlockId>,
    tokens: u32,
}

/// Per-instance KV cache.
#[derive(Debug, Clone)]
pub struct KvCacheManager {
    instance: InstanceId,
    block_size: u32,
    blocks: Vec<Block>,
    /// Unhashed free blocks.
    clean: BTreeSet<BlockId>,
    /// Zero-refcount hashed blocks, by `(recency, id)`.
    evictable: BTreeSet<(u64, BlockId)>,
    hash_index: HashMap<u64, BlockId>,
    held: HashMap<RequestId, Held>,
    used: u64,
    stamp: u64,
    now: Tick,
    cpu: Option<CpuTier>,
    pub hit_blocks: u64,
    pub miss_blocks: u64,
    pub evictions: u64,
}

impl KvCacheManager {
    pub fn new(instance: InstanceId, total_blocks: u32, block_size: u32) -> Self {
        Self {
            instance,
            block_size,
            blocks: vec![Block::default(); total_blocks as usize],
            clean: (0..total_blocks).collect(),
            evictable: BTreeSet::new(),
            hash_index: HashMap::new(),
            held: HashMap::new(),
            used: 0,
            stamp: 0,
            now: 0,
            cpu: None,
            hit_blocks: 0,
            miss_blocks: 0,
            evictions: 0,
        }
    }

    /// Attach a CPU tier.
    pub fn with_cpu_tier(mut self, config: &CpuTierConfig) -> Self {
        self.cpu = Some(CpuTier::new(self.instance, config, self.block_size));
        self
    }

    /// Time used for tier bookkeeping.
    pub fn set_clock(&mut self, now: Tick) {
        self.now = now;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn used_blocks(&self) -> u64 {
        self.used
    }

    /// Clean plus evictable blocks.
    pub fn free_blocks(&self) -> u64 {
        (self.clean.len() + self.evictable.len()) as u64
    }

    pub fn cached_blocks(&self) -> u64 {
        self.evictable.len() as u64
    }

    pub fn utilization(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        self.used as f64 / self.blocks.len() as f64
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_blocks + self.miss_blocks;
        if total == 0 {
            return 0.0;
        }
        self.hit_blocks as f64 / total as f64
    }

    /// Blocks needed to back `tokens` tokens.
    pub fn blocks_for_tokens(&self, tokens: u32) -> u64 {
        tokens.div_ceil(self.block_size) as u64
    }

    /// Block ids currently held by a request, in token order.
    pub fn held_blocks(&self, request: RequestId) -> &[BlockId] {
        self.held
            .get(&request)
            .map(|h| h.blocks.as_slice())
            .unwrap_or(&[])
    }

    pub fn refcount(&self, block: BlockId) -> Option<u32> {
        self.blocks.get(block as usize).map(|b| b.refcount)
    }

    /// Whether a content hash is resident on the GPU.
    pub fn is_cached(&self, hash: u64) -> bool {
        self.hash_index.contains_key(&hash)
    }

    pub fn cpu_tier(&self) -> Option<&CpuTier> {
        self.cpu.as_ref()
    }

    /// Read and clear transfer latency accrued by CPU reloads.
    pub fn consume_pending_transfer_latency(&mut self) -> Tick {
        self.cpu
            .as_mut()
            .map(CpuTier::consume_pending_transfer_latency)
            .unwrap_or(0)
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Longest run of leading full prompt blocks resident in some tier.
    ///
    /// At most `(input - 1) / block_size` blocks match, so at least one
    /// prompt token is always left to compute. `prompt_blocks` still counts
    /// every full prompt block, so a prompt ending on a block boundary
    /// records its recomputed last block as a miss even when fully cached.
    pub fn lookup_prefix(&self, request: &Request) -> PrefixMatch {
        let hashes = prompt_block_hashes(
            request.id,
            request.prefix,
            request.input_tokens,
            self.block_size,
        );
        let cap = (request.input_tokens.saturating_sub(1) / self.block_size) as usize;
        let mut blocks = Vec::new();
        for &hash in hashes.iter().take(cap) {
            if let Some(&id) = self.hash_index.get(&hash) {
                blocks.push(MatchedBlock::Gpu(id));
            } else if self.cpu.as_ref().is_some_and(|c| c.contains(hash)) {
                blocks.push(MatchedBlock::Cpu(hash));
            } else {
                break;
            }
        }
        PrefixMatch {
            blocks,
            prompt_blocks: hashes.len() as u32,
        }
    }

    /// Extend `request`'s allocation so tokens up to `end` are backed.
    ///
    /// `[start, end)` are the tokens computed this step. On a request's first
    /// allocation the blocks in `prefix` are attached before anything else.
    /// On shortage returns [`KvCacheError::Exhausted`] without touching
    /// any state.
    pub fn allocate(
        &mut self,
        request: &Request,
        start: u32,
        end: u32,
        prefix: &PrefixMatch,
    ) -> Result<Allocation, KvCacheError> {
        let bs = self.block_size;
        let (held_blocks, held_tokens) = self
            .held
            .get(&request.id)
            .map(|h| (h.blocks.len() as u32, h.tokens))
            .unwrap_or((0, 0));
        let attach: &[MatchedBlock] = if held_blocks == 0 {
            &prefix.blocks
        } else {
            &[]
        };
        let base_tokens = if held_blocks == 0 {
            attach.len() as u32 * bs
        } else {
            held_tokens
        };
        let end = end.max(start).max(base_tokens);
        if end == base_tokens && attach.is_empty() {
            return Ok(Allocation::default());
        }

        let room = held_blocks * bs - held_tokens;
        let fresh_blocks = (end - base_tokens).saturating_sub(room).div_ceil(bs) as u64;
        let mut reserved = 0u64;
        let mut reloads = 0u64;
        for m in attach {
            match *m {
                MatchedBlock::Gpu(id) => {
                    if self.blocks.get(id as usize).map(|b| b.refcount) == Some(0) {
                        reserved += 1;
                    }
                }
                MatchedBlock::Cpu(_) => reloads += 1,
            }
        }
        let needed = fresh_blocks + reloads;
        let available = self.free_blocks() - reserved;
        if needed > available {
            return Err(KvCacheError::Exhausted { needed, available });
        }

        let mut allocation = Allocation::default();
        let mut held = self.held.remove(&request.id).unwrap_or_default();

        // GPU hits first so that reload-driven evictions cannot take them.
        let mut slots: Vec<Option<BlockId>> = Vec::with_capacity(attach.len());
        for m in attach {
            match *m {
                MatchedBlock::Gpu(id) => {
                    self.acquire(id)?;
                    allocation.cached_blocks += 1;
                    slots.push(Some(id));
                }
                MatchedBlock::Cpu(_) => slots.push(None),
            }
        }
        let mut reloaded = Vec::new();
        for (slot, m) in slots.iter_mut().zip(attach) {
            if let MatchedBlock::Cpu(hash) = *m {
                let id = self.take_free(&mut allocation)?;
                self.fill(id, bs);
                self.register(id, hash);
                reloaded.push(hash);
                *slot = Some(id);
            }
        }
        if !reloaded.is_empty() {
            allocation.reloaded_blocks = reloaded.len() as u32;
            if let Some(cpu) = self.cpu.as_mut() {
                cpu.reload(&reloaded, self.now)?;
            }
        }
        held.blocks.extend(slots.into_iter().flatten());
        held.tokens = base_tokens;

        let full_before = held.tokens / bs;
        let hashes = if end / bs > full_before {
            block_hashes(request.id, request.prefix, end / bs, bs)
        } else {
            Vec::new()
        };

        if room > 0 {
            if let Some(&last) = held.blocks.last() {
                let add = room.min(end - held.tokens);
                self.blocks[last as usize].filled += add;
                held.tokens += add;
                if self.blocks[last as usize].filled == bs {
                    if let Some(&h) = hashes.get(held.blocks.len() - 1) {
                        self.register(last, h);
                    }
                }
            }
        }
        while held.tokens < end {
            let id = self.take_free(&mut allocation)?;
            let add = bs.min(end - held.tokens);
            self.fill(id, add);
            held.blocks.push(id);
            held.tokens += add;
            allocation.new_blocks += 1;
            if add == bs {
                if let Some(&h) = hashes.get(held.blocks.len() - 1) {
                    self.register(id, h);
                }
            }
        }

        if held_blocks == 0 && prefix.prompt_blocks > 0 {
            self.hit_blocks += prefix.len() as u64;
            self.miss_blocks += prefix.prompt_blocks.saturating_sub(prefix.len()) as u64;
        }
        self.held.insert(request.id, held);
        self.check_conservation()?;
        Ok(allocation)
    }

    /// Drop every reference `request` holds, last block first.
    pub fn release(&mut self, request: RequestId) -> Result<(), InvariantViolation> {
        let Some(held) = self.held.remove(&request) else {
            return Ok(());
        };
        for &id in held.blocks.iter().rev() {
            let stamp = self.next_stamp();
            let instance = self.instance;
            let block = self
                .blocks
                .get_mut(id as usize)
                .ok_or(InvariantViolation::UnknownBlock { instance, block: id })?;
            if block.refcount == 0 {
                let err = InvariantViolation::NegativeRefcount { instance, block: id };
                tracing::error!(%err, request, "release of unreferenced block");
                return Err(err);
            }
            block.refcount -= 1;
            if block.refcount == 0 {
                block.recency = stamp;
                self.used -= 1;
                if block.hash.is_some() {
                    self.evictable.insert((stamp, id));
                } else {
                    block.filled = 0;
                    self.clean.insert(id);
                }
            }
        }
        self.check_conservation()
    }

    /// Evict a cached block. Referenced blocks cannot be evicted.
    pub fn evict(&mut self, block: BlockId) -> Result<(), InvariantViolation> {
        let b = self
            .blocks
            .get(block as usize)
            .ok_or(InvariantViolation::UnknownBlock {
                instance: self.instance,
                block,
            })?;
        if b.refcount > 0 {
            let err = InvariantViolation::EvictReferenced {
                instance: self.instance,
                block,
                refcount: b.refcount,
            };
            tracing::error!(%err, "eviction of referenced block");
            return Err(err);
        }
        if self.evictable.remove(&(b.recency, block)) {
            self.drop_cached(block)?;
            self.clean.insert(block);
        }
        self.check_conservation()
    }

    /// `used + free == total` on every tier.
    pub fn check_conservation(&self) -> Result<(), InvariantViolation> {
        let free = self.free_blocks();
        if self.used + free != self.total_blocks() {
            let err = InvariantViolation::KvConservation {
                instance: self.instance,
                tier: Tier::Gpu,
                used: self.used,
                free,
                total: self.total_blocks(),
            };
            tracing::error!(%err, "gpu kv conservation broken");
            return Err(err);
        }
        match &self.cpu {
            Some(cpu) => cpu.check_conservation(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            total_blocks: self.total_blocks(),
            used_blocks: self.used,
            free_blocks: self.free_blocks(),
            cached_blocks: self.cached_blocks(),
            utilization: self.utilization(),
            hit_blocks: self.hit_blocks,
            miss_blocks: self.miss_blocks,
            hit_rate: self.hit_rate(),
            evictions: self.evictions,
            cpu: self.cpu.as_ref().map(|c| CpuTierStats {
                capacity: c.capacity(),
                used: c.used(),
                offloads: c.offloads,
                reloads: c.reloads,
                thrashes: c.thrashes,
                thrash_rate: c.thrash_rate(),
            }),
        }
    }

    /// Take a reference on a resident block.
    fn acquire(&mut self, id: BlockId) -> Result<(), InvariantViolation> {
        let stamp = self.next_stamp();
        let instance = self.instance;
        let block = self
            .blocks
            .get_mut(id as usize)
            .ok_or(InvariantViolation::UnknownBlock { instance, block: id })?;
        if block.refcount == 0 {
            self.evictable.remove(&(block.recency, id));
            self.used += 1;
        }
        block.refcount += 1;
        block.recency = stamp;
        Ok(())
    }

    /// A clean block if any, otherwise the least recently used cached one.
    fn take_free(&mut self, allocation: &mut Allocation) -> Result<BlockId, KvCacheError> {
        if let Some(id) = self.clean.pop_first() {
            self.used += 1;
            return Ok(id);
        }
        if let Some((_, id)) = self.evictable.pop_first() {
            self.drop_cached(id)?;
            allocation.evicted_blocks += 1;
            self.used += 1;
            return Ok(id);
        }
        Err(KvCacheError::Exhausted {
            needed: 1,
            available: 0,
        })
    }

    /// Forget a cached block's content, offloading its hash if a tier exists.
    fn drop_cached(&mut self, id: BlockId) -> Result<(), InvariantViolation> {
        let block = &mut self.blocks[id as usize];
        let hash = block.hash.take();
        block.filled = 0;
        self.evictions += 1;
        if let Some(h) = hash {
            if self.hash_index.get(&h) == Some(&id) {
                self.hash_index.remove(&h);
            }
            if let Some(cpu) = self.cpu.as_mut() {
                cpu.offload(h, self.now)?;
            }
        }
        Ok(())
    }

    fn fill(&mut self, id: BlockId, tokens: u32) {
        let stamp = self.next_stamp();
        let block = &mut self.blocks[id as usize];
        block.hash = None;
        block.refcount = 1;
        block.filled = tokens;
        block.recency = stamp;
    }

    /// Index a full block. A hash already resident elsewhere leaves this
    /// block unhashed, so it goes back to the clean list on release.
    fn register(&mut self, id: BlockId, hash: u64) {
        if self.hash_index.contains_key(&hash) {
            return;
        }
        self.hash_index.insert(hash, id);
        self.blocks[id as usize].hash = Some(hash);
    }
}
