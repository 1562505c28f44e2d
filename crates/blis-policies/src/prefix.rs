//! Content-addressed block hashing.
//!
//! Both the KV-cache manager and the router-side prefix index must agree on
//! block hashes, so the derivation lives here. Hashes are chained: each block
//! hash folds in its parent's, so equal hashes imply equal prefixes.

use crate::traits::{RequestId, SharedPrefix};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash of one full block given its parent hash and content key.
pub fn chain_hash(parent: Option<u64>, key: (u64, u64)) -> u64 {
    let mut buf = [0u8; 24];
    buf[..8].copy_from_slice(&parent.unwrap_or(0).to_le_bytes());
    buf[8..16].copy_from_slice(&key.0.to_le_bytes());
    buf[16..].copy_from_slice(&key.1.to_le_bytes());
    let seed = if parent.is_some() { 1 } else { 0 };
    xxh3_64_with_seed(&buf, seed)
}

/// Content key of block `index` of a request's token stream.
///
/// Blocks wholly inside the shared prefix are keyed by the prefix group so
/// that requests of the same group produce identical hashes; the rest are
/// keyed by the request id.
pub fn content_key(
    request_id: RequestId,
    prefix: Option<SharedPrefix>,
    index: u32,
    block_size: u32,
) -> (u64, u64) {
    // Request ids and prefix groups live in disjoint key spaces.
    const PREFIX_SPACE: u64 = 1 << 63;
    match prefix {
        Some(p) if (index as u64 + 1) * block_size as u64 <= p.tokens as u64 => {
            (p.group | PREFIX_SPACE, index as u64)
        }
        _ => (request_id & !PREFIX_SPACE, index as u64),
    }
}

/// Chained hashes for the first `full_blocks` blocks of a request.
pub fn block_hashes(
    request_id: RequestId,
    prefix: Option<SharedPrefix>,
    full_blocks: u32,
    block_size: u32,
) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(full_blocks as usize);
    let mut parent = None;
    for i in 0..full_blocks {
        let h = chain_hash(parent, content_key(request_id, prefix, i, block_size));
        hashes.push(h);
        parent = Some(h);
    }
    hashes
}

/// Hashes of the full prompt blocks of a request.
pub fn prompt_block_hashes(
    request_id: RequestId,
    prefix: Option<SharedPrefix>,
    input_tokens: u32,
    block_size: u32,
) -> Vec<u64> {
    if block_size == 0 {
        return Vec::new();
    }
    block_hashes(request_id, prefix, input_tokens / block_size, block_size)
}
