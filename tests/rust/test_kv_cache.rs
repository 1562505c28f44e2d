/// Integration tests for the KV cache manager.
use blis_core::kv_cache::{KvCacheError, KvCacheManager, PrefixMatch};
use blis_core::kv_tier::CpuTierConfig;
use blis_core::request::Request;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Allocate a request's whole prompt, attaching any resident prefix.
fn admit(cache: &mut KvCacheManager, req: &Request) -> Result<u32, KvCacheError> {
    let m = cache.lookup_prefix(req);
    let start = m.cached_tokens(cache.block_size());
    cache.allocate(req, start, req.input_tokens, &m)?;
    Ok(req.input_tokens)
}

#[test]
fn test_cache_lifecycle() {
    let mut cache = KvCacheManager::new(0, 1000, 16);

    for i in 0..10 {
        let req = Request::new(i, 0, 256, 16).with_prefix(i % 3, 128);
        admit(&mut cache, &req).unwrap();
    }
    assert!(cache.utilization() > 0.0);
    // 3 groups share 8 prefix blocks; each request adds 8 private ones
    assert_eq!(cache.used_blocks(), 3 * 8 + 10 * 8);

    for i in 0..10 {
        cache.release(i).unwrap();
    }
    assert_eq!(cache.used_blocks(), 0);
    assert_eq!(cache.free_blocks(), 1000);
    assert!(cache.cached_blocks() > 0);
    cache.check_conservation().unwrap();
}

#[test]
fn test_cache_prefix_reuse() {
    let mut cache = KvCacheManager::new(0, 500, 16);

    let r1 = Request::new(1, 0, 256, 8).with_prefix(0xABC, 128);
    let m = cache.lookup_prefix(&r1);
    assert!(m.is_empty());
    assert_eq!(m.prompt_blocks, 16);
    admit(&mut cache, &r1).unwrap();
    cache.release(1).unwrap();

    let r2 = Request::new(2, 0, 256, 8).with_prefix(0xABC, 128);
    let m = cache.lookup_prefix(&r2);
    assert_eq!(m.len(), 8);
    let alloc = cache.allocate(&r2, 128, 256, &m).unwrap();
    assert_eq!(alloc.cached_blocks, 8);
    assert_eq!(alloc.new_blocks, 8);
    assert!(cache.hit_rate() > 0.0);
}

#[test]
fn test_cache_eviction_under_pressure() {
    let mut cache = KvCacheManager::new(0, 20, 16);

    // Five groups of 4 full blocks each fill the cache with cached blocks.
    for i in 0..5 {
        let req = Request::new(i, 0, 64, 1).with_prefix(i, 64);
        admit(&mut cache, &req).unwrap();
        cache.release(i).unwrap();
    }
    assert_eq!(cache.cached_blocks(), 20);

    let req = Request::new(100, 0, 64, 1).with_prefix(100, 64);
    let alloc = cache.allocate(&req, 0, 64, &PrefixMatch::default()).unwrap();
    assert_eq!(alloc.evicted_blocks, 4);
    assert_eq!(cache.stats().evictions, 4);
    cache.check_conservation().unwrap();
}

#[test]
fn test_last_block_goes_to_first_caller() {
    let mut cache = KvCacheManager::new(0, 5, 16);
    let a = Request::new(0, 0, 32, 8);
    let b = Request::new(1, 0, 32, 8);
    admit(&mut cache, &a).unwrap();
    admit(&mut cache, &b).unwrap();
    assert_eq!(cache.free_blocks(), 1);

    cache.allocate(&a, 32, 33, &PrefixMatch::default()).unwrap();
    let err = cache.allocate(&b, 32, 33, &PrefixMatch::default()).unwrap_err();
    assert_eq!(
        err,
        KvCacheError::Exhausted {
            needed: 1,
            available: 0
        }
    );
    // the loser still holds what it had
    assert_eq!(cache.held_blocks(1).len(), 2);
}

#[test]
fn test_cache_utilization_tracking() {
    let mut cache = KvCacheManager::new(0, 100, 16);
    assert_eq!(cache.utilization(), 0.0);

    admit(&mut cache, &Request::new(1, 0, 160, 1)).unwrap();
    assert!((cache.utilization() - 0.1).abs() < 1e-9);

    admit(&mut cache, &Request::new(2, 0, 160, 1)).unwrap();
    assert!((cache.utilization() - 0.2).abs() < 1e-9);

    cache.release(1).unwrap();
    assert!((cache.utilization() - 0.1).abs() < 1e-9);
}

/// Random allocate / extend / release traffic never breaks conservation.
fn stress(mut cache: KvCacheManager, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut live: Vec<(Request, u32)> = Vec::new();
    let mut next_id = 0u64;

    for step in 0..2_000u64 {
        cache.set_clock(step * 10);
        match rng.gen_range(0..3) {
            0 => {
                let input = rng.gen_range(1..=120);
                let mut req = Request::new(next_id, 0, input, 8);
                if rng.gen_bool(0.5) {
                    req = req.with_prefix(rng.gen_range(0..4), 48);
                }
                next_id += 1;
                match admit(&mut cache, &req) {
                    Ok(end) => live.push((req, end)),
                    Err(KvCacheError::Exhausted { .. }) => {
                        assert!(cache.held_blocks(req.id).is_empty());
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            1 if !live.is_empty() => {
                let idx = rng.gen_range(0..live.len());
                let (req, end) = &mut live[idx];
                match cache.allocate(req, *end, *end + 1, &PrefixMatch::default()) {
                    Ok(_) => *end += 1,
                    Err(KvCacheError::Exhausted { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            _ if !live.is_empty() => {
                let idx = rng.gen_range(0..live.len());
                let (req, _) = live.swap_remove(idx);
                cache.release(req.id).unwrap();
            }
            _ => {}
        }
        cache.check_conservation().unwrap();
        assert!(cache.used_blocks() <= cache.total_blocks());
        for (req, _) in &live {
            for &block in cache.held_blocks(req.id) {
                assert!(cache.refcount(block).unwrap_or(0) > 0);
            }
        }
    }

    for (req, _) in live {
        cache.release(req.id).unwrap();
    }
    assert_eq!(cache.used_blocks(), 0);
    cache.check_conservation().unwrap();
}

#[test]
fn test_conservation_under_random_traffic() {
    stress(KvCacheManager::new(0, 64, 16), 42);
}

#[test]
fn test_conservation_with_cpu_tier() {
    let tier = CpuTierConfig {
        blocks: 32,
        bandwidth: 8.0,
        base_latency: 5,
        thrash_window: 200,
    };
    stress(KvCacheManager::new(0, 48, 16).with_cpu_tier(&tier), 7);
}
