/// Integration tests for policy templates in a simulation context.
use blis_core::config::SimConfig;
use blis_core::decision::{DecisionRecord, DecisionTrace};
use blis_core::request::Request;
use blis_core::{ClusterSimulator, ConfigError, SimError};
use blis_policies::{InstanceId, RoutingConfig};
use std::collections::HashMap;

fn small_config(routing: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "policy-test"
seed = 42

[cluster]
instances = 4
kv_blocks = 4096
block_size = 16

[policies.routing]
name = "{}"
"#,
        routing
    ))
    .unwrap()
}

fn uniform_requests(n: u64) -> Vec<Request> {
    (0..n).map(|i| Request::new(i, i * 10_000, 256, 64)).collect()
}

/// Chosen instance per request, from the decision trace.
fn routed(config: &SimConfig, requests: Vec<Request>) -> HashMap<u64, InstanceId> {
    let mut sim = ClusterSimulator::with_sink(config, DecisionTrace::new(0)).unwrap();
    sim.inject_all(requests).unwrap();
    sim.run().unwrap();
    sim.sink()
        .records()
        .iter()
        .filter_map(|r| match r {
            DecisionRecord::Routing {
                request, chosen, ..
            } => Some((*request, *chosen)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_round_robin_fairness() {
    let m = blis_core::run_with_requests(&small_config("round-robin"), uniform_requests(100))
        .unwrap();
    assert_eq!(m.per_instance_completed, vec![25, 25, 25, 25]);
    assert!(
        m.jains_fairness_index > 0.99,
        "Fairness too low: {}",
        m.jains_fairness_index
    );
}

#[test]
fn test_random_routing_replays_with_seed() {
    let config = small_config("random");
    let first = routed(&config, uniform_requests(200));
    let second = routed(&config, uniform_requests(200));
    assert_eq!(first.len(), 200);
    assert_eq!(first, second);

    let mut per_instance = [0u32; 4];
    for id in first.values() {
        per_instance[*id as usize] += 1;
    }
    assert!(per_instance.iter().all(|&c| c > 0), "{:?}", per_instance);

    let mut reseeded = config.clone();
    reseeded.simulation.seed = 43;
    assert_ne!(routed(&reseeded, uniform_requests(200)), first);
}

#[test]
fn test_always_busiest_concentrates_load() {
    // Arrivals overlap so the busiest instance is always the one that just
    // received a request.
    let requests: Vec<Request> = (0..40).map(|i| Request::new(i, i * 100, 256, 64)).collect();
    let busiest =
        blis_core::run_with_requests(&small_config("always-busiest"), requests.clone()).unwrap();
    let balanced = blis_core::run_with_requests(&small_config("least-loaded"), requests).unwrap();

    assert_eq!(busiest.completed_requests, 40);
    assert!(busiest.load_cv > balanced.load_cv);
    assert!(busiest.jains_fairness_index < balanced.jains_fairness_index);
}

#[test]
fn test_prefix_affinity_keeps_groups_together() {
    let requests: Vec<Request> = (0..40)
        .map(|i| Request::new(i, i * 2_000, 512, 32).with_prefix(i % 5, 256))
        .collect();
    let chosen = routed(&small_config("prefix-affinity"), requests.clone());
    assert_eq!(chosen.len(), 40);

    let mut group_home: HashMap<u64, InstanceId> = HashMap::new();
    for req in &requests {
        let group = req.prefix.map(|p| p.group).unwrap();
        let home = *group_home.entry(group).or_insert(chosen[&req.id]);
        assert_eq!(chosen[&req.id], home, "group {} split across instances", group);
    }

    let m = blis_core::run_with_requests(&small_config("prefix-affinity"), requests).unwrap();
    assert!(m.cache_hit_rate > 0.0);
    assert!(m.custom_metrics["affinity_hits"] >= 35.0);
}

#[test]
fn test_weighted_prefix_scorer_improves_hit_rate() {
    let requests: Vec<Request> = (0..80)
        .map(|i| Request::new(i, i * 1_000, 512, 32).with_prefix(i % 5, 384))
        .collect();
    let mut prefix_heavy = small_config("weighted");
    prefix_heavy.policies.routing = RoutingConfig::Weighted {
        scorers: blis_policies::parse_scorers("prefix-affinity:10,load-balance:1").unwrap(),
    };
    let affinity = blis_core::run_with_requests(&prefix_heavy, requests.clone()).unwrap();
    let spread = blis_core::run_with_requests(&small_config("round-robin"), requests).unwrap();
    assert!(affinity.cache_hit_rate > spread.cache_hit_rate);
}

#[test]
fn test_sjf_serves_short_prompts_first() {
    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 1
max_running_requests = 1

[policies.scheduler]
name = "sjf"
"#,
    )
    .unwrap();
    config.latency = blis_core::LatencyConfig::Blackbox {
        alpha: vec![0.0, 0.0],
        beta: vec![100.0, 1.0, 10.0],
        scheduling_overhead: 0,
        preemption_overhead: 0,
    };

    // The first request occupies the instance while the rest queue up.
    let requests = vec![
        Request::new(0, 0, 64, 8),
        Request::new(1, 10, 1024, 8),
        Request::new(2, 20, 512, 8),
        Request::new(3, 30, 32, 8),
    ];
    let mut sim = ClusterSimulator::with_sink(&config, DecisionTrace::new(0)).unwrap();
    sim.inject_all(requests).unwrap();
    sim.run().unwrap();
    let order: Vec<u64> = sim
        .sink()
        .records()
        .iter()
        .filter_map(|r| match r {
            DecisionRecord::Completion { request, .. } => Some(*request),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![0, 3, 2, 1]);
}

#[test]
fn test_invalid_policy_parameters_rejected() {
    let bad_bucket = SimConfig::from_str(
        r#"
[policies.admission]
name = "token-bucket"
capacity = 0.0
refill_rate = 10.0
"#,
    );
    assert!(matches!(bad_bucket, Err(ConfigError::Policy(_))));

    let bad_weight = SimConfig::from_str(
        r#"
[policies.priority]
name = "slo-based"
age_weight = -1.0
"#,
    );
    assert!(matches!(bad_weight, Err(ConfigError::Policy(_))));

    let unknown = SimConfig::from_str(
        r#"
[policies.routing]
name = "coin-flip"
"#,
    );
    assert!(matches!(unknown, Err(ConfigError::Parse(_))));

    assert!(blis_policies::parse_scorers("queue-depth").is_err());
    assert!(blis_policies::parse_scorers("nope:1").is_err());
}

#[test]
fn test_pd_split_requires_disaggregated_cluster() {
    let err = SimConfig::from_str(
        r#"
[cluster]
instances = 2

[policies.routing]
name = "pd-split"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));

    let mut config = small_config("round-robin");
    config.policies.routing = RoutingConfig::PdSplit;
    assert!(matches!(
        ClusterSimulator::new(&config),
        Err(SimError::Config(ConfigError::Validation(_)))
    ));
}
