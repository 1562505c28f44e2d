/// Integration tests for the cluster orchestrator.
use blis_core::config::SimConfig;
use blis_core::decision::{DecisionRecord, DecisionTrace};
use blis_core::request::Request;
use blis_core::{ClusterSimulator, LoggedEvent, SimulationMetrics};
use blis_policies::{InstanceId, RequestId, SloClass, Tick};

fn production_config() -> SimConfig {
    SimConfig::from_str(
        r#"
[simulation]
name = "integration-test"
seed = 42

[cluster]
instances = 4
kv_blocks = 2048
block_size = 16
max_running_requests = 32
max_scheduled_tokens = 4096

[policies.routing]
name = "weighted"

[policies.priority]
name = "slo-based"

[policies.scheduler]
name = "priority-fcfs"

[workload]
rate = 200.0
num_requests = 200
input_mean = 512.0
input_std = 256.0
output_mean = 64.0
output_std = 32.0
prefix_groups = 5
prefix_tokens = 256
slo_classes = ["critical", "standard", "batch"]
"#,
    )
    .unwrap()
}

/// Small fixed-latency model: step = 100 + prefill + 10 * decode tokens.
fn simple_latency(config: &mut SimConfig) {
    config.latency = blis_core::LatencyConfig::Blackbox {
        alpha: vec![0.0, 0.0],
        beta: vec![100.0, 1.0, 10.0],
        scheduling_overhead: 0,
        preemption_overhead: 0,
    };
}

fn run_logged(config: &SimConfig) -> (Vec<LoggedEvent>, SimulationMetrics) {
    let mut sim = ClusterSimulator::new(config).unwrap().with_event_log();
    let requests = blis_core::workload::load_workload(&config.workload, sim.rng_mut()).unwrap();
    sim.inject_all(requests).unwrap();
    let metrics = sim.run().unwrap();
    (sim.event_log().to_vec(), metrics)
}

fn completions(trace: &DecisionTrace) -> Vec<(RequestId, InstanceId, Option<Tick>, Tick, Tick)> {
    trace
        .records()
        .iter()
        .filter_map(|r| match r {
            DecisionRecord::Completion {
                request,
                clock,
                instance,
                ttft,
                e2e,
            } => Some((*request, *instance, *ttft, *e2e, *clock)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_identical_seed_identical_run() {
    let config = production_config();
    let (log_a, metrics_a) = run_logged(&config);
    let (log_b, metrics_b) = run_logged(&config);
    assert!(!log_a.is_empty());
    assert_eq!(log_a, log_b);
    assert_eq!(
        serde_json::to_string(&metrics_a).unwrap(),
        serde_json::to_string(&metrics_b).unwrap()
    );
    assert_eq!(metrics_a.completed_requests, 200);
}

#[test]
fn test_different_seed_different_workload() {
    let config = production_config();
    let mut other = config.clone();
    other.simulation.seed = 7;
    let (log_a, _) = run_logged(&config);
    let (log_b, _) = run_logged(&other);
    assert_ne!(log_a, log_b);
}

#[test]
fn test_event_order_is_monotone() {
    let (log, _) = run_logged(&production_config());
    let priority = |kind: &str| match kind {
        "ClusterArrival" => 0,
        "Admission" => 1,
        "Routing" => 2,
        "InstanceArrival" => 3,
        "KvTransferComplete" => 4,
        "StepComplete" => 5,
        "Step" => 6,
        _ => 7,
    };
    for pair in log.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(a.time <= b.time, "time went backwards: {:?} -> {:?}", a, b);
        if a.time == b.time && priority(&a.kind) == priority(&b.kind) {
            assert!(a.seq < b.seq, "equal events out of order: {:?} -> {:?}", a, b);
        }
    }
}

#[test]
fn test_every_request_accounted_for_at_horizon() {
    let mut config = production_config();
    config.cluster.kv_blocks = 512;
    config.simulation.horizon = Some(400_000);
    let (_, m) = run_logged(&config);
    assert_eq!(m.injected_requests, 200);
    assert!(m.completed_requests < 200);
    assert_eq!(
        m.completed_requests
            + m.rejected_requests
            + m.still_queued
            + m.still_running
            + m.still_in_transit,
        m.injected_requests
    );
}

#[test]
fn test_every_request_terminal_without_horizon() {
    let mut config = production_config();
    config.cluster.kv_blocks = 300;
    let (_, m) = run_logged(&config);
    assert_eq!(m.completed_requests + m.rejected_requests, 200);
    assert_eq!(m.still_queued + m.still_running + m.still_in_transit, 0);
}

#[test]
fn test_reject_all_rejects_everything() {
    let mut config = production_config();
    config.policies.admission = blis_policies::AdmissionConfig::RejectAll;
    let (_, m) = run_logged(&config);
    assert_eq!(m.rejected_requests, 200);
    assert_eq!(m.rejected_at_admission, 200);
    assert_eq!(m.completed_requests, 0);
}

#[test]
fn test_inverted_slo_produces_inversions() {
    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 1
kv_blocks = 256
max_running_requests = 1

[policies.priority]
name = "inverted-slo"

[policies.scheduler]
name = "priority-fcfs"
"#,
    )
    .unwrap();
    simple_latency(&mut config);

    // Arrivals outpace service two to one, so the newest request always
    // jumps the queue and older ones starve.
    let requests: Vec<Request> = (0..20)
        .map(|i| {
            let class = if i < 10 {
                SloClass::Critical
            } else {
                SloClass::Standard
            };
            Request::new(i, i * 900, 64, 16).with_slo(class)
        })
        .collect();
    let m = blis_core::run_with_requests(&config, requests.clone()).unwrap();
    assert_eq!(m.completed_requests, 20);
    assert!(m.priority_inversions > 0);

    let mut fair = config.clone();
    fair.policies.priority = blis_policies::PriorityConfig::SloBased {
        base: 0.0,
        age_weight: 1e-6,
    };
    let m = blis_core::run_with_requests(&fair, requests).unwrap();
    assert_eq!(m.priority_inversions, 0);
}

#[test]
fn test_single_request_scenario() {
    let config = SimConfig::from_str(
        r#"
[simulation]
seed = 42

[cluster]
instances = 1
kv_blocks = 800
block_size = 16
"#,
    )
    .unwrap();

    let run = || {
        let mut sim = ClusterSimulator::with_sink(&config, DecisionTrace::new(1)).unwrap();
        sim.inject_arrival(Request::new(0, 0, 512, 8)).unwrap();
        let metrics = sim.run().unwrap();
        (sim.now(), metrics, completions(sim.sink()))
    };
    let (end, metrics, done) = run();

    // queueing 1500 + 2 * 512, prefill 6000 + 15 * 512, then 7 decode
    // steps of 6000 + 80
    assert_eq!(done, vec![(0, 0, Some(16_204), 58_764, 58_764)]);
    assert_eq!(end, 58_764);
    assert!((metrics.ttft.p50 - 16.204).abs() < 1e-9);
    assert!((metrics.itl.mean - 6.08).abs() < 1e-9);

    let (end_again, metrics_again, done_again) = run();
    assert_eq!(end_again, end);
    assert_eq!(done_again, done);
    assert_eq!(
        serde_json::to_string(&metrics_again).unwrap(),
        serde_json::to_string(&metrics).unwrap()
    );
}

#[test]
fn test_zero_output_and_empty_prompt_requests() {
    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 1
kv_blocks = 64
block_size = 16
"#,
    )
    .unwrap();
    simple_latency(&mut config);

    let mut sim = ClusterSimulator::with_sink(&config, DecisionTrace::new(0)).unwrap();
    sim.inject_arrival(Request::new(0, 0, 64, 0)).unwrap();
    sim.inject_arrival(Request::new(1, 0, 0, 8)).unwrap();
    let m = sim.run().unwrap();

    assert_eq!(m.completed_requests, 1);
    assert_eq!(m.rejected_at_instance, 1);
    let done = completions(sim.sink());
    assert_eq!(done.len(), 1);
    let (request, _, ttft, e2e, _) = done[0];
    assert_eq!(request, 0);
    // the single token comes out of the prefill step
    assert_eq!(ttft, Some(e2e));
    assert_eq!(m.itl.max, 0.0);
}

#[test]
fn test_last_block_contention_lower_id_wins() {
    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 1
kv_blocks = 5
block_size = 16
"#,
    )
    .unwrap();
    simple_latency(&mut config);

    let mut sim = ClusterSimulator::with_sink(&config, DecisionTrace::new(0)).unwrap();
    // Each needs 4 blocks at its peak; together they fit only until the
    // first decode token crosses into a third block.
    sim.inject_arrival(Request::new(0, 0, 32, 17)).unwrap();
    sim.inject_arrival(Request::new(1, 0, 32, 17)).unwrap();
    let m = sim.run().unwrap();

    assert_eq!(m.completed_requests, 2);
    assert_eq!(m.rejected_requests, 0);
    assert!(m.preemptions >= 1);
    let order: Vec<RequestId> = completions(sim.sink()).iter().map(|c| c.0).collect();
    assert_eq!(order, vec![0, 1]);
}

#[test]
fn test_prefill_decode_handoff_timing() {
    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 2
kv_blocks = 256

[cluster.disaggregated]
enabled = true
prefill_instances = 1
decode_instances = 1

[policies.routing]
name = "pd-split"
"#,
    )
    .unwrap();
    simple_latency(&mut config);

    let mut sim = ClusterSimulator::with_sink(&config, DecisionTrace::new(2)).unwrap();
    sim.inject_arrival(Request::new(0, 0, 64, 4)).unwrap();
    let m = sim.run().unwrap();
    assert_eq!(m.completed_requests, 1);

    // prefill ends at 164; 4 blocks of 16 tokens at 327,680 bytes per token
    // over 50 GB/s is 420 ticks on top of the 500 base; then 3 decode steps
    let done = completions(sim.sink());
    assert_eq!(done, vec![(0, 1, Some(164), 1_414, 1_414)]);
    assert_eq!(sim.instances()[0].stats.handoffs, 1);
    assert_eq!(sim.instances()[1].stats.completed, 1);

    let routed = sim.sink().records().iter().find_map(|r| match r {
        DecisionRecord::Routing { chosen, decode, .. } => Some((*chosen, *decode)),
        _ => None,
    });
    assert_eq!(routed, Some((0, Some(1))));
}

#[test]
fn test_token_bucket_delays_instead_of_dropping() {
    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 2

[policies.admission]
name = "token-bucket"
capacity = 1000.0
refill_rate = 100000.0
delay_when_empty = true
"#,
    )
    .unwrap();
    simple_latency(&mut config);

    let requests: Vec<Request> = (0..10).map(|i| Request::new(i, 0, 500, 4)).collect();
    let m = blis_core::run_with_requests(&config, requests).unwrap();
    assert_eq!(m.completed_requests, 10);
    assert_eq!(m.rejected_requests, 0);
    assert!(m.admission_delays > 0);
}

#[test]
fn test_compare_routing_runs_each_policy() {
    let config = production_config();
    let mut sim = ClusterSimulator::new(&config).unwrap();
    let requests = blis_core::workload::load_workload(&config.workload, sim.rng_mut()).unwrap();
    let results = blis_core::compare_routing(
        &config,
        &requests,
        &["round-robin", "least-loaded", "prefix-affinity"],
    )
    .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].label, "round-robin");
    assert!(results.iter().all(|r| r.completed_requests == 200));
    assert!(blis_core::compare_routing(&config, &requests, &["nope"]).is_err());
}
