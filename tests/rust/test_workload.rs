/// Integration tests for workload generation and trace ingestion.
use blis_core::config::SimConfig;
use blis_core::request::Request;
use blis_core::workload::{self, WorkloadConfig, WorkloadError};
use blis_core::{ClusterSimulator, PartitionedRng, SimError};
use blis_policies::SloClass;

fn generator() -> WorkloadConfig {
    WorkloadConfig {
        rate: 50.0,
        num_requests: 300,
        prefix_groups: 4,
        tenants: 3,
        slo_classes: vec![SloClass::Critical, SloClass::Standard, SloClass::Batch],
        ..WorkloadConfig::default()
    }
}

fn tmp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("blis_{}_{}.jsonl", name, std::process::id()))
}

#[test]
fn test_generation_is_seed_stable() {
    let config = generator();
    let a = workload::generate(&config, &mut PartitionedRng::new(42));
    let b = workload::generate(&config, &mut PartitionedRng::new(42));
    let c = workload::generate(&config, &mut PartitionedRng::new(43));
    assert_eq!(a, b);
    assert_ne!(a, c);

    for (i, req) in a.iter().enumerate() {
        assert_eq!(req.id, i as u64);
        assert!(req.input_tokens >= 1);
    }
    for pair in a.windows(2) {
        assert!(pair[0].arrival_time <= pair[1].arrival_time);
    }
}

#[test]
fn test_write_and_read_trace() {
    let path = tmp_path("roundtrip");
    let requests = vec![
        Request::new(0, 0, 256, 64).with_prefix(0xABC, 128),
        Request::new(1, 100, 512, 128)
            .with_tenant(2)
            .with_slo(SloClass::Critical),
    ];
    workload::write_trace_file(&requests, &path).unwrap();
    let loaded = workload::load_trace(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].prefix.map(|p| (p.group, p.tokens)), Some((0xABC, 128)));
    assert_eq!(loaded[1].input_tokens, 512);
    assert_eq!(loaded[1].output_tokens, 128);
    assert_eq!(loaded[1].tenant_id, 2);
    assert_eq!(loaded[1].slo_class, SloClass::Critical);
}

#[test]
fn test_trace_sorted_and_renumbered() {
    let path = tmp_path("unsorted");
    std::fs::write(
        &path,
        "# captured trace\n\
         {\"ts\": 500, \"prompt_tokens\": 10, \"gen_tokens\": 2}\n\
         \n\
         {\"ts\": 100, \"prompt_tokens\": 20, \"gen_tokens\": 3}\n",
    )
    .unwrap();
    let loaded = workload::load_trace(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.len(), 2);
    assert_eq!((loaded[0].id, loaded[0].arrival_time, loaded[0].input_tokens), (0, 100, 20));
    assert_eq!((loaded[1].id, loaded[1].arrival_time, loaded[1].input_tokens), (1, 500, 10));
}

#[test]
fn test_malformed_trace_reports_line() {
    let path = tmp_path("malformed");
    std::fs::write(
        &path,
        "{\"ts\": 0, \"prompt_tokens\": 10, \"gen_tokens\": 2}\n{\"ts\": oops}\n",
    )
    .unwrap();
    let err = workload::load_trace(&path).unwrap_err();
    std::fs::remove_file(&path).ok();

    match err {
        WorkloadError::JsonParse { line, .. } => assert_eq!(line, 2),
        other => panic!("expected a parse error, got {other}"),
    }
}

#[test]
fn test_missing_trace_fails_the_run() {
    let mut config = SimConfig::default();
    config.workload.trace = Some(tmp_path("does_not_exist"));
    let err = blis_core::run_simulation(&config).unwrap_err();
    assert!(matches!(err, SimError::Workload(WorkloadError::Io(_))));
}

#[test]
fn test_configured_trace_drives_the_run() {
    let path = tmp_path("replay");
    let requests: Vec<Request> = (0..12).map(|i| Request::new(i, i * 3_000, 128, 16)).collect();
    workload::write_trace_file(&requests, &path).unwrap();

    let mut config = SimConfig::from_str(
        r#"
[cluster]
instances = 3

[policies.routing]
name = "least-loaded"
"#,
    )
    .unwrap();
    config.workload.trace = Some(path.clone());
    let from_trace = blis_core::run_simulation(&config).unwrap();
    std::fs::remove_file(&path).ok();

    let direct = blis_core::run_with_requests(&config, requests).unwrap();
    assert_eq!(from_trace.injected_requests, 12);
    assert_eq!(from_trace.completed_requests, 12);
    assert_eq!(
        serde_json::to_string(&from_trace).unwrap(),
        serde_json::to_string(&direct).unwrap()
    );
}

#[test]
fn test_synthetic_run_matches_manual_injection() {
    let mut config = SimConfig::default();
    config.cluster.instances = 2;
    config.workload = WorkloadConfig {
        num_requests: 50,
        ..generator()
    };
    let via_config = blis_core::run_simulation(&config).unwrap();

    let mut sim = ClusterSimulator::new(&config).unwrap();
    let requests = workload::generate(&config.workload, sim.rng_mut());
    sim.inject_all(requests).unwrap();
    let manual = sim.run().unwrap();

    assert_eq!(via_config.completed_requests, 50);
    assert_eq!(
        serde_json::to_string(&via_config).unwrap(),
        serde_json::to_string(&manual).unwrap()
    );
}
