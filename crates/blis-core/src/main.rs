//! BLIS CLI: simulate LLM inference clusters without GPUs.

use blis_core::config::SimConfig;
use blis_core::decision::DecisionTrace;
use blis_core::metrics::{self, SimulationMetrics};
use blis_core::rng::PartitionedRng;
use blis_core::workload::{self, WorkloadConfig};
use blis_core::{ClusterSimulator, Request};
use blis_policies::RoutingConfig;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "blis",
    about = "Simulate LLM inference clusters and compare serving policies without GPUs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation.
    Run {
        /// Path to TOML configuration file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Replay this compact JSONL trace instead of the configured workload.
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Override the routing policy by name.
        #[arg(short, long)]
        routing: Option<String>,
        /// Override the master seed.
        #[arg(short, long)]
        seed: Option<u64>,
        /// Output metrics to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the decision trace as JSONL.
        #[arg(short, long)]
        decisions: Option<PathBuf>,
    },
    /// Compare routing policies on the same workload.
    Compare {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Replay this compact JSONL trace instead of the configured workload.
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Comma-separated routing policy names. Defaults to every policy
        /// compatible with the cluster.
        #[arg(short = 'R', long, value_delimiter = ',')]
        routing: Vec<String>,
        /// Output results to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a synthetic workload as a compact JSONL trace.
    GenWorkload {
        /// Take generator parameters from this configuration's [workload].
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Request rate (requests/sec).
        #[arg(long)]
        rate: Option<f64>,
        /// Number of requests.
        #[arg(short = 'n', long)]
        num_requests: Option<u64>,
        /// Mean prompt tokens.
        #[arg(long)]
        input_mean: Option<f64>,
        /// Mean output tokens.
        #[arg(long)]
        output_mean: Option<f64>,
        /// Number of shared-prefix groups.
        #[arg(long)]
        prefix_groups: Option<u32>,
        /// Master seed.
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List available policy templates.
    ListPolicies,
}

/// Print `what: err` and exit with status 1 on error.
fn or_exit<T, E: Display>(result: Result<T, E>, what: &str) -> T {
    result.unwrap_or_else(|e| {
        eprintln!("Error {}: {}", what, e);
        std::process::exit(1);
    })
}

fn load_config(path: Option<&Path>) -> SimConfig {
    match path {
        Some(p) => or_exit(SimConfig::from_file(p), "loading config"),
        None => SimConfig::default(),
    }
}

/// Requests for a run: the trace if given, else the configured workload.
fn load_requests(config: &SimConfig, trace: Option<&Path>) -> Vec<Request> {
    match trace {
        Some(p) => or_exit(workload::load_trace(p), "loading trace"),
        None => {
            let mut rng = PartitionedRng::new(config.simulation.seed);
            or_exit(
                workload::load_workload(&config.workload, &mut rng),
                "loading workload",
            )
        }
    }
}

fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) {
    let json = or_exit(serde_json::to_string_pretty(value), "serializing results");
    or_exit(std::fs::write(path, json), "writing output");
    println!("Results written to {}", path.display());
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            trace,
            routing,
            seed,
            output,
            decisions,
        } => {
            let mut sim_config = load_config(config.as_deref());
            if let Some(seed) = seed {
                sim_config.simulation.seed = seed;
            }
            if let Some(name) = routing {
                let routing = RoutingConfig::by_name(&name).unwrap_or_else(|| {
                    eprintln!(
                        "Unknown routing policy: {}. Available: {:?}",
                        name,
                        blis_policies::available_routing()
                    );
                    std::process::exit(1);
                });
                sim_config = sim_config.with_routing(routing);
            }
            let requests = load_requests(&sim_config, trace.as_deref());

            let top_k = if sim_config.trace.enabled || decisions.is_some() {
                sim_config.trace.top_k
            } else {
                0
            };
            let mut sim = or_exit(
                ClusterSimulator::with_sink(&sim_config, DecisionTrace::new(top_k)),
                "building cluster",
            );
            or_exit(sim.inject_all(requests), "injecting workload");
            let result = or_exit(sim.run(), "running simulation");
            println!("{}", metrics::format_table(&result));

            let trace = sim.into_sink();
            if sim_config.trace.enabled || decisions.is_some() {
                let summary = trace.summarize();
                println!(
                    "Decisions: {} admitted, {} rejected, mean regret {:.4}, max regret {:.4}",
                    summary.admitted, summary.rejected, summary.mean_regret, summary.max_regret
                );
            }
            if let Some(path) = decisions {
                let file = or_exit(std::fs::File::create(&path), "creating decision trace");
                or_exit(
                    trace.write_jsonl(std::io::BufWriter::new(file)),
                    "writing decision trace",
                );
                println!("Decision trace written to {}", path.display());
            }
            if let Some(path) = output {
                write_json(&result, &path);
            }
        }
        Commands::Compare {
            config,
            trace,
            routing,
            output,
        } => {
            let sim_config = load_config(config.as_deref());
            let requests = load_requests(&sim_config, trace.as_deref());
            let names: Vec<&str> = if routing.is_empty() {
                blis_policies::available_routing()
                    .into_iter()
                    .filter(|name| {
                        RoutingConfig::by_name(name).is_some_and(|r| {
                            r.is_disaggregated() == sim_config.cluster.disaggregated.enabled
                        })
                    })
                    .collect()
            } else {
                routing.iter().map(String::as_str).collect()
            };

            let results: Vec<SimulationMetrics> = or_exit(
                blis_core::compare_routing(&sim_config, &requests, &names),
                "comparing routing policies",
            );
            println!("{}", metrics::format_comparison_table(&results));
            for result in &results {
                println!("{}", metrics::format_table(result));
            }
            if let Some(path) = output {
                write_json(&results, &path);
            }
        }
        Commands::GenWorkload {
            config,
            rate,
            num_requests,
            input_mean,
            output_mean,
            prefix_groups,
            seed,
            output,
        } => {
            let mut wl = match config {
                Some(p) => load_config(Some(&p)).workload,
                None => WorkloadConfig::default(),
            };
            wl.trace = None;
            if let Some(v) = rate {
                wl.rate = v;
            }
            if let Some(v) = num_requests {
                wl.num_requests = v;
            }
            if let Some(v) = input_mean {
                wl.input_mean = v;
            }
            if let Some(v) = output_mean {
                wl.output_mean = v;
            }
            if let Some(v) = prefix_groups {
                wl.prefix_groups = v;
            }
            if let Some(problem) = wl.problem() {
                eprintln!("Error in workload parameters: {}", problem);
                std::process::exit(1);
            }

            let mut rng = PartitionedRng::new(seed);
            let requests = workload::generate(&wl, &mut rng);
            or_exit(workload::write_trace_file(&requests, &output), "writing trace");
            println!(
                "Generated {} requests to {}",
                requests.len(),
                output.display()
            );
        }
        Commands::ListPolicies => {
            println!("Admission: always-admit, token-bucket, reject-all");
            println!("Priority:  constant, slo-based, inverted-slo");
            println!("Scheduler: fcfs, priority-fcfs, sjf, reverse-priority");
            println!("Routing:");
            for name in blis_policies::available_routing() {
                println!("  - {}", name);
            }
        }
    }
}
