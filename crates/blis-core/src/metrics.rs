//! Metrics collection and aggregation for simulation runs.
//!
//! Tracks per-request latency (TTFT, ITL, end-to-end, queue wait), throughput,
//! KV cache statistics, load fairness, and the anomalies a run exhibits:
//! priority inversions, head-of-line blocking and invalid routing decisions.

use crate::clock::{ticks_to_ms, TICKS_PER_SEC};
use crate::instance::Instance;
use crate::kv_cache::KvCacheStats;
use crate::request::Request;
use blis_policies::{InstanceId, RequestId, SloClass, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An earlier request slower than this multiple of the next one in its SLO
/// class counts as a priority inversion.
const INVERSION_FACTOR: f64 = 2.0;
/// An instance whose mean queue depth exceeds this multiple of the cluster
/// mean is reported as head-of-line blocked.
const HOL_FACTOR: f64 = 2.0;

/// Per-request completion record. Times are in ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub instance: InstanceId,
    pub arrival_time: Tick,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub slo_class: SloClass,
    pub tenant_id: u32,
    /// Time on the instance wait queue before first being scheduled.
    pub queue_wait: Tick,
    /// Arrival to first being scheduled, pipeline latencies included.
    pub scheduling_delay: Tick,
    pub ttft: Tick,
    pub e2e: Tick,
    pub itls: Vec<Tick>,
    pub preemptions: u32,
    pub cache_hit_blocks: u32,
    pub cache_miss_blocks: u32,
}

impl RequestRecord {
    /// Record for a completed request; `None` if it never completed.
    pub fn from_request(request: &Request) -> Option<Self> {
        let e2e = request.e2e()?;
        let first_scheduled = request.timing.first_scheduled.unwrap_or(request.arrival_time);
        Some(Self {
            request_id: request.id,
            instance: request.instance.unwrap_or_default(),
            arrival_time: request.arrival_time,
            input_tokens: request.input_tokens,
            output_tokens: request.output_tokens,
            slo_class: request.slo_class,
            tenant_id: request.tenant_id,
            queue_wait: request.queue_wait().unwrap_or(0),
            scheduling_delay: first_scheduled.saturating_sub(request.arrival_time),
            ttft: request.ttft().unwrap_or(e2e),
            e2e,
            itls: request.timing.itls.clone(),
            preemptions: request.preemptions,
            cache_hit_blocks: request.cache_hit_blocks,
            cache_miss_blocks: request.cache_miss_blocks,
        })
    }

    /// Average inter-token latency in milliseconds.
    pub fn avg_itl_ms(&self) -> f64 {
        if self.itls.is_empty() {
            return 0.0;
        }
        ticks_to_ms(self.itls.iter().sum()) / self.itls.len() as f64
    }
}

/// Unexpected behavior detected during or after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Anomaly {
    PriorityInversion {
        slo_class: SloClass,
        earlier: RequestId,
        later: RequestId,
        earlier_e2e: Tick,
        later_e2e: Tick,
    },
    HeadOfLineBlocking {
        instance: InstanceId,
        mean_queue_depth: f64,
        cluster_mean: f64,
    },
    InvalidRouting {
        request: RequestId,
        clock: Tick,
        reason: String,
    },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::PriorityInversion { .. } => "priority-inversion",
            Anomaly::HeadOfLineBlocking { .. } => "head-of-line-blocking",
            Anomaly::InvalidRouting { .. } => "invalid-routing",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Anomaly::PriorityInversion {
                slo_class,
                earlier,
                later,
                earlier_e2e,
                later_e2e,
            } => format!(
                "{:?}: request {} (e2e {}) finished far behind later request {} (e2e {})",
                slo_class, earlier, earlier_e2e, later, later_e2e
            ),
            Anomaly::HeadOfLineBlocking {
                instance,
                mean_queue_depth,
                cluster_mean,
            } => format!(
                "instance {} mean queue depth {:.2} vs cluster mean {:.2}",
                instance, mean_queue_depth, cluster_mean
            ),
            Anomaly::InvalidRouting { request, reason, .. } => {
                format!("request {}: {}", request, reason)
            }
        }
    }
}

/// Percentile values for a distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p75: percentile_sorted(&sorted, 75.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
        }
    }

    /// Percentiles of tick values, reported in milliseconds.
    pub fn from_ticks(values: impl IntoIterator<Item = Tick>) -> Self {
        let ms: Vec<f64> = values.into_iter().map(ticks_to_ms).collect();
        Self::from_values(&ms)
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Aggregated metrics for an entire simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationMetrics {
    /// Label of the run, usually the routing policy name.
    pub label: String,
    /// First arrival to last completion, in ms.
    pub duration_ms: f64,
    pub injected_requests: u64,
    pub completed_requests: u64,
    pub rejected_requests: u64,
    pub rejected_at_admission: u64,
    pub rejected_at_routing: u64,
    pub rejected_at_instance: u64,
    /// Admission delays issued (a request may be delayed more than once).
    pub admission_delays: u64,
    /// Requests still on a wait queue or in a batch at the horizon.
    pub still_queued: u64,
    pub still_running: u64,
    /// Requests between pipeline stages at the horizon.
    pub still_in_transit: u64,

    // Latency (ms)
    pub ttft: Percentiles,
    pub itl: Percentiles,
    pub end_to_end_latency: Percentiles,
    pub queue_wait: Percentiles,
    pub scheduling_delay: Percentiles,

    // Throughput
    pub requests_per_sec: f64,
    pub input_tokens_per_sec: f64,
    pub output_tokens_per_sec: f64,
    pub total_tokens_per_sec: f64,

    // Scheduling
    pub preemptions: u64,
    pub steps: u64,

    // Cache
    pub cache_hit_rate: f64,
    pub kv_thrash_rate: f64,
    pub per_instance_cache_stats: Vec<KvCacheStats>,

    // Fairness
    pub per_instance_completed: Vec<u64>,
    pub load_cv: f64,
    pub jains_fairness_index: f64,

    pub priority_inversions: u64,
    pub hol_blocked_instances: Vec<InstanceId>,
    pub anomalies: Vec<Anomaly>,

    pub custom_metrics: BTreeMap<String, f64>,
}

/// Inputs to [`MetricsCollector::aggregate`] that come from the run rather
/// than from recorded requests.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub label: String,
    pub injected: u64,
    /// Requests between pipeline stages when the run stopped.
    pub in_transit: u64,
    /// Skip inversion detection (constant priority makes it meaningless).
    pub skip_inversions: bool,
    pub custom_metrics: BTreeMap<String, f64>,
}

/// Collector that accumulates per-request metrics during simulation.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    /// Completion records in completion order.
    records: Vec<RequestRecord>,
    /// Number of completions to discard at the start (warmup).
    warmup_count: u64,
    rejected_admission: u64,
    rejected_routing: u64,
    rejected_instance: u64,
    delays: u64,
    invalid_routing: Vec<Anomaly>,
}

impl MetricsCollector {
    pub fn new(warmup_count: u64) -> Self {
        Self {
            warmup_count,
            ..Default::default()
        }
    }

    /// Record a completed request.
    pub fn record_completion(&mut self, request: &Request) {
        match RequestRecord::from_request(request) {
            Some(record) => self.records.push(record),
            None => tracing::warn!(request = request.id, "completion without completion time"),
        }
    }

    pub fn record_admission_rejection(&mut self) {
        self.rejected_admission += 1;
    }

    pub fn record_routing_rejection(&mut self) {
        self.rejected_routing += 1;
    }

    pub fn record_instance_rejection(&mut self) {
        self.rejected_instance += 1;
    }

    pub fn record_delay(&mut self) {
        self.delays += 1;
    }

    pub fn record_invalid_routing(&mut self, request: RequestId, clock: Tick, reason: String) {
        self.invalid_routing.push(Anomaly::InvalidRouting {
            request,
            clock,
            reason,
        });
    }

    pub fn completed_count(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_admission + self.rejected_routing + self.rejected_instance
    }

    /// Post-warmup completion records.
    pub fn records(&self) -> &[RequestRecord] {
        let skip = self.warmup_count as usize;
        if skip >= self.records.len() {
            return &[];
        }
        &self.records[skip..]
    }

    /// Aggregate everything into a summary.
    pub fn aggregate(&self, ctx: RunContext, instances: &[Instance]) -> SimulationMetrics {
        let records = self.records();
        if records.is_empty() && !self.records.is_empty() {
            tracing::warn!(
                warmup = self.warmup_count,
                completed = self.records.len(),
                "warmup covers every completion, latency metrics will be zero"
            );
        }

        let first = records.iter().map(|r| r.arrival_time).min().unwrap_or(0);
        let last = records
            .iter()
            .map(|r| r.arrival_time + r.e2e)
            .max()
            .unwrap_or(0);
        let duration = last.saturating_sub(first);
        let duration_sec = duration as f64 / TICKS_PER_SEC as f64;
        let per_sec = |x: f64| if duration_sec > 0.0 { x / duration_sec } else { 0.0 };

        let completed = records.len() as u64;
        let input_tokens: u64 = records.iter().map(|r| r.input_tokens as u64).sum();
        let output_tokens: u64 = records.iter().map(|r| r.output_tokens as u64).sum();

        let hits: u64 = records.iter().map(|r| r.cache_hit_blocks as u64).sum();
        let misses: u64 = records.iter().map(|r| r.cache_miss_blocks as u64).sum();
        let cache_hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };

        let per_instance_cache_stats: Vec<KvCacheStats> =
            instances.iter().map(|i| i.kv_stats()).collect();
        let (reloads, thrashes) = per_instance_cache_stats
            .iter()
            .filter_map(|s| s.cpu.as_ref())
            .fold((0u64, 0u64), |(r, t), c| (r + c.reloads, t + c.thrashes));
        let kv_thrash_rate = if reloads > 0 {
            thrashes as f64 / reloads as f64
        } else {
            0.0
        };

        let per_instance_completed: Vec<u64> =
            instances.iter().map(|i| i.stats.completed).collect();
        let (still_queued, still_running) = instances
            .iter()
            .map(|i| i.in_flight_counts())
            .fold((0, 0), |(q, r), (iq, ir)| (q + iq, r + ir));

        let mut anomalies = Vec::new();
        if !ctx.skip_inversions {
            anomalies.extend(detect_priority_inversions(records));
        }
        let priority_inversions = anomalies.len() as u64;
        let hol = detect_hol_blocking(instances);
        let hol_blocked_instances = hol
            .iter()
            .filter_map(|a| match a {
                Anomaly::HeadOfLineBlocking { instance, .. } => Some(*instance),
                _ => None,
            })
            .collect();
        anomalies.extend(hol);
        anomalies.extend(self.invalid_routing.iter().cloned());

        SimulationMetrics {
            label: ctx.label,
            duration_ms: ticks_to_ms(duration),
            injected_requests: ctx.injected,
            completed_requests: completed,
            rejected_requests: self.rejected_count(),
            rejected_at_admission: self.rejected_admission,
            rejected_at_routing: self.rejected_routing,
            rejected_at_instance: self.rejected_instance,
            admission_delays: self.delays,
            still_queued,
            still_running,
            still_in_transit: ctx.in_transit,
            ttft: Percentiles::from_ticks(records.iter().map(|r| r.ttft)),
            itl: Percentiles::from_ticks(records.iter().flat_map(|r| r.itls.iter().copied())),
            end_to_end_latency: Percentiles::from_ticks(records.iter().map(|r| r.e2e)),
            queue_wait: Percentiles::from_ticks(records.iter().map(|r| r.queue_wait)),
            scheduling_delay: Percentiles::from_ticks(records.iter().map(|r| r.scheduling_delay)),
            requests_per_sec: per_sec(completed as f64),
            input_tokens_per_sec: per_sec(input_tokens as f64),
            output_tokens_per_sec: per_sec(output_tokens as f64),
            total_tokens_per_sec: per_sec((input_tokens + output_tokens) as f64),
            preemptions: instances.iter().map(|i| i.stats.preemptions).sum(),
            steps: instances.iter().map(|i| i.stats.steps).sum(),
            cache_hit_rate,
            kv_thrash_rate,
            per_instance_cache_stats,
            load_cv: coefficient_of_variation(&per_instance_completed),
            jains_fairness_index: jains_fairness_index(&per_instance_completed),
            per_instance_completed,
            priority_inversions,
            hol_blocked_instances,
            anomalies,
            custom_metrics: ctx.custom_metrics,
        }
    }
}

/// Adjacent requests of one SLO class, by arrival, where the earlier one took
/// more than twice as long as the later one.
pub fn detect_priority_inversions(records: &[RequestRecord]) -> Vec<Anomaly> {
    let mut by_class: BTreeMap<SloClass, Vec<&RequestRecord>> = BTreeMap::new();
    for record in records {
        by_class.entry(record.slo_class).or_default().push(record);
    }
    let mut found = Vec::new();
    for (class, mut group) in by_class {
        group.sort_by_key(|r| (r.arrival_time, r.request_id));
        for pair in group.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            if earlier.e2e as f64 > INVERSION_FACTOR * later.e2e as f64 {
                found.push(Anomaly::PriorityInversion {
                    slo_class: class,
                    earlier: earlier.request_id,
                    later: later.request_id,
                    earlier_e2e: earlier.e2e,
                    later_e2e: later.e2e,
                });
            }
        }
    }
    found
}

/// Instances whose mean sampled queue depth exceeds twice the cluster mean.
pub fn detect_hol_blocking(instances: &[Instance]) -> Vec<Anomaly> {
    if instances.len() < 2 {
        return Vec::new();
    }
    let depths: Vec<f64> = instances.iter().map(|i| i.stats.mean_queue_depth()).collect();
    let cluster_mean = depths.iter().sum::<f64>() / depths.len() as f64;
    if cluster_mean <= 0.0 {
        return Vec::new();
    }
    instances
        .iter()
        .zip(depths)
        .filter(|(_, depth)| *depth > HOL_FACTOR * cluster_mean)
        .map(|(inst, depth)| Anomaly::HeadOfLineBlocking {
            instance: inst.id,
            mean_queue_depth: depth,
            cluster_mean,
        })
        .collect()
}

/// Coefficient of variation (std / mean).
pub fn coefficient_of_variation(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<u64>() as f64 / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt() / mean
}

/// Jain's fairness index: (sum(x_i))^2 / (n * sum(x_i^2)).
pub fn jains_fairness_index(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let n = values.len() as f64;
    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    let sum_sq: f64 = values.iter().map(|&v| (v as f64).powi(2)).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum) / (n * sum_sq)
}

/// Format metrics as a pretty-printed table string.
pub fn format_table(metrics: &SimulationMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n{:=<70}\n", format!("  {} Results  ", metrics.label)));
    out.push_str(&format!(
        "  Duration: {:.1}s | Injected: {} | Completed: {} | Rejected: {}\n",
        metrics.duration_ms / 1000.0,
        metrics.injected_requests,
        metrics.completed_requests,
        metrics.rejected_requests
    ));
    if metrics.still_queued + metrics.still_running + metrics.still_in_transit > 0 {
        out.push_str(&format!(
            "  In flight at horizon: {} queued, {} running, {} in transit\n",
            metrics.still_queued, metrics.still_running, metrics.still_in_transit
        ));
    }
    out.push_str(&format!("{:-<70}\n", "  Latency  "));
    for (name, p) in [
        ("TTFT (ms)      ", &metrics.ttft),
        ("ITL (ms)       ", &metrics.itl),
        ("E2E (ms)       ", &metrics.end_to_end_latency),
        ("Queue wait (ms)", &metrics.queue_wait),
    ] {
        out.push_str(&format!(
            "  {} P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
            name, p.p50, p.p90, p.p99
        ));
    }
    out.push_str(&format!("{:-<70}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Requests/sec: {:.1}  Tokens/sec: {:.0} (input: {:.0}, output: {:.0})\n",
        metrics.requests_per_sec,
        metrics.total_tokens_per_sec,
        metrics.input_tokens_per_sec,
        metrics.output_tokens_per_sec,
    ));
    out.push_str(&format!(
        "  Steps: {}  Preemptions: {}  Admission delays: {}\n",
        metrics.steps, metrics.preemptions, metrics.admission_delays
    ));
    out.push_str(&format!("{:-<70}\n", "  Cache  "));
    out.push_str(&format!(
        "  Cache hit rate: {:.1}%\n",
        metrics.cache_hit_rate * 100.0
    ));
    if metrics.kv_thrash_rate > 0.0 {
        out.push_str(&format!(
            "  KV thrash rate: {:.1}%\n",
            metrics.kv_thrash_rate * 100.0
        ));
    }
    out.push_str(&format!("{:-<70}\n", "  Fairness  "));
    out.push_str(&format!(
        "  Load CV: {:.3}  Jain's index: {:.4}\n",
        metrics.load_cv, metrics.jains_fairness_index,
    ));
    if !metrics.anomalies.is_empty() {
        out.push_str(&format!("{:-<70}\n", "  Anomalies  "));
        out.push_str(&format!(
            "  Priority inversions: {}  HOL-blocked instances: {:?}  Total: {}\n",
            metrics.priority_inversions,
            metrics.hol_blocked_instances,
            metrics.anomalies.len()
        ));
    }
    if !metrics.custom_metrics.is_empty() {
        out.push_str(&format!("{:-<70}\n", "  Policy  "));
        for (name, value) in &metrics.custom_metrics {
            out.push_str(&format!("  {}: {:.4}\n", name, value));
        }
    }
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

/// Format a comparison table of multiple runs.
pub fn format_comparison_table(results: &[SimulationMetrics]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<90}\n", "  Policy Comparison  "));
    out.push_str(&format!(
        "{:<18} {:>8} {:>8} {:>8} {:>8} {:>8} {:>7} {:>8} {:>7}\n",
        "Policy", "TTFT p50", "TTFT p99", "E2E p50", "E2E p99", "Req/s", "Cache%", "Jain's", "Rejects"
    ));
    out.push_str(&format!("{:-<90}\n", ""));

    for m in results {
        out.push_str(&format!(
            "{:<18} {:>8.1} {:>8.1} {:>8.1} {:>8.1} {:>8.1} {:>6.1}% {:>8.4} {:>7}\n",
            m.label,
            m.ttft.p50,
            m.ttft.p99,
            m.end_to_end_latency.p50,
            m.end_to_end_latency.p99,
            m.requests_per_sec,
            m.cache_hit_rate * 100.0,
            m.jains_fairness_index,
            m.rejected_requests,
        ));
    }
    out.push_str(&format!("{:=<90}\n", ""));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestState;

    fn record(id: RequestId, arrival: Tick, e2e: Tick, class: SloClass) -> RequestRecord {
        RequestRecord {
            request_id: id,
            instance: 0,
            arrival_time: arrival,
            input_tokens: 100,
            output_tokens: 10,
            slo_class: class,
            tenant_id: 0,
            queue_wait: 0,
            scheduling_delay: 0,
            ttft: e2e / 2,
            e2e,
            itls: vec![],
            preemptions: 0,
            cache_hit_blocks: 0,
            cache_miss_blocks: 0,
        }
    }

    #[test]
    fn test_percentiles_empty() {
        let p = Percentiles::from_values(&[]);
        assert_eq!(p.p50, 0.0);
        assert_eq!(p.mean, 0.0);
    }

    #[test]
    fn test_percentiles_single() {
        let p = Percentiles::from_values(&[42.0]);
        assert_eq!(p.p50, 42.0);
        assert_eq!(p.p99, 42.0);
        assert_eq!(p.mean, 42.0);
    }

    #[test]
    fn test_percentiles_distribution() {
        let values: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let p = Percentiles::from_values(&values);
        assert!((p.p50 - 50.0).abs() < 2.0);
        assert!((p.p99 - 99.0).abs() < 2.0);
        assert_eq!(p.min, 1.0);
        assert_eq!(p.max, 100.0);
    }

    #[test]
    fn test_percentiles_from_ticks_in_ms() {
        let p = Percentiles::from_ticks([1_000, 3_000]);
        assert_eq!(p.min, 1.0);
        assert_eq!(p.max, 3.0);
        assert_eq!(p.mean, 2.0);
    }

    #[test]
    fn test_coefficient_of_variation() {
        assert_eq!(coefficient_of_variation(&[]), 0.0);
        assert_eq!(coefficient_of_variation(&[5, 5, 5, 5]), 0.0);
        assert!(coefficient_of_variation(&[1, 2, 3, 4, 5]) > 0.0);
    }

    #[test]
    fn test_jains_fairness() {
        assert!((jains_fairness_index(&[100, 100, 100, 100]) - 1.0).abs() < 0.001);
        assert!(jains_fairness_index(&[100, 0, 0, 0]) < 0.5);
        assert_eq!(jains_fairness_index(&[0, 0]), 1.0);
    }

    #[test]
    fn test_record_from_request() {
        let mut req = Request::new(7, 1_000, 32, 3);
        req.transition(RequestState::Queued).unwrap();
        req.timing.enqueue_time = Some(1_500);
        req.timing.first_scheduled = Some(2_000);
        req.transition(RequestState::Running).unwrap();
        req.advance(32, 3_000);
        req.advance(33, 3_400);
        req.advance(34, 4_000);
        req.timing.completion_time = Some(4_000);
        req.instance = Some(2);

        let rec = RequestRecord::from_request(&req).unwrap();
        assert_eq!(rec.instance, 2);
        assert_eq!(rec.queue_wait, 500);
        assert_eq!(rec.scheduling_delay, 1_000);
        assert_eq!(rec.ttft, 2_000);
        assert_eq!(rec.e2e, 3_000);
        assert_eq!(rec.itls, vec![400, 600]);
        assert!((rec.avg_itl_ms() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_record_requires_completion() {
        assert!(RequestRecord::from_request(&Request::new(1, 0, 8, 1)).is_none());
    }

    #[test]
    fn test_priority_inversion_within_class_only() {
        let records = vec![
            record(1, 0, 9_000, SloClass::Standard),
            record(2, 10, 1_000, SloClass::Batch),
            record(3, 20, 4_000, SloClass::Standard),
            record(4, 30, 3_000, SloClass::Standard),
        ];
        let found = detect_priority_inversions(&records);
        assert_eq!(found.len(), 1);
        match &found[0] {
            Anomaly::PriorityInversion { earlier, later, .. } => {
                assert_eq!((*earlier, *later), (1, 3));
            }
            other => panic!("unexpected anomaly {:?}", other),
        }
    }

    #[test]
    fn test_warmup_skips_first_completions() {
        let mut collector = MetricsCollector::new(1);
        for id in 0..3 {
            let mut req = Request::new(id, 0, 8, 1);
            req.timing.completion_time = Some(100);
            collector.record_completion(&req);
        }
        assert_eq!(collector.completed_count(), 3);
        assert_eq!(collector.records().len(), 2);
        assert_eq!(collector.records()[0].request_id, 1);
    }

    #[test]
    fn test_aggregate_without_instances() {
        let mut collector = MetricsCollector::new(0);
        collector.record_admission_rejection();
        collector.record_instance_rejection();
        collector.record_invalid_routing(3, 50, "instance 9 does not exist".into());
        let metrics = collector.aggregate(
            RunContext {
                label: "test".into(),
                injected: 2,
                ..Default::default()
            },
            &[],
        );
        assert_eq!(metrics.rejected_requests, 2);
        assert_eq!(metrics.rejected_at_admission, 1);
        assert_eq!(metrics.completed_requests, 0);
        assert_eq!(metrics.anomalies.len(), 1);
        assert_eq!(metrics.anomalies[0].kind(), "invalid-routing");
        assert!(format_table(&metrics).contains("test Results"));
    }

    #[test]
    fn test_comparison_table_lists_every_run() {
        let collector = MetricsCollector::new(0);
        let runs: Vec<_> = ["round-robin", "least-loaded"]
            .iter()
            .map(|name| {
                collector.aggregate(
                    RunContext {
                        label: name.to_string(),
                        ..Default::default()
                    },
                    &[],
                )
            })
            .collect();
        let table = format_comparison_table(&runs);
        assert!(table.contains("round-robin"));
        assert!(table.contains("least-loaded"));
        assert_eq!(format_comparison_table(&[]), "No results to compare.\n");
    }
}
