//! Decision trace.
//!
//! The orchestrator reports every admission, routing, rejection, completion
//! and anomaly to a [`DecisionSink`]. [`DecisionTrace`] keeps them in memory
//! for JSONL export and a counterfactual summary; [`NullSink`] drops them.

use blis_policies::{InstanceId, InstanceSnapshot, RequestId, RoutingDecision, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

/// Pipeline stage at which a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionStage {
    Admission,
    Routing,
    Instance,
}

/// A candidate considered by routing, with the load it was judged on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub instance: InstanceId,
    pub score: f64,
    pub queue_depth: u32,
    pub batch_size: u32,
    pub in_flight: u32,
    pub kv_utilization: f64,
    pub free_kv_blocks: u64,
}

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DecisionRecord {
    Admission {
        request: RequestId,
        clock: Tick,
        admitted: bool,
        reason: String,
    },
    Routing {
        request: RequestId,
        clock: Tick,
        chosen: InstanceId,
        decode: Option<InstanceId>,
        reason: String,
        scores: BTreeMap<InstanceId, f64>,
        candidates: Vec<CandidateScore>,
        regret: f64,
    },
    Rejection {
        request: RequestId,
        clock: Tick,
        stage: RejectionStage,
        reason: String,
    },
    Completion {
        request: RequestId,
        clock: Tick,
        instance: InstanceId,
        ttft: Option<Tick>,
        e2e: Tick,
    },
    Anomaly {
        clock: Tick,
        anomaly: String,
        detail: String,
    },
}

/// Receives decision records from the orchestrator.
pub trait DecisionSink {
    fn record(&mut self, record: DecisionRecord);

    /// Top-k candidates to keep on routing records; 0 skips the
    /// counterfactual computation.
    fn top_k(&self) -> usize {
        0
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DecisionSink for NullSink {
    fn record(&mut self, _record: DecisionRecord) {}
}

/// Rank every snapshot by the decision's score, best first, and return the
/// top `k` with the regret of the chosen instance.
///
/// Score-free policies are ranked by negated effective load. Regret is the
/// best score minus the chosen one, floored at zero.
pub fn counterfactual(
    chosen: InstanceId,
    decision: &RoutingDecision,
    snapshots: &[InstanceSnapshot],
    k: usize,
) -> (Vec<CandidateScore>, f64) {
    if k == 0 || snapshots.is_empty() {
        return (Vec::new(), 0.0);
    }
    let mut all: Vec<CandidateScore> = snapshots
        .iter()
        .map(|snap| {
            let score = if decision.scores.is_empty() {
                -(snap.effective_load() as f64)
            } else {
                decision.scores.get(&snap.id).copied().unwrap_or(0.0)
            };
            CandidateScore {
                instance: snap.id,
                score,
                queue_depth: snap.queue_depth,
                batch_size: snap.batch_size,
                in_flight: snap.in_flight,
                kv_utilization: snap.kv_utilization,
                free_kv_blocks: snap.free_kv_blocks,
            }
        })
        .collect();
    let Some(chosen_score) = all.iter().find(|c| c.instance == chosen).map(|c| c.score) else {
        return (Vec::new(), 0.0);
    };
    all.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.instance.cmp(&b.instance)));
    let regret = (all[0].score - chosen_score).max(0.0);
    all.truncate(k);
    (all, regret)
}

/// Aggregate view of a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_decisions: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub mean_regret: f64,
    pub max_regret: f64,
    pub unique_targets: usize,
    pub target_distribution: BTreeMap<InstanceId, usize>,
    pub anomalies: usize,
}

/// In-memory decision trace.
#[derive(Debug, Clone, Default)]
pub struct DecisionTrace {
    top_k: usize,
    records: Vec<DecisionRecord>,
}

impl DecisionTrace {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write one JSON object per line.
    pub fn write_jsonl<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn summarize(&self) -> TraceSummary {
        let mut summary = TraceSummary::default();
        let mut regrets = Vec::new();
        for record in &self.records {
            match record {
                DecisionRecord::Admission { admitted, .. } => {
                    summary.total_decisions += 1;
                    if *admitted {
                        summary.admitted += 1;
                    } else {
                        summary.rejected += 1;
                    }
                }
                DecisionRecord::Routing { chosen, regret, .. } => {
                    *summary.target_distribution.entry(*chosen).or_default() += 1;
                    regrets.push(*regret);
                }
                DecisionRecord::Anomaly { .. } => summary.anomalies += 1,
                DecisionRecord::Rejection { .. } | DecisionRecord::Completion { .. } => {}
            }
        }
        if !regrets.is_empty() {
            summary.mean_regret = regrets.iter().sum::<f64>() / regrets.len() as f64;
            summary.max_regret = regrets.iter().copied().fold(0.0, f64::max);
        }
        summary.unique_targets = summary.target_distribution.len();
        summary
    }
}

impl DecisionSink for DecisionTrace {
    fn record(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    fn top_k(&self) -> usize {
        self.top_k
    }
}
