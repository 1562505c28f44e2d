//! Instance schedulers: wait-queue ordering and preemption victim choice.
//!
//! All comparators finish with a request id tie-break, except FCFS which
//! returns `Equal` and relies on the stable sort to keep arrival order.

use crate::traits::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Scheduler template selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum SchedulerConfig {
    Fcfs,
    PriorityFcfs,
    Sjf,
    ReversePriority,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Fcfs
    }
}

fn by_priority_desc(a: &RequestInfo, b: &RequestInfo) -> Ordering {
    b.priority.total_cmp(&a.priority)
}

fn by_arrival_then_id(a: &RequestInfo, b: &RequestInfo) -> Ordering {
    a.arrival_time
        .cmp(&b.arrival_time)
        .then(a.id.cmp(&b.id))
}

/// First come, first served. Leaves the queue untouched.
#[derive(Debug, Clone, Default)]
pub struct Fcfs;

impl InstanceScheduler for Fcfs {
    fn compare(&self, _a: &RequestInfo, _b: &RequestInfo) -> Ordering {
        Ordering::Equal
    }

    fn name(&self) -> &str {
        "fcfs"
    }
}

/// Highest priority first, then earliest arrival, then lowest id.
#[derive(Debug, Clone, Default)]
pub struct PriorityFcfs;

impl InstanceScheduler for PriorityFcfs {
    fn compare(&self, a: &RequestInfo, b: &RequestInfo) -> Ordering {
        by_priority_desc(a, b).then_with(|| by_arrival_then_id(a, b))
    }

    fn name(&self) -> &str {
        "priority-fcfs"
    }
}

/// Shortest prompt first, then earliest arrival, then lowest id.
#[derive(Debug, Clone, Default)]
pub struct ShortestJobFirst;

impl InstanceScheduler for ShortestJobFirst {
    fn compare(&self, a: &RequestInfo, b: &RequestInfo) -> Ordering {
        a.input_tokens
            .cmp(&b.input_tokens)
            .then_with(|| by_arrival_then_id(a, b))
    }

    fn name(&self) -> &str {
        "sjf"
    }
}

/// Pathological: lowest priority first.
#[derive(Debug, Clone, Default)]
pub struct ReversePriority;

impl InstanceScheduler for ReversePriority {
    fn compare(&self, a: &RequestInfo, b: &RequestInfo) -> Ordering {
        by_priority_desc(b, a).then_with(|| by_arrival_then_id(a, b))
    }

    fn name(&self) -> &str {
        "reverse-priority"
    }
}

/// Closed set of scheduler templates.
#[derive(Debug, Clone)]
pub enum SchedulerTemplate {
    Fcfs(Fcfs),
    PriorityFcfs(PriorityFcfs),
    Sjf(ShortestJobFirst),
    ReversePriority(ReversePriority),
}

impl SchedulerTemplate {
    pub fn from_config(config: SchedulerConfig) -> Self {
        match config {
            SchedulerConfig::Fcfs => SchedulerTemplate::Fcfs(Fcfs),
            SchedulerConfig::PriorityFcfs => SchedulerTemplate::PriorityFcfs(PriorityFcfs),
            SchedulerConfig::Sjf => SchedulerTemplate::Sjf(ShortestJobFirst),
            SchedulerConfig::ReversePriority => {
                SchedulerTemplate::ReversePriority(ReversePriority)
            }
        }
    }
}

impl Default for SchedulerTemplate {
    fn default() -> Self {
        SchedulerTemplate::Fcfs(Fcfs)
    }
}

impl InstanceScheduler for SchedulerTemplate {
    fn compare(&self, a: &RequestInfo, b: &RequestInfo) -> Ordering {
        match self {
            SchedulerTemplate::Fcfs(s) => s.compare(a, b),
            SchedulerTemplate::PriorityFcfs(s) => s.compare(a, b),
            SchedulerTemplate::Sjf(s) => s.compare(a, b),
            SchedulerTemplate::ReversePriority(s) => s.compare(a, b),
        }
    }

    fn choose_preemption_victim(&self, running: &[RequestInfo]) -> Option<usize> {
        match self {
            SchedulerTemplate::Fcfs(s) => s.choose_preemption_victim(running),
            SchedulerTemplate::PriorityFcfs(s) => s.choose_preemption_victim(running),
            SchedulerTemplate::Sjf(s) => s.choose_preemption_victim(running),
            SchedulerTemplate::ReversePriority(s) => s.choose_preemption_victim(running),
        }
    }

    fn name(&self) -> &str {
        match self {
            SchedulerTemplate::Fcfs(s) => s.name(),
            SchedulerTemplate::PriorityFcfs(s) => s.name(),
            SchedulerTemplate::Sjf(s) => s.name(),
            SchedulerTemplate::ReversePriority(s) => s.name(),
        }
    }
}
