//! Request model and lifecycle state machine.
//!
//! A [`Request`] carries its token counts, scheduling metadata and the
//! timing recorded as it moves through the cluster. State changes go through
//! [`Request::transition`], which refuses anything outside the legal graph:
//!
//! ```text
//! Arrived ──► Queued ──► Running ──► Completed
//!    │          │  ▲         │
//!    ▼          ▼  └─────────┘ (preemption / handoff)
//! Rejected   Rejected
//! ```

use crate::error::InvariantViolation;
use blis_policies::{InstanceId, RequestId, RequestInfo, SharedPrefix, SloClass, Tick};
use serde::{Deserialize, Serialize};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Injected into the cluster, not yet enqueued on an instance.
    Arrived,
    Queued,
    Running,
    Completed,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Rejected)
    }

    fn can_move_to(&self, to: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, to),
            (Arrived, Queued)
                | (Arrived, Rejected)
                | (Queued, Running)
                | (Queued, Rejected)
                | (Running, Queued)
                | (Running, Completed)
        )
    }
}

/// Timing recorded over a request's life. All values are absolute ticks
/// except `itls`, which holds gaps between consecutive output tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTiming {
    /// First time the request entered an instance wait queue.
    pub enqueue_time: Option<Tick>,
    /// First time the request was admitted into a running batch.
    pub first_scheduled: Option<Tick>,
    pub first_token_time: Option<Tick>,
    pub last_token_time: Option<Tick>,
    pub itls: Vec<Tick>,
    pub completion_time: Option<Tick>,
}

/// A single inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub arrival_time: Tick,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens whose KV has been computed so far (prompt first, then output).
    pub progress: u32,
    pub priority: f64,
    pub tenant_id: u32,
    pub slo_class: SloClass,
    pub prefix: Option<SharedPrefix>,
    state: RequestState,
    pub timing: RequestTiming,
    pub preemptions: u32,
    /// Decode instance for a prefill/decode split. Cleared at handoff.
    pub decode_target: Option<InstanceId>,
    /// Instance currently owning the request.
    pub instance: Option<InstanceId>,
    pub cache_hit_blocks: u32,
    pub cache_miss_blocks: u32,
    /// Output tokens emitted so far. Survives preemption, so recomputed
    /// tokens are not emitted twice.
    pub emitted_tokens: u32,
}

impl Request {
    /// A fresh request in the `Arrived` state.
    pub fn new(id: RequestId, arrival_time: Tick, input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            id,
            arrival_time,
            input_tokens,
            output_tokens,
            progress: 0,
            priority: 0.0,
            tenant_id: 0,
            slo_class: SloClass::Standard,
            prefix: None,
            state: RequestState::Arrived,
            timing: RequestTiming::default(),
            preemptions: 0,
            decode_target: None,
            instance: None,
            cache_hit_blocks: 0,
            cache_miss_blocks: 0,
            emitted_tokens: 0,
        }
    }

    pub fn with_prefix(mut self, group: u64, tokens: u32) -> Self {
        self.prefix = Some(SharedPrefix {
            group,
            tokens: tokens.min(self.input_tokens),
        });
        self
    }

    pub fn with_slo(mut self, slo_class: SloClass) -> Self {
        self.slo_class = slo_class;
        self
    }

    pub fn with_tenant(mut self, tenant_id: u32) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Move to `to`, or report an illegal transition.
    pub fn transition(&mut self, to: RequestState) -> Result<(), InvariantViolation> {
        if !self.state.can_move_to(to) {
            let err = InvariantViolation::IllegalTransition {
                request: self.id,
                from: self.state,
                to,
            };
            tracing::error!(%err, "illegal request transition");
            return Err(err);
        }
        self.state = to;
        Ok(())
    }

    /// Read-only view handed to policies.
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id,
            arrival_time: self.arrival_time,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            progress: self.progress,
            priority: self.priority,
            tenant_id: self.tenant_id,
            slo_class: self.slo_class,
            prefix: self.prefix,
        }
    }

    pub fn in_prefill(&self) -> bool {
        self.progress < self.input_tokens
    }

    pub fn remaining_prefill(&self) -> u32 {
        self.input_tokens.saturating_sub(self.progress)
    }

    /// Progress at which the request is done. A zero-output request still
    /// produces the one token that ends its prefill.
    pub fn completion_progress(&self) -> u32 {
        self.input_tokens + self.output_tokens.max(1) - 1
    }

    /// Total tokens whose KV the request may hold at its peak.
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Time to first token, relative to arrival.
    pub fn ttft(&self) -> Option<Tick> {
        self.timing
            .first_token_time
            .map(|t| t.saturating_sub(self.arrival_time))
    }

    /// End-to-end latency, relative to arrival.
    pub fn e2e(&self) -> Option<Tick> {
        self.timing
            .completion_time
            .map(|t| t.saturating_sub(self.arrival_time))
    }

    /// Time between reaching an instance queue and first being scheduled.
    pub fn queue_wait(&self) -> Option<Tick> {
        match (self.timing.enqueue_time, self.timing.first_scheduled) {
            (Some(enq), Some(sched)) => Some(sched.saturating_sub(enq)),
            _ => None,
        }
    }

    /// Record that computed progress advanced to `progress` at `now`.
    ///
    /// Crossing the end of the prompt emits the first output token; every
    /// later advance emits one token and one inter-token gap. After a
    /// preemption, tokens up to `emitted_tokens` are recomputed silently and
    /// the first new token's gap spans the stall.
    pub fn advance(&mut self, progress: u32, now: Tick) {
        self.progress = progress;
        if self.in_prefill() {
            return;
        }
        let emitted = progress - self.input_tokens + 1;
        if emitted <= self.emitted_tokens {
            return;
        }
        match self.timing.last_token_time {
            Some(last) => self.timing.itls.push(now.saturating_sub(last)),
            None => self.timing.first_token_time = Some(now),
        }
        self.timing.last_token_time = Some(now);
        self.emitted_tokens = emitted;
    }

    pub fn is_done(&self) -> bool {
        self.progress >= self.completion_progress()
    }
}
