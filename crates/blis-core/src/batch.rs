//! Per-step batch formation.
//!
//! Each step first continues the running batch (prefill chunks and decode
//! tokens), preempting from the batch when the KV cache runs dry, then admits
//! queued requests while the concurrency and token budgets allow. Batch
//! formation mutates the queue, the running batch and the KV cache but
//! schedules no events; the instance turns the [`BatchOutcome`] into them.

use crate::error::InvariantViolation;
use crate::kv_cache::{KvCacheError, KvCacheManager, PrefixMatch};
use crate::latency::StepBatch;
use crate::request::{Request, RequestState};
use blis_policies::{InstanceScheduler, RequestId, RequestInfo, Tick};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Budgets applied to every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_running_requests: u32,
    pub max_scheduled_tokens: u32,
    /// Largest prefill chunk; 0 disables the cap.
    pub long_prefill_threshold: u32,
    pub chunked_prefill: bool,
}

impl BatchLimits {
    /// Tokens of a prefill with `remaining` tokens to run this step, or `None`
    /// if it must wait for a step with more budget.
    fn prefill_chunk(&self, remaining: u32, budget: u32) -> Option<u32> {
        if !self.chunked_prefill {
            return (remaining <= budget).then_some(remaining);
        }
        let mut tokens = remaining.min(budget);
        if self.long_prefill_threshold > 0 {
            tokens = tokens.min(self.long_prefill_threshold);
        }
        Some(tokens)
    }
}

/// Work scheduled for one request this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledWork {
    pub request: RequestId,
    pub new_tokens: u32,
    /// Progress once the step completes.
    pub progress_after: u32,
    pub prefill: bool,
}

/// Result of forming one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub scheduled: Vec<ScheduledWork>,
    /// Requests moved from the queue into the batch this step.
    pub newly_scheduled: Vec<RequestId>,
    pub preempted: Vec<RequestId>,
}

impl BatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Batch shape handed to the latency model.
    pub fn step_batch(&self) -> StepBatch {
        let mut batch = StepBatch::default();
        for work in &self.scheduled {
            if work.prefill {
                batch.prefill_tokens += work.new_tokens as u64;
                batch.prefill_requests += 1;
                batch.max_prefill_chunk = batch.max_prefill_chunk.max(work.new_tokens);
            } else {
                batch.decode_tokens += work.new_tokens as u64;
                batch.decode_requests += 1;
            }
        }
        batch
    }
}

/// Mutable instance state batch formation works on.
pub struct BatchContext<'a, S: InstanceScheduler + ?Sized> {
    pub running: &'a mut Vec<Request>,
    pub queue: &'a mut VecDeque<Request>,
    pub kv: &'a mut KvCacheManager,
    pub scheduler: &'a S,
    pub limits: BatchLimits,
    pub now: Tick,
}

/// Form the next batch.
pub fn form_batch<S: InstanceScheduler + ?Sized>(
    ctx: BatchContext<'_, S>,
) -> Result<BatchOutcome, InvariantViolation> {
    let BatchContext {
        running,
        queue,
        kv,
        scheduler,
        limits,
        now,
    } = ctx;
    let mut outcome = BatchOutcome::default();
    let mut budget = limits.max_scheduled_tokens;

    let infos: Vec<RequestInfo> = queue.iter().map(Request::info).collect();
    let mut slots: Vec<Option<Request>> = queue.drain(..).map(Some).collect();
    queue.extend(
        scheduler
            .order(&infos)
            .into_iter()
            .filter_map(|i| slots[i].take()),
    );

    // Phase 1: continue the running batch.
    let mut i = 0;
    'running: while i < running.len() {
        if budget == 0 {
            tracing::debug!(now, deferred = running.len() - i, "token budget exhausted");
            break;
        }
        let req = &running[i];
        let prefill = req.in_prefill();
        let tokens = if prefill {
            match limits.prefill_chunk(req.remaining_prefill(), budget) {
                Some(t) => t,
                None => {
                    i += 1;
                    continue;
                }
            }
        } else {
            1
        };

        loop {
            let req = &running[i];
            let progress = req.progress;
            match kv.allocate(req, progress, progress + tokens, &PrefixMatch::default()) {
                Ok(_) => {
                    budget -= tokens;
                    outcome.scheduled.push(ScheduledWork {
                        request: req.id,
                        new_tokens: tokens,
                        progress_after: progress + tokens,
                        prefill,
                    });
                    i += 1;
                    break;
                }
                Err(KvCacheError::Invariant(e)) => return Err(e),
                Err(KvCacheError::Exhausted { needed, available }) => {
                    let infos: Vec<RequestInfo> = running.iter().map(Request::info).collect();
                    let Some(victim) = scheduler.choose_preemption_victim(&infos) else {
                        break 'running;
                    };
                    let victim = victim.min(running.len() - 1);
                    let victim_id = running[victim].id;
                    tracing::debug!(
                        now,
                        request = running[i].id,
                        victim = victim_id,
                        needed,
                        available,
                        "preempting to free kv blocks"
                    );
                    preempt(running.remove(victim), queue, kv)?;
                    outcome.preempted.push(victim_id);
                    if victim == i {
                        break 'running;
                    }
                    if victim < i {
                        i -= 1;
                        if let Some(pos) = outcome.scheduled.iter().position(|w| w.request == victim_id) {
                            budget += outcome.scheduled.remove(pos).new_tokens;
                        }
                    }
                }
            }
        }
    }

    // Phase 2: admit from the queue, unless this step preempted.
    if outcome.preempted.is_empty() {
        while (running.len() as u32) < limits.max_running_requests && budget > 0 {
            let Some(head) = queue.front() else {
                break;
            };
            let prefix = kv.lookup_prefix(head);
            let start = head.progress.max(prefix.cached_tokens(kv.block_size()));
            let prefill = start < head.input_tokens;
            let tokens = if prefill {
                match limits.prefill_chunk(head.input_tokens - start, budget) {
                    Some(t) => t,
                    None => break,
                }
            } else {
                1
            };
            match kv.allocate(head, start, start + tokens, &prefix) {
                Ok(_) => {}
                Err(KvCacheError::Exhausted { .. }) => break,
                Err(KvCacheError::Invariant(e)) => return Err(e),
            }
            let Some(mut req) = queue.pop_front() else {
                break;
            };
            req.transition(RequestState::Running)?;
            req.timing.first_scheduled.get_or_insert(now);
            // a handed-off request was already charged on its prefill instance
            if req.in_prefill() {
                req.cache_hit_blocks += prefix.len();
                req.cache_miss_blocks += prefix.prompt_blocks.saturating_sub(prefix.len());
            }
            budget -= tokens;
            outcome.newly_scheduled.push(req.id);
            outcome.scheduled.push(ScheduledWork {
                request: req.id,
                new_tokens: tokens,
                progress_after: start + tokens,
                prefill,
            });
            running.push(req);
        }
    }

    Ok(outcome)
}

/// Return a running request to the front of the queue with its KV released
/// and its progress reset.
fn preempt(
    mut req: Request,
    queue: &mut VecDeque<Request>,
    kv: &mut KvCacheManager,
) -> Result<(), InvariantViolation> {
    kv.release(req.id)?;
    req.progress = 0;
    req.preemptions += 1;
    req.transition(RequestState::Queued)?;
    queue.push_front(req);
    Ok(())
}
