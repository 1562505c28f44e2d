//! Simulated inference instance.
//!
//! Each [`Instance`] owns a wait queue, a running batch, a KV cache and an
//! instance scheduler. It runs at most one step at a time: `Step` forms a
//! batch and schedules `StepComplete`, which advances progress, finishes or
//! hands off requests and schedules the next `Step` while work remains.

use crate::batch::{form_batch, BatchContext, BatchLimits, BatchOutcome};
use crate::error::InvariantViolation;
use crate::event::{EventKind, EventQueue};
use crate::kv_cache::{KvCacheManager, KvCacheStats};
use crate::kv_tier::CpuTierConfig;
use crate::latency::LatencyModel;
use crate::request::{Request, RequestState};
use blis_policies::{InstanceId, InstanceRole, PriorityPolicy, SchedulerTemplate, Tick};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Construction parameters shared by every instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub kv_blocks: u32,
    pub block_size: u32,
    pub limits: BatchLimits,
    pub cpu_tier: Option<CpuTierConfig>,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub steps: u64,
    pub completed: u64,
    pub rejected: u64,
    pub preemptions: u64,
    pub handoffs: u64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub busy_ticks: Tick,
    pub peak_kv_blocks: u64,
    queue_depth_sum: u64,
    queue_depth_samples: u64,
}

impl InstanceStats {
    /// Mean wait-queue depth sampled at every step.
    pub fn mean_queue_depth(&self) -> f64 {
        if self.queue_depth_samples == 0 {
            return 0.0;
        }
        self.queue_depth_sum as f64 / self.queue_depth_samples as f64
    }
}

/// Live load figures read by the snapshot provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveLoad {
    pub queue_depth: u32,
    pub batch_size: u32,
    pub kv_utilization: f64,
    pub free_kv_blocks: u64,
    pub cache_hit_rate: f64,
}

/// Result of handing a request to an instance.
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    Rejected { request: Box<Request>, reason: String },
}

/// A request whose prefill finished here and whose decode runs elsewhere.
#[derive(Debug)]
pub struct Handoff {
    pub request: Box<Request>,
    pub decode: InstanceId,
    /// KV blocks to transfer.
    pub blocks: u64,
}

/// What a completed step produced.
#[derive(Debug, Default)]
pub struct StepReport {
    pub completed: Vec<Request>,
    pub handoffs: Vec<Handoff>,
}

/// A single simulated serving instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub role: InstanceRole,
    kv: KvCacheManager,
    scheduler: SchedulerTemplate,
    limits: BatchLimits,
    queue: VecDeque<Request>,
    running: Vec<Request>,
    /// A `Step` or `StepComplete` is pending.
    busy: bool,
    in_flight: Option<BatchOutcome>,
    step_started: Tick,
    pub stats: InstanceStats,
}

impl Instance {
    pub fn new(
        id: InstanceId,
        role: InstanceRole,
        spec: &InstanceSpec,
        scheduler: SchedulerTemplate,
    ) -> Self {
        let mut kv = KvCacheManager::new(id, spec.kv_blocks, spec.block_size);
        if let Some(tier) = &spec.cpu_tier {
            kv = kv.with_cpu_tier(tier);
        }
        Self {
            id,
            role,
            kv,
            scheduler,
            limits: spec.limits,
            queue: VecDeque::new(),
            running: Vec::new(),
            busy: false,
            in_flight: None,
            step_started: 0,
            stats: InstanceStats::default(),
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue.len() as u32
    }

    pub fn batch_size(&self) -> u32 {
        self.running.len() as u32
    }

    pub fn is_idle(&self) -> bool {
        !self.busy
    }

    pub fn kv(&self) -> &KvCacheManager {
        &self.kv
    }

    pub fn kv_stats(&self) -> KvCacheStats {
        self.kv.stats()
    }

    pub fn live_load(&self) -> LiveLoad {
        LiveLoad {
            queue_depth: self.queue_depth(),
            batch_size: self.batch_size(),
            kv_utilization: self.kv.utilization(),
            free_kv_blocks: self.kv.free_blocks(),
            cache_hit_rate: self.kv.hit_rate(),
        }
    }

    /// Why `request` can never run here, if it cannot.
    fn never_fits(&self, request: &Request) -> Option<String> {
        if request.input_tokens == 0 {
            return Some("empty prompt".to_string());
        }
        if !self.limits.chunked_prefill
            && request.remaining_prefill() > self.limits.max_scheduled_tokens
        {
            return Some(format!(
                "prompt of {} tokens exceeds token budget {} with chunked prefill disabled",
                request.input_tokens, self.limits.max_scheduled_tokens
            ));
        }
        let blocks = self.kv.blocks_for_tokens(request.total_tokens());
        if blocks > self.kv.total_blocks() {
            return Some(format!(
                "needs {} kv blocks, instance has {}",
                blocks,
                self.kv.total_blocks()
            ));
        }
        None
    }

    /// Put a request on the wait queue and wake the instance if idle.
    pub fn enqueue(
        &mut self,
        mut request: Request,
        now: Tick,
        events: &mut EventQueue,
    ) -> Result<Enqueued, InvariantViolation> {
        if request.state() == RequestState::Arrived {
            request.transition(RequestState::Queued)?;
        }
        request.instance = Some(self.id);
        if let Some(reason) = self.never_fits(&request) {
            request.transition(RequestState::Rejected)?;
            self.stats.rejected += 1;
            tracing::debug!(instance = self.id, request = request.id, %reason, "rejected at enqueue");
            return Ok(Enqueued::Rejected {
                request: Box::new(request),
                reason,
            });
        }
        request.timing.enqueue_time.get_or_insert(now);
        self.queue.push_back(request);
        if !self.busy {
            self.busy = true;
            events.schedule(now, EventKind::Step { instance: self.id })?;
        }
        Ok(Enqueued::Queued)
    }

    /// Form a batch and schedule its completion.
    pub fn step<L: LatencyModel + ?Sized>(
        &mut self,
        now: Tick,
        latency: &L,
        events: &mut EventQueue,
    ) -> Result<(), InvariantViolation> {
        self.kv.set_clock(now);
        let outcome = form_batch(BatchContext {
            running: &mut self.running,
            queue: &mut self.queue,
            kv: &mut self.kv,
            scheduler: &self.scheduler,
            limits: self.limits,
            now,
        })?;
        self.stats.queue_depth_sum += self.queue.len() as u64;
        self.stats.queue_depth_samples += 1;
        self.stats.preemptions += outcome.preempted.len() as u64;
        self.stats.peak_kv_blocks = self.stats.peak_kv_blocks.max(self.kv.used_blocks());

        let overheads = latency.scheduling_overhead() * outcome.newly_scheduled.len() as Tick
            + latency.preemption_overhead() * outcome.preempted.len() as Tick;

        if outcome.is_empty() {
            if outcome.preempted.is_empty() {
                if !self.queue.is_empty() || !self.running.is_empty() {
                    tracing::warn!(
                        instance = self.id,
                        queued = self.queue.len(),
                        running = self.running.len(),
                        "nothing schedulable, instance idles"
                    );
                }
                self.busy = false;
            } else {
                // The batch shrank; retry once the preemptions have been paid.
                events.schedule(now + overheads, EventKind::Step { instance: self.id })?;
            }
            return Ok(());
        }

        let batch = outcome.step_batch();
        let duration = latency.step_time(&batch) + self.kv.consume_pending_transfer_latency() + overheads;
        tracing::debug!(
            instance = self.id,
            now,
            duration,
            prefill_tokens = batch.prefill_tokens,
            decode_tokens = batch.decode_tokens,
            admitted = outcome.newly_scheduled.len(),
            preempted = outcome.preempted.len(),
            "step"
        );
        self.stats.steps += 1;
        self.stats.prefill_tokens += batch.prefill_tokens;
        self.stats.decode_tokens += batch.decode_tokens;
        self.step_started = now;
        self.in_flight = Some(outcome);
        events.schedule(now + duration, EventKind::StepComplete { instance: self.id })?;
        Ok(())
    }

    /// Apply the in-flight batch and schedule the next step if work remains.
    pub fn complete_step(
        &mut self,
        now: Tick,
        events: &mut EventQueue,
    ) -> Result<StepReport, InvariantViolation> {
        let mut report = StepReport::default();
        let Some(outcome) = self.in_flight.take() else {
            return Ok(report);
        };
        self.stats.busy_ticks += now - self.step_started;

        for work in &outcome.scheduled {
            let req = self
                .running
                .iter_mut()
                .find(|r| r.id == work.request)
                .ok_or(InvariantViolation::UnknownRequest {
                    instance: self.id,
                    request: work.request,
                })?;
            req.advance(work.progress_after, now);
        }

        let mut still_running = Vec::with_capacity(self.running.len());
        for mut req in std::mem::take(&mut self.running) {
            if req.is_done() {
                req.transition(RequestState::Completed)?;
                req.timing.completion_time = Some(now);
                self.kv.release(req.id)?;
                self.stats.completed += 1;
                report.completed.push(req);
            } else if !req.in_prefill() && req.decode_target.is_some() {
                let blocks = self.kv.blocks_for_tokens(req.progress);
                self.kv.release(req.id)?;
                req.transition(RequestState::Queued)?;
                let Some(decode) = req.decode_target.take() else {
                    continue;
                };
                self.stats.handoffs += 1;
                report.handoffs.push(Handoff {
                    request: Box::new(req),
                    decode,
                    blocks,
                });
            } else {
                still_running.push(req);
            }
        }
        self.running = still_running;

        if self.running.is_empty() && self.queue.is_empty() {
            self.busy = false;
        } else {
            events.schedule(now, EventKind::Step { instance: self.id })?;
        }
        Ok(report)
    }

    /// Recompute the priority of every queued and running request.
    pub fn reprioritize<P: PriorityPolicy + ?Sized>(&mut self, policy: &P, now: Tick) {
        for req in self.queue.iter_mut().chain(self.running.iter_mut()) {
            req.priority = policy.compute(&req.info(), now);
        }
    }

    /// Requests still queued and still running, for the horizon report.
    pub fn in_flight_counts(&self) -> (u64, u64) {
        (self.queue.len() as u64, self.running.len() as u64)
    }

    pub fn check_kv(&self) -> Result<(), InvariantViolation> {
        self.kv.check_conservation()
    }
}
