//! Global event queue.
//!
//! Events are totally ordered by `(time, type priority, sequence id)`. The
//! sequence id is assigned at scheduling time and strictly increases, so two
//! runs that schedule the same events in the same order pop them in the same
//! order.

use crate::error::InvariantViolation;
use crate::request::Request;
use blis_policies::{InstanceId, Tick};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// What an event does, with its payload.
///
/// Cluster-stage events carry the request they act on, so a request in
/// transit between pipeline stages is owned by its event.
#[derive(Debug, Clone)]
pub enum EventKind {
    ClusterArrival(Box<Request>),
    Admission(Box<Request>),
    Routing(Box<Request>),
    InstanceArrival {
        instance: InstanceId,
        request: Box<Request>,
    },
    /// Prefill finished elsewhere; the KV has arrived at the decode instance.
    KvTransferComplete {
        instance: InstanceId,
        request: Box<Request>,
    },
    StepComplete {
        instance: InstanceId,
    },
    Step {
        instance: InstanceId,
    },
    SnapshotRefresh,
}

impl EventKind {
    /// Fixed tie-break priority. Lower runs first at equal timestamps.
    pub fn priority(&self) -> u8 {
        match self {
            EventKind::ClusterArrival(_) => 0,
            EventKind::Admission(_) => 1,
            EventKind::Routing(_) => 2,
            EventKind::InstanceArrival { .. } => 3,
            EventKind::KvTransferComplete { .. } => 4,
            EventKind::StepComplete { .. } => 5,
            EventKind::Step { .. } => 6,
            EventKind::SnapshotRefresh => 7,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::ClusterArrival(_) => "ClusterArrival",
            EventKind::Admission(_) => "Admission",
            EventKind::Routing(_) => "Routing",
            EventKind::InstanceArrival { .. } => "InstanceArrival",
            EventKind::KvTransferComplete { .. } => "KvTransferComplete",
            EventKind::StepComplete { .. } => "StepComplete",
            EventKind::Step { .. } => "Step",
            EventKind::SnapshotRefresh => "SnapshotRefresh",
        }
    }

    /// Instance the event is addressed to, if instance-scoped.
    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            EventKind::InstanceArrival { instance, .. }
            | EventKind::KvTransferComplete { instance, .. }
            | EventKind::StepComplete { instance }
            | EventKind::Step { instance } => Some(*instance),
            _ => None,
        }
    }

    /// Request carried by the event, if any.
    pub fn request(&self) -> Option<&Request> {
        match self {
            EventKind::ClusterArrival(r) | EventKind::Admission(r) | EventKind::Routing(r) => {
                Some(r)
            }
            EventKind::InstanceArrival { request, .. }
            | EventKind::KvTransferComplete { request, .. } => Some(request),
            _ => None,
        }
    }
}

/// A scheduled event.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: Tick,
    pub seq: u64,
    pub kind: EventKind,
}

impl Event {
    fn key(&self) -> (Tick, u8, u64) {
        (self.time, self.kind.priority(), self.seq)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap behavior in BinaryHeap
        other.key().cmp(&self.key())
    }
}

/// Min-heap of events with a monotone "current time".
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    next_seq: u64,
    now: Tick,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event and return its sequence id.
    pub fn schedule(&mut self, at: Tick, kind: EventKind) -> Result<u64, InvariantViolation> {
        if at < self.now {
            let err = InvariantViolation::EventInPast {
                kind: kind.label(),
                at,
                now: self.now,
            };
            tracing::error!(%err, "refusing to schedule event");
            return Err(err);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Event { time: at, seq, kind });
        Ok(seq)
    }

    /// Pop the globally least event and advance the queue's time to it.
    pub fn pop_next(&mut self) -> Option<Event> {
        let event = self.heap.pop()?;
        self.now = event.time;
        Some(event)
    }

    pub fn peek_time(&self) -> Option<Tick> {
        self.heap.peek().map(|e| e.time)
    }

    /// Time of the most recently popped event.
    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Requests owned by pending events, i.e. between pipeline stages.
    pub fn requests_in_transit(&self) -> usize {
        self.heap.iter().filter(|e| e.kind.request().is_some()).count()
    }

    /// Total events scheduled so far.
    pub fn scheduled_count(&self) -> u64 {
        self.next_seq
    }
}
