//! Virtual clock for discrete-event simulation.
//!
//! The [`SimClock`] tracks simulated time independently of wall-clock time,
//! advancing only when events are processed. One tick is one microsecond.

use blis_policies::Tick;
use serde::{Deserialize, Serialize};

pub const TICKS_PER_MS: Tick = 1_000;
pub const TICKS_PER_SEC: Tick = 1_000_000;

/// Virtual simulation clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    now: Tick,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { now: 0 }
    }

    /// Current time in ticks.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Current time in milliseconds.
    pub fn now_ms(&self) -> f64 {
        self.now as f64 / TICKS_PER_MS as f64
    }

    /// Advance the clock to `tick`.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is in the past. The event queue refuses past events,
    /// so reaching this is a bug in the queue itself.
    pub fn advance_to(&mut self, tick: Tick) {
        assert!(
            tick >= self.now,
            "Cannot move clock backwards: current={}, target={}",
            self.now,
            tick,
        );
        self.now = tick;
    }
}

/// Ticks to milliseconds.
pub fn ticks_to_ms(ticks: Tick) -> f64 {
    ticks as f64 / TICKS_PER_MS as f64
}
