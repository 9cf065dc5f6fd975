//! The mutator scheduler: the pacing policy that decides when the collector
//! may keep the world stopped and when the mutator must get it back.
//!
//! Time is divided into periods. Within each period the collector owns a
//! slice proportional to `collector_utilization`; draining past that slice
//! sends the cycle concurrent, and a mutator that has run out its own slice
//! (or allocated heavily since resuming) is stopped again. A missed budget is
//! not an error: the next cycle's measurements simply shift the split.

use portable_atomic::AtomicF64;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::util::options::Options;

/// Exponential smoothing factor for the measured marking rate.
const MARKING_RATE_SMOOTHING: f64 = 0.5;

struct PacingState {
    cycle_started_at: Option<Instant>,
    resumed_at: Option<Instant>,
    bytes_allocated_at_resume: usize,
    stopped_at: Option<Instant>,
}

pub(crate) struct SpaceTimeScheduler {
    options: Arc<Options>,
    state: Mutex<PacingState>,
    /// Smoothed marking throughput in bytes per second, for logging and for
    /// embedders sizing their own budgets.
    marking_rate: AtomicF64,
}

impl SpaceTimeScheduler {
    pub fn new(options: Arc<Options>) -> Self {
        SpaceTimeScheduler {
            options,
            state: Mutex::new(PacingState {
                cycle_started_at: None,
                resumed_at: None,
                bytes_allocated_at_resume: 0,
                stopped_at: None,
            }),
            marking_rate: AtomicF64::new(0.0),
        }
    }

    pub fn began_cycle(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.cycle_started_at = Some(now);
        state.resumed_at = None;
        state.stopped_at = Some(now);
    }

    /// How long the current stopped-world drain may run.
    pub fn drain_deadline(&self, now: Instant) -> Instant {
        now + Duration::from_millis(self.options.pause_budget_ms)
    }

    /// A deadline far enough away that the drain runs to termination. Used
    /// when a waiter is blocked on the cycle: pause time no longer matters.
    pub fn unbounded_deadline(&self, now: Instant) -> Instant {
        now + Duration::from_secs(3600)
    }

    pub fn did_stop(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.stopped_at = Some(now);
        state.resumed_at = None;
    }

    pub fn did_resume(&self, now: Instant, bytes_allocated: usize) {
        let mut state = self.state.lock().unwrap();
        state.resumed_at = Some(now);
        state.bytes_allocated_at_resume = bytes_allocated;
    }

    /// During the concurrent phase: has the mutator used up its slice of the
    /// period, in time or in allocation?
    pub fn should_stop_the_mutator(
        &self,
        now: Instant,
        bytes_allocated: usize,
        eden_allowance: usize,
    ) -> bool {
        let state = self.state.lock().unwrap();
        let resumed_at = match state.resumed_at {
            Some(at) => at,
            // Not resumed yet; nothing to take back.
            None => return false,
        };
        let period = Duration::from_millis(self.options.concurrent_period_ms);
        let mutator_slice = period.mul_f64(1.0 - self.options.collector_utilization);
        if now.duration_since(resumed_at) >= mutator_slice {
            return true;
        }
        // Space guard: a mutator allocating a large slice of the remaining
        // allowance pays for it in marking time now, not at the next cycle.
        let allocated_since_resume = bytes_allocated.saturating_sub(state.bytes_allocated_at_resume);
        allocated_since_resume >= std::cmp::max(1, eden_allowance / 8)
    }

    /// Record the cycle's marking throughput.
    pub fn end_cycle(&self, now: Instant, bytes_visited: usize) {
        let mut state = self.state.lock().unwrap();
        let started = state.cycle_started_at.take();
        state.resumed_at = None;
        state.stopped_at = None;
        drop(state);

        if let Some(started) = started {
            let elapsed = now.duration_since(started).as_secs_f64();
            if elapsed > 0.0 {
                let rate = bytes_visited as f64 / elapsed;
                let old = self.marking_rate.load(Ordering::Relaxed);
                let smoothed = if old == 0.0 {
                    rate
                } else {
                    old * MARKING_RATE_SMOOTHING + rate * (1.0 - MARKING_RATE_SMOOTHING)
                };
                self.marking_rate.store(smoothed, Ordering::Relaxed);
                trace!(
                    "cycle marking rate {:.0} bytes/s (smoothed {:.0})",
                    rate,
                    smoothed
                );
            }
        }
    }

    pub fn marking_rate(&self) -> f64 {
        self.marking_rate.load(Ordering::Relaxed)
    }
}
