//! Fixed-rate probe scheduling.
//!
//! The pacer is driven by whatever timer the event loop provides. It only
//! decides, per tick, whether a probe should go out, and keeps the deadline
//! bookkeeping for loops that poll with a timeout.

use rand::Rng;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    /// Waiting for the first tick.
    Idle,
    /// Emitting one probe per tick.
    Active,
    /// Budget exhausted.
    Stopped,
}

/// Decision for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerAction {
    /// Encode and send a probe.
    Emit,
    /// No live connection; this probe is dropped.
    Skip,
    /// Budget just ran out: stop the timer and close the connection.
    Stop,
    /// Already stopped.
    Done,
}

pub struct Pacer {
    state: PacerState,
    ticks: u64,
    budget: u64,
    period: Duration,
    initial_delay: Duration,
    next_deadline: Option<Instant>,
}

impl Pacer {
    pub fn new(budget: u64, period: Duration, initial_delay: Duration) -> Self {
        Self {
            state: PacerState::Idle,
            ticks: 0,
            budget,
            period,
            initial_delay,
            next_deadline: None,
        }
    }

    /// Like `new`, with the first tick delayed by `base` plus a uniform draw
    /// from `0..=jitter` so that many probes started together spread out.
    pub fn with_jitter<R: Rng>(
        budget: u64,
        period: Duration,
        base: Duration,
        jitter: Duration,
        rng: &mut R,
    ) -> Self {
        let extra = rng.gen_range(0..=jitter.as_millis() as u64);
        Self::new(budget, period, base + Duration::from_millis(extra))
    }

    #[cfg(test)]
    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn is_stopped(&self) -> bool {
        self.state == PacerState::Stopped
    }

    /// Start the schedule; the first tick is due `initial_delay` after `now`.
    pub fn arm(&mut self, now: Instant) {
        if self.state == PacerState::Idle {
            self.next_deadline = Some(now + self.initial_delay);
        }
    }

    /// When the next tick is due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    /// Whether a tick is due at `now`. Advances the deadline by one period
    /// when it is; a late loop does not get a burst of catch-up ticks.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.next_deadline {
            Some(deadline) if deadline <= now => {
                let next = deadline + self.period;
                self.next_deadline = Some(if next <= now { now + self.period } else { next });
                true
            }
            _ => false,
        }
    }

    pub fn tick(&mut self, connected: bool) -> PacerAction {
        if self.state == PacerState::Stopped {
            return PacerAction::Done;
        }
        self.state = PacerState::Active;

        self.ticks += 1;
        if self.ticks > self.budget {
            self.state = PacerState::Stopped;
            self.next_deadline = None;
            return PacerAction::Stop;
        }

        if connected {
            PacerAction::Emit
        } else {
            PacerAction::Skip
        }
    }
}
