//! Cooldown gate used to space out retries.

use rand::Rng;
use std::time::{Duration, Instant};

/// A stateless retry gate: arm it with a duration, then ask whether the
/// cooldown is still running. Once the deadline passes the timer disarms
/// itself.
#[derive(Debug, Default)]
pub struct BackoffTimer {
    deadline: Option<Instant>,
}

impl BackoffTimer {
    /// Create a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline `duration` from now, replacing any existing one.
    pub fn start(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    /// Whether the cooldown is still running. Auto-disarms once the
    /// deadline has passed.
    pub fn active(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                self.deadline = None;
                false
            }
            None => false,
        }
    }

    /// Time left on the cooldown, if armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }
}

/// Randomize a retry delay to 50–150% of the base so concurrent controllers
/// sharing one connection do not reconnect in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    base.mul_f64(factor)
}
