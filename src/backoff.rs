//! Exponential backoff for polling the container runtime.

use std::time::{Duration, Instant};

/// Doubling delay between polls, capped at `max`, with an overall deadline.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    max: Duration,
    current: Duration,
    deadline: Instant,
}

impl PollBackoff {
    /// Creates a backoff that starts at `initial`, caps at `max` and gives up
    /// once `budget` has elapsed.
    pub fn new(initial: Duration, max: Duration, budget: Duration) -> Self {
        Self {
            max,
            current: initial,
            deadline: Instant::now() + budget,
        }
    }

    /// Returns the delay to sleep before the next poll, or `None` once the
    /// budget is spent. The returned delay never overshoots the deadline.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        let delay = self.current.min(remaining);
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }
}
