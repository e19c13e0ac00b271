//! Deadline tracking for the idle and heartbeat windows.

use std::time::Duration;
use tokio::time::Instant;

/// A resettable window. `None` means the timer never expires.
#[derive(Debug, Clone)]
pub struct ExpiryTimer {
    period: Option<Duration>,
    started: Instant,
}

impl ExpiryTimer {
    pub fn new(period: Option<Duration>) -> Self {
        Self {
            period,
            started: Instant::now(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Start a fresh window from now.
    pub fn reset(&mut self) {
        self.started = Instant::now();
    }

    /// Time left in the current window, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.period
            .map(|period| period.saturating_sub(self.started.elapsed()))
    }

    /// Whether the window has run out. An expired timer is reset as part
    /// of the check, so the next window starts immediately.
    pub fn expired(&mut self) -> bool {
        match self.period {
            Some(period) if self.started.elapsed() >= period => {
                self.reset();
                true
            }
            _ => false,
        }
    }
}
