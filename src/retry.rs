//! Reconnect backoff with jitter support.
//!
//! Stream consumers are expected to reconnect after a hangup, but not in a
//! tight loop. Delays grow per failure class:
//!
//! - network-level failures back off linearly, 250ms per attempt up to 16s
//! - HTTP errors back off exponentially from 5s up to 320s
//! - rate limiting backs off exponentially from 60s up to 15 minutes
//!
//! Switching class restarts the sequence of the new class. Call
//! [`ReconnectBackoff::reset`] once a connection delivers data again.

use crate::error::StreamError;
use crate::types::StreamEvent;
use rand::Rng;
use std::time::Duration;

/// Why a connection has to be re-established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Failure {
    /// TCP/IP level trouble: hangups, silent peers, refused connections.
    Network,
    /// The server answered with an error status or undecodable data.
    Http,
    /// The server asked the client to slow down (420 or 429).
    RateLimited,
}

impl Failure {
    /// Classify a stream event. Only terminal events call for a reconnect.
    pub fn from_event(event: &StreamEvent) -> Option<Failure> {
        match event {
            StreamEvent::Hangup | StreamEvent::HeartbeatTimeout => Some(Failure::Network),
            StreamEvent::DecodeError => Some(Failure::Http),
            StreamEvent::Message(_) | StreamEvent::Timeout => None,
        }
    }

    /// Classify a connection error. `None` if retrying cannot help.
    pub fn from_error(err: &StreamError) -> Option<Failure> {
        if !err.is_retryable() {
            return None;
        }
        match err {
            StreamError::RateLimited { .. } => Some(Failure::RateLimited),
            StreamError::ServerError { .. } => Some(Failure::Http),
            _ => Some(Failure::Network),
        }
    }
}

/// Backoff state for one logical stream.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    pub network_step: Duration,
    pub network_max: Duration,
    pub http_initial: Duration,
    pub http_max: Duration,
    pub rate_limit_initial: Duration,
    pub rate_limit_max: Duration,
    /// Jitter applied to every delay (default: none)
    pub jitter: JitterMode,
    last: Option<(Failure, Duration)>,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            network_step: Duration::from_millis(250),
            network_max: Duration::from_secs(16),
            http_initial: Duration::from_secs(5),
            http_max: Duration::from_secs(320),
            rate_limit_initial: Duration::from_secs(60),
            rate_limit_max: Duration::from_secs(15 * 60),
            jitter: JitterMode::None,
            last: None,
        }
    }
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set jitter mode
    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt after `failure`.
    pub fn next_delay(&mut self, failure: Failure) -> Duration {
        let previous = match self.last {
            Some((kind, delay)) if kind == failure => Some(delay),
            _ => None,
        };

        let base = match (failure, previous) {
            (Failure::Network, None) => self.network_step,
            (Failure::Network, Some(d)) => (d + self.network_step).min(self.network_max),
            (Failure::Http, None) => self.http_initial,
            (Failure::Http, Some(d)) => (d * 2).min(self.http_max),
            (Failure::RateLimited, None) => self.rate_limit_initial,
            (Failure::RateLimited, Some(d)) => (d * 2).min(self.rate_limit_max),
        };

        self.last = Some((failure, base));
        apply_jitter(base, &self.jitter)
    }

    /// Delay before retrying after a connection error, honouring a
    /// server-supplied `Retry-After`. `None` if the error is permanent.
    pub fn delay_for_error(&mut self, err: &StreamError) -> Option<Duration> {
        let failure = Failure::from_error(err)?;
        let delay = self.next_delay(failure);
        match err {
            StreamError::RateLimited {
                retry_after: Some(after),
            } => Some(delay.max(*after)),
            _ => Some(delay),
        }
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Jitter mode for retry backoff (following AWS SDK patterns).
#[derive(Clone, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Full jitter: random delay between 0 and calculated backoff
    Full,
    /// Equal jitter: half fixed + half random
    Equal,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    match mode {
        JitterMode::None => delay,
        JitterMode::Full => {
            Duration::from_secs_f64(rand::thread_rng().gen::<f64>() * delay.as_secs_f64())
        }
        JitterMode::Equal => {
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rand::thread_rng().gen::<f64>() * half)
        }
    }
}
