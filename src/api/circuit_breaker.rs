//! Global circuit breaker for one upstream.
//!
//! The breaker has two observable states:
//!
//! - **Closed**: calls are allowed.
//! - **Open**: calls are rejected until `tripped_until` has passed.
//!
//! There is no half-open probing. Once the trip window elapses the next call
//! is treated as a normal attempt. Any success resets the breaker.
//!
//! The breaker itself is not synchronized; the fetcher keeps it behind the
//! same lock as the proxy cooldown table so outcome updates are atomic.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default number of consecutive failed fetches before the circuit opens.
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default time the circuit stays open.
const DEFAULT_TRIP_DURATION: Duration = Duration::from_secs(120);

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed.
    Closed,
    /// Upstream is failing - requests are blocked.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open.
    pub trip_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            trip_duration: DEFAULT_TRIP_DURATION,
        }
    }
}

impl From<&crate::config::FetcherConfig> for CircuitBreakerConfig {
    fn from(config: &crate::config::FetcherConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            trip_duration: config.trip_duration(),
        }
    }
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    /// `None` when not tripped.
    tripped_until: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default settings.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            consecutive_failures: 0,
            tripped_until: None,
            config,
        }
    }

    /// Reject the call if the circuit is open at `now`.
    ///
    /// A rejection is not itself counted as a failure.
    pub fn guard(&self, now: Instant) -> Result<()> {
        match self.tripped_until {
            Some(until) if now < until => {
                let remaining = until - now;
                Err(Error::CircuitOpen {
                    retry_in_secs: remaining.as_millis().div_ceil(1000) as u64,
                })
            }
            _ => Ok(()),
        }
    }

    /// Record a clean success: clears the failure count and any trip.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 || self.tripped_until.is_some() {
            debug!(
                "Circuit breaker: success after {} failures, resetting",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.tripped_until = None;
    }

    /// Record a failed fetch. Returns `true` if this failure tripped the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.config.failure_threshold {
            let until = now + self.config.trip_duration;
            warn!(
                "Circuit breaker: opening after {} consecutive failures for {}s",
                self.consecutive_failures,
                self.config.trip_duration.as_secs()
            );
            self.consecutive_failures = 0;
            self.tripped_until = Some(until);
            true
        } else {
            debug!(
                "Circuit breaker: failure ({}/{})",
                self.consecutive_failures, self.config.failure_threshold
            );
            false
        }
    }

    /// Manually close the circuit.
    pub fn reset(&mut self) {
        info!("Circuit breaker: manual reset");
        self.consecutive_failures = 0;
        self.tripped_until = None;
    }

    /// Get the state at `now`.
    pub fn state(&self, now: Instant) -> CircuitState {
        match self.tripped_until {
            Some(until) if now < until => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    /// The instant the circuit closes again, if it is open at `now`.
    pub fn tripped_until(&self, now: Instant) -> Option<Instant> {
        self.tripped_until.filter(|until| now < *until)
    }

    /// Get the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
