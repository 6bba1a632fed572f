//! Circuit breaker
//!
//! One breaker per operation id. Closed passes calls through; reaching the
//! failure threshold opens it, rejecting calls outright until the recovery
//! timeout elapses. The first call after recovery runs half-open as a trial:
//! success closes the breaker, failure re-opens it immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Clock-driven breaker; the caller supplies `now` on every transition
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a call may proceed at `now`. An open breaker whose recovery
    /// timeout has elapsed transitions to half-open and admits one trial.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let recovered = self.last_failure_at.map_or(true, |at| {
                    (now - at).to_std().unwrap_or(Duration::ZERO) >= self.recovery_timeout
                });
                if recovered {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure_at = None;
    }

    pub fn on_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_failure_at = Some(now);
        if self.state == BreakerState::HalfOpen || self.failure_count >= self.failure_threshold {
            self.state = BreakerState::Open;
        }
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure_at = None;
    }
}
