//! Retry engine with failure classification and circuit breaking
//!
//! Wraps fallible operations in a policy: classify each failure, decide
//! whether retrying can help, back off with kind-adjusted jittered delays,
//! and trip a per-operation circuit breaker when an operation keeps failing.
//!
//! # Architecture
//!
//! ```text
//! execute(op_id, config, f)
//!   breaker check  ->  fail fast when open
//!   attempt loop:
//!     f()
//!     success -> breaker.on_success, return
//!     failure -> classify kind
//!       non-retryable        -> stop
//!       attempts exhausted   -> stop
//!       else sleep(compute_delay) and retry
//! ```
//!
//! The outcome is always a [`RetryResult`] carrying the full attempt trail;
//! callers decide how to surface the final error.

pub mod backoff;
pub mod breaker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Clock, Sleeper};
use crate::error::{FailureClass, FailureKind};
use crate::rng::JitterRng;

pub use backoff::{BackoffStrategy, RetryConfig};
pub use breaker::{BreakerState, CircuitBreaker};

// ============================================================================
// Types
// ============================================================================

/// Why an execution ultimately failed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation's own error, after the last attempt
    #[error(transparent)]
    Operation(E),

    /// Rejected without calling the operation
    #[error("circuit breaker open for operation {operation_id}")]
    CircuitOpen { operation_id: String },
}

/// One attempt in the trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based
    pub attempt: usize,
    pub started_at: DateTime<Utc>,
    /// Delay slept before this attempt
    pub delay_before: Duration,
    /// How long the attempt itself ran
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
    pub kind: Option<FailureKind>,
}

/// Outcome of an execution, attempt trail included
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub success: bool,
    pub value: Option<T>,
    pub total_attempts: usize,
    pub attempts: Vec<RetryAttempt>,
    pub final_error: Option<RetryError<E>>,
}

impl<T, E> RetryResult<T, E> {
    /// Collapse into a plain `Result`, dropping the trail
    pub fn into_result(self) -> Result<T, RetryError<E>> {
        match (self.value, self.final_error) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(err),
            // success without value cannot be constructed by the engine
            (None, None) => Err(RetryError::CircuitOpen {
                operation_id: String::new(),
            }),
        }
    }
}

/// Aggregate failure bookkeeping per operation id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureStats {
    pub total_attempts: u64,
    pub total_failures: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub by_kind: HashMap<String, u64>,
}

// ============================================================================
// Engine
// ============================================================================

/// Shared retry engine; cheap to clone behind `Arc`
pub struct RetryEngine {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    stats: Mutex<HashMap<String, FailureStats>>,
    jitter: Mutex<JitterRng>,
}

impl RetryEngine {
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>, seed: u64) -> Self {
        Self {
            clock,
            sleeper,
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            jitter: Mutex::new(JitterRng::new(seed)),
        }
    }

    /// Run `op` under the given policy.
    ///
    /// # Arguments
    /// * `operation_id` - breaker and stats key, e.g. `"batch_commit"`
    /// * `config` - retry policy, usually one of the [`RetryConfig`] presets
    /// * `op` - the fallible operation; called once per attempt
    pub fn execute<T, E, F>(
        &self,
        operation_id: &str,
        config: &RetryConfig,
        mut op: F,
    ) -> RetryResult<T, E>
    where
        E: FailureClass + std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let now = self.clock.now();
        if !self.breaker_allows(operation_id, config, now) {
            tracing::warn!(operation_id, "circuit breaker open, failing fast");
            return RetryResult {
                success: false,
                value: None,
                total_attempts: 0,
                attempts: vec![],
                final_error: Some(RetryError::CircuitOpen {
                    operation_id: operation_id.to_string(),
                }),
            };
        }

        let mut attempts = Vec::new();
        let mut delay_before = Duration::ZERO;

        for attempt in 1..=config.max_attempts.max(1) {
            let started_at = self.clock.now();
            match op() {
                Ok(value) => {
                    let duration = elapsed(started_at, self.clock.now());
                    self.record_success(operation_id, &mut attempts, attempt, started_at,
                        delay_before, duration);
                    return RetryResult {
                        success: true,
                        value: Some(value),
                        total_attempts: attempt,
                        attempts,
                        final_error: None,
                    };
                }
                Err(err) => {
                    let kind = err.failure_kind();
                    let failed_at = self.clock.now();
                    self.record_failure(operation_id, kind, failed_at);
                    attempts.push(RetryAttempt {
                        attempt,
                        started_at,
                        delay_before,
                        duration: elapsed(started_at, failed_at),
                        success: false,
                        error: Some(err.to_string()),
                        kind: Some(kind),
                    });

                    let last = attempt == config.max_attempts.max(1);
                    if !kind.is_retryable() || last {
                        if !kind.is_retryable() {
                            tracing::info!(
                                operation_id,
                                kind = kind.as_str(),
                                attempt,
                                "failure is not retryable, giving up"
                            );
                        } else {
                            tracing::warn!(
                                operation_id,
                                attempt,
                                "retry attempts exhausted"
                            );
                        }
                        return RetryResult {
                            success: false,
                            value: None,
                            total_attempts: attempt,
                            attempts,
                            final_error: Some(RetryError::Operation(err)),
                        };
                    }

                    delay_before = {
                        let mut rng =
                            self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
                        backoff::compute_delay(config, attempt, kind, &mut rng)
                    };
                    tracing::debug!(
                        operation_id,
                        attempt,
                        kind = kind.as_str(),
                        delay_ms = delay_before.as_millis() as u64,
                        "backing off before retry"
                    );
                    self.sleeper.sleep(delay_before);
                }
            }
        }

        unreachable!("retry loop always returns from its last attempt")
    }

    /// Current breaker state for an operation, if one exists
    pub fn breaker_state(&self, operation_id: &str) -> Option<BreakerState> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_id)
            .map(|b| b.state())
    }

    /// Manually close an operation's breaker. Returns whether one existed.
    pub fn reset_breaker(&self, operation_id: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        match breakers.get_mut(operation_id) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(operation_id, "circuit breaker manually reset");
                true
            }
            None => false,
        }
    }

    /// Failure statistics for one operation
    pub fn failure_stats(&self, operation_id: &str) -> Option<FailureStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_id)
            .cloned()
    }

    /// Snapshot of all failure statistics
    pub fn all_failure_stats(&self) -> HashMap<String, FailureStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn breaker_allows(&self, operation_id: &str, config: &RetryConfig, now: DateTime<Utc>) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(operation_id.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(config.failure_threshold, config.recovery_timeout)
            })
            .allow(now)
    }

    fn record_success(
        &self,
        operation_id: &str,
        attempts: &mut Vec<RetryAttempt>,
        attempt: usize,
        started_at: DateTime<Utc>,
        delay_before: Duration,
        duration: Duration,
    ) {
        attempts.push(RetryAttempt {
            attempt,
            started_at,
            delay_before,
            duration,
            success: true,
            error: None,
            kind: None,
        });
        if let Some(breaker) = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(operation_id)
        {
            breaker.on_success();
        }
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.entry(operation_id.to_string()).or_default().total_attempts += 1;
    }

    fn record_failure(&self, operation_id: &str, kind: FailureKind, now: DateTime<Utc>) {
        if let Some(breaker) = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(operation_id)
        {
            breaker.on_failure(now);
        }
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(operation_id.to_string()).or_default();
        entry.total_attempts += 1;
        entry.total_failures += 1;
        entry.last_failure_at = Some(now);
        *entry.by_kind.entry(kind.as_str().to_string()).or_default() += 1;
    }
}

/// Wall-clock span between two instants, floored at zero
fn elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, NoopSleeper};
    use crate::store::StoreError;
    use chrono::TimeZone;

    fn engine() -> (RetryEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
        ));
        let engine = RetryEngine::new(Arc::clone(&clock) as Arc<dyn Clock>, Arc::new(NoopSleeper), 42);
        (engine, clock)
    }

    #[test]
    fn test_success_on_first_attempt() {
        let (engine, _clock) = engine();
        let result = engine.execute::<_, StoreError, _>(
            "op",
            &RetryConfig::default(),
            || Ok(7),
        );
        assert!(result.success);
        assert_eq!(result.value, Some(7));
        assert_eq!(result.total_attempts, 1);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let (engine, _clock) = engine();
        let mut calls = 0;
        let result = engine.execute("op", &RetryConfig::default(), || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Unavailable("blip".into()))
            } else {
                Ok("done")
            }
        });
        assert!(result.success);
        assert_eq!(result.total_attempts, 3);
        assert_eq!(result.attempts.len(), 3);
    }

    #[test]
    fn test_validation_failure_is_not_retried() {
        let (engine, _clock) = engine();
        let mut calls = 0;
        let result = engine.execute::<(), _, _>("op", &RetryConfig::default(), || {
            calls += 1;
            Err(StoreError::NotFound("missing".into()))
        });
        assert!(!result.success);
        assert_eq!(calls, 1);
        assert!(matches!(
            result.final_error,
            Some(RetryError::Operation(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_breaker_opens_and_recovers() {
        let (engine, clock) = engine();
        let config = RetryConfig {
            max_attempts: 1,
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(300),
            ..RetryConfig::default()
        };

        for _ in 0..2 {
            let _ = engine.execute::<(), _, _>("flaky", &config, || {
                Err(StoreError::Unavailable("down".into()))
            });
        }
        assert_eq!(engine.breaker_state("flaky"), Some(BreakerState::Open));

        // Open breaker fails fast without invoking the operation
        let mut called = false;
        let result = engine.execute::<(), StoreError, _>("flaky", &config, || {
            called = true;
            Ok(())
        });
        assert!(!called);
        assert!(matches!(
            result.final_error,
            Some(RetryError::CircuitOpen { .. })
        ));

        // After the recovery timeout a trial call goes through and closes it
        clock.advance(Duration::from_secs(301));
        let result = engine.execute::<(), StoreError, _>("flaky", &config, || Ok(()));
        assert!(result.success);
        assert_eq!(engine.breaker_state("flaky"), Some(BreakerState::Closed));
    }

    #[test]
    fn test_attempt_duration_comes_from_the_clock() {
        let (engine, clock) = engine();
        let mut calls = 0;
        let result = engine.execute("op", &RetryConfig::default(), || {
            clock.advance(Duration::from_millis(500));
            calls += 1;
            if calls < 2 {
                Err(StoreError::Unavailable("blip".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.success);
        assert_eq!(result.attempts.len(), 2);
        for attempt in &result.attempts {
            assert_eq!(attempt.duration, Duration::from_millis(500));
        }
    }

    #[test]
    fn test_stats_accumulate_by_kind() {
        let (engine, _clock) = engine();
        let config = RetryConfig {
            max_attempts: 2,
            ..RetryConfig::default()
        };
        let _ = engine.execute::<(), _, _>("op", &config, || {
            Err(StoreError::Unavailable("x".into()))
        });

        let stats = engine.failure_stats("op").unwrap();
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.by_kind.get("transient"), Some(&2));
    }

    #[test]
    fn test_reset_breaker() {
        let (engine, _clock) = engine();
        let config = RetryConfig {
            max_attempts: 1,
            failure_threshold: 1,
            ..RetryConfig::default()
        };
        let _ = engine.execute::<(), _, _>("op", &config, || {
            Err(StoreError::Unavailable("x".into()))
        });
        assert_eq!(engine.breaker_state("op"), Some(BreakerState::Open));
        assert!(engine.reset_breaker("op"));
        assert_eq!(engine.breaker_state("op"), Some(BreakerState::Closed));
    }
}
