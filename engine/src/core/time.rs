//! Time abstractions
//!
//! All wall-clock reads and all sleeping go through injectable traits so the
//! engine is deterministic under test: lease expiry, mandate age checks, and
//! circuit-breaker recovery windows can be driven by a `ManualClock` instead
//! of real time, and retry/backoff waits can be swallowed by a `NoopSleeper`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant in UTC
    fn now(&self) -> DateTime<Utc>;

    /// Current business date (UTC)
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock implementation used in production
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
///
/// # Example
/// ```
/// use sepa_batch_engine::core::{Clock, ManualClock};
/// use chrono::{TimeZone, Utc};
///
/// let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
/// clock.advance(std::time::Duration::from_secs(60));
/// assert_eq!(clock.now().to_rfc3339(), "2025-06-02T09:01:00+00:00");
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Blocking wait used between lock-acquisition and retry attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real thread sleep, used in production
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Sleeper that returns immediately; keeps retry tests fast
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) {}
}

/// Sleeper that advances a `ManualClock` instead of blocking
///
/// Lets timeout loops (lock acquisition, breaker recovery) run to their
/// deadline instantly under test.
#[derive(Debug)]
pub struct AdvancingSleeper {
    clock: std::sync::Arc<ManualClock>,
}

impl AdvancingSleeper {
    pub fn new(clock: std::sync::Arc<ManualClock>) -> Self {
        Self { clock }
    }
}

impl Sleeper for AdvancingSleeper {
    fn sleep(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        clock.advance(Duration::from_secs(3600));

        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2025, 1, 15, 13, 0, 0).unwrap()
        );
        assert_eq!(
            clock.today(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let later = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();
        clock.set(later);

        assert_eq!(clock.now(), later);
    }
}
