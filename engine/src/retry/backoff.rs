//! Backoff strategies and retry configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::rng::JitterRng;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay every attempt
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay multiplies by the exponential base each attempt
    Exponential,
    /// Delay follows the Fibonacci sequence, gentler than exponential
    Fibonacci,
}

/// Retry policy for one class of operation
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    /// Ceiling applied before jitter
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Fraction of the delay added as random jitter
    pub jitter_factor: f64,
    pub strategy: BackoffStrategy,
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial call
    pub recovery_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.1,
            strategy: BackoffStrategy::Exponential,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Batch creation: few attempts, patient delays
    pub fn batch_creation() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            ..Self::default()
        }
    }

    /// Bank submission: more attempts, Fibonacci growth
    pub fn submission() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            strategy: BackoffStrategy::Fibonacci,
            ..Self::default()
        }
    }

    /// Database work: quick, aggressive retries
    pub fn database() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            ..Self::default()
        }
    }

    /// Network calls: generous attempts with linear growth
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Linear,
            ..Self::default()
        }
    }

    /// File generation and transfer
    pub fn file() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            strategy: BackoffStrategy::Fixed,
            ..Self::default()
        }
    }

    /// Look up a preset by name
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "batch_creation" => Some(Self::batch_creation()),
            "submission" => Some(Self::submission()),
            "database" => Some(Self::database()),
            "network" => Some(Self::network()),
            "file" => Some(Self::file()),
            _ => None,
        }
    }
}

/// Delay before retry `attempt` (1-based), kind-adjusted, capped, jittered.
///
/// Transient failures halve the delay, resource failures grow it by half;
/// the cap applies before jitter so the final delay never exceeds
/// `max_delay * (1 + jitter_factor)`.
pub(crate) fn compute_delay(
    config: &RetryConfig,
    attempt: usize,
    kind: FailureKind,
    rng: &mut JitterRng,
) -> Duration {
    let base = config.base_delay.as_secs_f64();
    let raw = match config.strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Exponential => {
            base * config.exponential_base.powi(attempt.saturating_sub(1).min(30) as i32)
        }
        BackoffStrategy::Fibonacci => base * fibonacci(attempt) as f64,
    };

    let modifier = match kind {
        FailureKind::Transient => 0.5,
        FailureKind::Resource => 1.5,
        _ => 1.0,
    };

    let capped = (raw * modifier).min(config.max_delay.as_secs_f64());
    let jitter = capped * config.jitter_factor * rng.next_f64();
    Duration::from_secs_f64(capped + jitter)
}

fn fibonacci(n: usize) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n.min(60) {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_progression() {
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(2), 1);
        assert_eq!(fibonacci(3), 2);
        assert_eq!(fibonacci(4), 3);
        assert_eq!(fibonacci(5), 5);
        assert_eq!(fibonacci(6), 8);
    }

    #[test]
    fn test_transient_shrinks_and_resource_grows() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        let mut rng = JitterRng::new(1);

        let transient = compute_delay(&config, 1, FailureKind::Transient, &mut rng);
        let system = compute_delay(&config, 1, FailureKind::System, &mut rng);
        let resource = compute_delay(&config, 1, FailureKind::Resource, &mut rng);

        assert_eq!(transient, Duration::from_millis(500));
        assert_eq!(system, Duration::from_secs(1));
        assert_eq!(resource, Duration::from_millis(1500));
    }

    #[test]
    fn test_cap_applies_before_jitter() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(20),
            jitter_factor: 0.1,
            ..RetryConfig::default()
        };
        let mut rng = JitterRng::new(7);

        for attempt in 1..=10 {
            let delay = compute_delay(&config, attempt, FailureKind::System, &mut rng);
            assert!(delay <= Duration::from_secs_f64(20.0 * 1.1));
        }
    }

    #[test]
    fn test_named_presets() {
        assert!(RetryConfig::named("batch_creation").is_some());
        assert!(RetryConfig::named("submission").is_some());
        assert!(RetryConfig::named("nope").is_none());
    }
}
