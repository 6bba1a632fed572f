//! Deterministic random number generation for backoff jitter
//!
//! Jitter exists to de-synchronize concurrent retriers, not to be
//! cryptographically strong, so a seeded xorshift64* generator is enough.
//! Seeding it makes every retry schedule reproducible: the same seed yields
//! the same jittered delays, which matters when replaying a contention
//! incident from logs.

use serde::{Deserialize, Serialize};

/// Seeded xorshift64* generator
///
/// # Example
/// ```
/// use sepa_batch_engine::rng::JitterRng;
///
/// let mut a = JitterRng::new(42);
/// let mut b = JitterRng::new(42);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterRng {
    state: u64,
}

impl JitterRng {
    /// Create a generator from a seed (zero is remapped, xorshift requirement)
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Next raw 64-bit value
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Next value in `[0.0, 1.0)`
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / ((1u64 << 53) as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_seed_is_remapped() {
        let mut rng = JitterRng::new(0);
        // Must not get stuck at zero state
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn test_next_f64_in_unit_interval() {
        let mut rng = JitterRng::new(9001);
        for _ in 0..1000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "value {v} outside [0, 1)");
        }
    }

    #[test]
    fn test_deterministic_sequence() {
        let mut a = JitterRng::new(777);
        let mut b = JitterRng::new(777);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }
}
