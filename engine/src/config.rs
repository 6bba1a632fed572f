//! Engine configuration
//!
//! One struct bundling every subsystem's tunables. Defaults match the
//! production values the thresholds were tuned to; tests override individual
//! fields.

use crate::conflict::ConflictLimits;
use crate::lock::LockConfig;
use crate::retry::RetryConfig;
use crate::sequence::MandateRules;

/// Aggregated configuration for the batch orchestrator
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lock: LockConfig,
    pub conflict: ConflictLimits,
    pub mandate: MandateRules,
    /// Policy for the batch commit write
    pub retry: RetryConfig,
    /// Seeds the jitter generators; fixed seed makes runs reproducible
    pub rng_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            conflict: ConflictLimits::default(),
            mandate: MandateRules::default(),
            retry: RetryConfig::batch_creation(),
            rng_seed: 0x5EBA_0001,
        }
    }
}
