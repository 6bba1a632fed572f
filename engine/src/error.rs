//! Engine error taxonomy and failure classification
//!
//! Every error that can reach the retry engine classifies into a sealed
//! [`FailureKind`]. The kind decides retry policy: transient and resource
//! failures are retried (with shortened and lengthened backoff
//! respectively), system failures are retried cautiously, and validation,
//! business, and permanent failures are never retried because repeating the
//! call cannot change the outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::ConflictReport;
use crate::lock::LockError;
use crate::store::StoreError;

/// Sealed failure classification driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Short-lived glitch, retry quickly
    Transient,
    /// Resource exhaustion or contention, retry with longer backoff
    Resource,
    /// Input is wrong, retrying cannot help
    Validation,
    /// Unexpected internal failure, retry cautiously
    System,
    /// A business rule said no, retrying cannot help
    Business,
    /// Known-permanent failure, never retry
    Permanent,
}

impl FailureKind {
    /// Whether the retry engine may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Transient | FailureKind::Resource | FailureKind::System
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Resource => "resource",
            FailureKind::Validation => "validation",
            FailureKind::System => "system",
            FailureKind::Business => "business",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// Implemented by every error type the retry engine can wrap
pub trait FailureClass {
    fn failure_kind(&self) -> FailureKind;
}

impl FailureClass for StoreError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            StoreError::Unavailable(_) => FailureKind::Transient,
            StoreError::Contention(_) => FailureKind::Resource,
            StoreError::NotFound(_) => FailureKind::Validation,
            StoreError::Corrupted(_) => FailureKind::System,
        }
    }
}

impl FailureClass for LockError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            LockError::Timeout { .. } => FailureKind::Resource,
            LockError::PermissionDenied { .. } => FailureKind::Permanent,
            LockError::Store(err) => err.failure_kind(),
        }
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("batch creation blocked: {}", report.summary)]
    ConflictDetected { report: ConflictReport },

    #[error("validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("mandate validation rejected the batch: {}", errors.join("; "))]
    MandateRejected { errors: Vec<String> },

    #[error("circuit breaker open for operation {operation_id}")]
    CircuitOpen { operation_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("batch {batch_id} was rolled back ({operation_id}): {}", errors.join("; "))]
    RolledBack {
        batch_id: String,
        operation_id: String,
        errors: Vec<String>,
    },
}

impl FailureClass for EngineError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Lock(err) => err.failure_kind(),
            EngineError::ConflictDetected { .. } => FailureKind::Business,
            EngineError::Validation { .. } => FailureKind::Validation,
            EngineError::MandateRejected { .. } => FailureKind::Business,
            EngineError::CircuitOpen { .. } => FailureKind::Resource,
            EngineError::Store(err) => err.failure_kind(),
            EngineError::RolledBack { .. } => FailureKind::System,
        }
    }
}
