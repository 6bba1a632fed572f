//! Resource lock service
//!
//! Serializes batch creation over shared invoice sets. Locks are lease-based
//! rows in the store: acquisition is a compare-and-set (install the proposed
//! row only if the resource is free or its current lease has expired)
//! followed by a read-back confirmation, so two sessions racing on the same
//! resource can never both believe they won.
//!
//! # Architecture
//!
//! ```text
//! acquire(resource)
//!   loop until deadline:
//!     sweep expired leases
//!     CAS proposed row          <- store-level atomicity
//!     read back, compare lock_id <- confirmation
//!     backoff: min(base * 2^attempt, cap) + jitter
//! ```
//!
//! # Critical Invariants
//!
//! - A lock is held only while `active` and unexpired; expiry makes the
//!   resource acquirable without any sweeper having run.
//! - Release is owner-checked: only the `lock_id` that acquired may release.
//!   Force-release bypasses the check and is audit-logged at WARN.
//! - Guards release on drop, so a panicking batch build does not strand its
//!   resource until lease expiry.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Clock, Sleeper};
use crate::rng::JitterRng;
use crate::store::{LockStore, StoreError};

// ============================================================================
// Types
// ============================================================================

/// What kind of work the lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    BatchCreation,
    InvoiceProcessing,
    BatchSubmission,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::BatchCreation => "batch_creation",
            LockType::InvoiceProcessing => "invoice_processing",
            LockType::BatchSubmission => "batch_submission",
        }
    }
}

/// Stored lock row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub resource: String,
    /// Unique per acquisition, the release capability
    pub lock_id: String,
    /// Session that acquired the lock
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_type: LockType,
    /// Caller-supplied context, e.g. invoice count and batch date
    pub metadata: serde_json::Value,
    pub active: bool,
    pub modified: DateTime<Utc>,
}

impl LockRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Active and within its lease
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }
}

/// Point-in-time view of a resource's lock state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatus {
    pub resource: String,
    pub locked: bool,
    pub holder: Option<String>,
    pub lock_type: Option<LockType>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Lock service configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease length for most lock types
    pub default_ttl: Duration,
    /// Longer lease for batch creation, which does the most work
    pub batch_creation_ttl: Duration,
    /// How long acquire() keeps retrying before giving up
    pub acquisition_timeout: Duration,
    /// First backoff step
    pub backoff_base: Duration,
    /// Backoff ceiling before jitter
    pub backoff_cap: Duration,
    /// Fraction of the backoff added as random jitter
    pub jitter_factor: f64,
    /// Inactive rows older than this are purged by sweep()
    pub retention: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            batch_creation_ttl: Duration::from_secs(600),
            acquisition_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
            jitter_factor: 0.1,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl LockConfig {
    /// Lease length for a lock type
    pub fn ttl_for(&self, lock_type: LockType) -> Duration {
        match lock_type {
            LockType::BatchCreation => self.batch_creation_ttl,
            _ => self.default_ttl,
        }
    }
}

/// Lock service errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock on {resource}, held by {holder} since {held_since}")]
    Timeout {
        resource: String,
        holder: String,
        held_since: DateTime<Utc>,
    },

    #[error("force-release of {resource} requires elevated privileges")]
    PermissionDenied { resource: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Resource keys
// ============================================================================

/// Derive the canonical lock key for a set of invoices
///
/// Order-insensitive: the same invoices in any order map to the same key, so
/// two sessions batching the same set always contend on one lock.
pub fn batch_resource_key(invoice_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = invoice_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let digest = Sha256::digest(sorted.join("|").as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("batch_creation_{hex}")
}

// ============================================================================
// Service
// ============================================================================

/// Lease-based lock service over a [`LockStore`]
pub struct ResourceLockService<S: LockStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: LockConfig,
    session: String,
    jitter: Mutex<JitterRng>,
}

impl<S: LockStore> ResourceLockService<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        config: LockConfig,
        seed: u64,
    ) -> Self {
        Self {
            store,
            clock,
            sleeper,
            config,
            session: format!("session-{}", Uuid::new_v4()),
            jitter: Mutex::new(JitterRng::new(seed)),
        }
    }

    /// Override the generated session owner, mostly for tests that need two
    /// distinguishable contenders
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Acquire a lock on `resource`, retrying with capped exponential backoff
    /// until the acquisition timeout elapses.
    ///
    /// # Arguments
    /// * `resource` - canonical resource key, see [`batch_resource_key`]
    /// * `lock_type` - selects the lease length
    /// * `metadata` - caller context stored on the lock row for diagnostics
    pub fn acquire(
        &self,
        resource: &str,
        lock_type: LockType,
        metadata: serde_json::Value,
    ) -> Result<LockGuard<'_, S>, LockError> {
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.config.acquisition_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let ttl = chrono::Duration::from_std(self.config.ttl_for(lock_type))
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut attempt: u32 = 0;
        loop {
            let now = self.clock.now();
            self.store.expire_stale_locks(now)?;

            let proposed = LockRow {
                resource: resource.to_string(),
                lock_id: Uuid::new_v4().to_string(),
                owner: self.session.clone(),
                acquired_at: now,
                expires_at: now + ttl,
                lock_type,
                metadata: metadata.clone(),
                active: true,
                modified: now,
            };

            let winner = self
                .store
                .upsert_lock_if_available(proposed.clone(), now)?;
            if winner.lock_id == proposed.lock_id {
                // Read-back confirmation: the CAS result alone is not trusted
                let confirmed = self.store.read_lock(resource)?;
                if confirmed
                    .as_ref()
                    .map_or(false, |row| row.lock_id == proposed.lock_id && row.active)
                {
                    tracing::debug!(
                        resource,
                        lock_id = %proposed.lock_id,
                        owner = %self.session,
                        attempt,
                        "lock acquired"
                    );
                    return Ok(LockGuard {
                        service: self,
                        row: proposed,
                        released: false,
                    });
                }
            }

            if self.clock.now() >= deadline {
                tracing::warn!(
                    resource,
                    holder = %winner.owner,
                    "lock acquisition timed out"
                );
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    holder: winner.owner,
                    held_since: winner.acquired_at,
                });
            }

            self.sleeper.sleep(self.backoff_delay(attempt));
            attempt = attempt.saturating_add(1);
        }
    }

    /// `min(base * 2^attempt, cap)` plus proportional jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_secs_f64();
        let cap = self.config.backoff_cap.as_secs_f64();
        let exp = base * 2f64.powi(attempt.min(30) as i32);
        let capped = exp.min(cap);
        let jitter = {
            let mut rng = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
            capped * self.config.jitter_factor * rng.next_f64()
        };
        Duration::from_secs_f64(capped + jitter)
    }

    /// Current lock state of a resource, evaluated against the clock
    pub fn lock_status(&self, resource: &str) -> Result<LockStatus, LockError> {
        let now = self.clock.now();
        let row = self.store.read_lock(resource)?;
        Ok(match row {
            Some(ref r) if r.is_held(now) => LockStatus {
                resource: resource.to_string(),
                locked: true,
                holder: Some(r.owner.clone()),
                lock_type: Some(r.lock_type),
                acquired_at: Some(r.acquired_at),
                expires_at: Some(r.expires_at),
            },
            _ => LockStatus {
                resource: resource.to_string(),
                locked: false,
                holder: None,
                lock_type: None,
                acquired_at: None,
                expires_at: None,
            },
        })
    }

    /// Administrative unlock, ignores ownership. Returns the displaced row.
    ///
    /// Callers must assert elevated privileges; ordinary sessions release
    /// through their own [`LockGuard`].
    pub fn force_release(
        &self,
        resource: &str,
        elevated: bool,
    ) -> Result<Option<LockRow>, LockError> {
        if !elevated {
            return Err(LockError::PermissionDenied {
                resource: resource.to_string(),
            });
        }
        let displaced = self.store.force_release_lock(resource)?;
        if let Some(ref row) = displaced {
            tracing::warn!(
                resource,
                displaced_owner = %row.owner,
                lock_id = %row.lock_id,
                "lock force-released"
            );
        }
        Ok(displaced)
    }

    /// Expire stale leases and purge inactive rows past retention.
    /// Returns (expired, purged).
    pub fn sweep(&self) -> Result<(usize, usize), LockError> {
        let now = self.clock.now();
        let expired = self.store.expire_stale_locks(now)?;
        let cutoff = now
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let purged = self.store.purge_inactive_before(cutoff)?;
        if expired > 0 || purged > 0 {
            tracing::info!(expired, purged, "lock sweep completed");
        }
        Ok((expired, purged))
    }

    fn release_row(&self, row: &LockRow) -> Result<bool, LockError> {
        Ok(self.store.release_lock(&row.resource, &row.lock_id)?)
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Held lock, released explicitly or on drop
pub struct LockGuard<'a, S: LockStore> {
    service: &'a ResourceLockService<S>,
    row: LockRow,
    released: bool,
}

impl<S: LockStore> LockGuard<'_, S> {
    pub fn resource(&self) -> &str {
        &self.row.resource
    }

    pub fn lock_id(&self) -> &str {
        &self.row.lock_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.row.expires_at
    }

    /// Release the lock, reporting whether this guard still held it
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.service.release_row(&self.row)
    }
}

impl<S: LockStore> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.service.release_row(&self.row) {
                tracing::warn!(
                    resource = %self.row.resource,
                    lock_id = %self.row.lock_id,
                    error = %err,
                    "failed to release lock on drop, lease will expire"
                );
            }
        }
    }
}
