//! Protected batch creation
//!
//! # Architecture
//!
//! ```text
//! create_batch_with_protection(candidate)
//!   1. derive resource key from the invoice set
//!   2. acquire the batch-creation lock
//!   3. re-read invoices with write intent
//!   4. availability validation (status, amounts)
//!   5. conflict detection          -> critical conflicts block
//!   6. mandate sequence validation -> rejections block
//!   7. commit the batch, retried under the batch-creation policy
//!   8. record mandate usage        -> failure triggers automatic rollback
//!   9. release the lock, publish BatchCreated
//! ```
//!
//! Holding the lock across steps 3-8 is what closes the check-then-act race:
//! no concurrent session can validate against state this session is about to
//! change.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::conflict::{ConflictDetector, ConflictReport};
use crate::core::{Clock, Sleeper, SystemClock, ThreadSleeper};
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink, NullSink};
use crate::lock::{batch_resource_key, LockStatus, LockType, ResourceLockService};
use crate::models::{BatchCandidate, BatchRecord, BatchStatus, SequenceType};
use crate::retry::{BreakerState, RetryConfig, RetryEngine, RetryError, RetryResult};
use crate::rollback::{
    RollbackManager, RollbackOperation, RollbackOutcome, RollbackReason, RollbackScope,
    RollbackStatus,
};
use crate::sequence::{
    MandateLifecycle, MandateSequenceValidator, SequenceValidation, TransactionContext,
};
use crate::store::EngineStore;

/// What a successful protected creation returns
#[derive(Debug, Clone)]
pub struct BatchCreation {
    pub batch_id: String,
    /// Euro cents
    pub total_amount: i64,
    pub invoice_count: usize,
    /// Non-blocking mandate warnings surfaced during validation
    pub warnings: Vec<String>,
}

/// Coordinated front door for batch creation and recovery
pub struct BatchOrchestrator<S: EngineStore> {
    store: Arc<S>,
    locks: ResourceLockService<S>,
    detector: ConflictDetector<S>,
    validator: MandateSequenceValidator<S>,
    retry: RetryEngine,
    rollback: RollbackManager<S>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: EngineStore + 'static> BatchOrchestrator<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        let locks = ResourceLockService::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&sleeper),
            config.lock.clone(),
            config.rng_seed,
        );
        let detector = ConflictDetector::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.conflict.clone(),
        );
        let validator = MandateSequenceValidator::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.mandate.clone(),
        );
        let retry = RetryEngine::new(
            Arc::clone(&clock),
            Arc::clone(&sleeper),
            config.rng_seed.wrapping_add(1),
        );
        let rollback = RollbackManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&events),
        );
        Self {
            store,
            locks,
            detector,
            validator,
            retry,
            rollback,
            events,
            clock,
            config,
        }
    }

    /// Production wiring: system clock, real sleeps, no event sink
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(
            store,
            Arc::new(SystemClock),
            Arc::new(ThreadSleeper),
            Arc::new(NullSink),
            EngineConfig::default(),
        )
    }

    // ========================================================================
    // Protected creation
    // ========================================================================

    /// Create a batch under the full protection pipeline.
    ///
    /// # Arguments
    /// * `candidate` - proposed date, scheme, and invoice entries
    /// * `initiated_by` - session or user recorded on lock metadata and any
    ///   rollback this creation triggers
    pub fn create_batch_with_protection(
        &self,
        candidate: &BatchCandidate,
        initiated_by: &str,
    ) -> Result<BatchCreation, EngineError> {
        if candidate.entries.is_empty() {
            return Err(EngineError::Validation {
                errors: vec!["batch candidate has no entries".to_string()],
            });
        }

        let ids = candidate.invoice_ids();
        let resource = batch_resource_key(&ids);
        let guard = self.locks.acquire(
            &resource,
            LockType::BatchCreation,
            serde_json::json!({
                "invoice_count": ids.len(),
                "batch_date": candidate.batch_date,
                "batch_type": candidate.batch_type,
                "initiated_by": initiated_by,
            }),
        )?;

        // Everything below runs under the lock
        let result = self.build_under_lock(candidate, &ids, initiated_by);

        if let Err(err) = guard.release() {
            tracing::warn!(%resource, error = %err, "lock release failed after creation");
        }

        let creation = result?;
        self.events.publish(&DomainEvent::BatchCreated {
            batch_id: creation.batch_id.clone(),
            total_amount: creation.total_amount,
            invoice_count: creation.invoice_count,
        });
        tracing::info!(
            batch_id = %creation.batch_id,
            total_amount_cents = creation.total_amount,
            invoice_count = creation.invoice_count,
            "batch created under protection"
        );
        Ok(creation)
    }

    fn build_under_lock(
        &self,
        candidate: &BatchCandidate,
        ids: &[String],
        initiated_by: &str,
    ) -> Result<BatchCreation, EngineError> {
        // Re-read with write intent now that the lock is held
        let invoices = self.store.invoices_for_update(ids)?;
        let by_id: HashMap<&str, _> = invoices.iter().map(|i| (i.id.as_str(), i)).collect();

        let mut errors = Vec::new();
        for entry in &candidate.entries {
            match by_id.get(entry.invoice_id.as_str()) {
                None => errors.push(format!("invoice {} not found", entry.invoice_id)),
                Some(invoice) => {
                    if !invoice.status.is_collectable() {
                        errors.push(format!(
                            "invoice {} is {}, not collectable",
                            invoice.id,
                            invoice.status.as_str()
                        ));
                    }
                    let delta = (entry.amount - invoice.outstanding_amount).abs();
                    if delta > self.config.conflict.amount_tolerance {
                        errors.push(format!(
                            "invoice {}: requested {} cents, {} cents outstanding",
                            invoice.id, entry.amount, invoice.outstanding_amount
                        ));
                    }
                }
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation { errors });
        }

        let report = self.detector.report(candidate);
        if !report.can_proceed {
            return Err(EngineError::ConflictDetected { report });
        }

        // Mandate sequence validation, one pass per entry
        let mut sequences: HashMap<String, SequenceType> = HashMap::new();
        let mut warnings = Vec::new();
        let mut rejections = Vec::new();
        let context = TransactionContext::default();
        for entry in &candidate.entries {
            let validation = self.validator.validate_for_transaction(
                &entry.mandate_reference,
                entry.amount,
                &context,
            )?;
            for warning in &validation.warnings {
                warnings.push(format!("{}: {warning}", entry.mandate_reference));
            }
            match validation.recommended {
                Some(seq) if validation.is_valid => {
                    sequences.insert(entry.mandate_reference.clone(), seq);
                }
                _ => {
                    for error in &validation.errors {
                        rejections.push(format!("{}: {error}", entry.mandate_reference));
                    }
                    if validation.errors.is_empty() {
                        rejections.push(format!(
                            "{}: no sequence type available",
                            entry.mandate_reference
                        ));
                    }
                }
            }
        }
        if !rejections.is_empty() {
            return Err(EngineError::MandateRejected { errors: rejections });
        }

        let batch_date = candidate.batch_date.ok_or_else(|| EngineError::Validation {
            errors: vec!["batch has no collection date".to_string()],
        })?;
        let record = BatchRecord {
            id: format!(
                "DD-BATCH-{}",
                &Uuid::new_v4().simple().to_string()[..10].to_uppercase()
            ),
            batch_date,
            batch_type: candidate.batch_type,
            status: BatchStatus::Draft,
            description: candidate
                .description
                .clone()
                .unwrap_or_else(|| format!("Direct debit batch {batch_date}")),
            entries: candidate.entries.clone(),
            total_amount: candidate.total_amount(),
            entry_count: candidate.entries.len(),
            created_at: self.clock.now(),
        };

        // Commit, retried under the batch-creation policy
        let commit = self.retry.execute("batch_commit", &self.config.retry, || {
            self.store.insert_batch(&record)
        });
        if !commit.success {
            return Err(match commit.final_error {
                Some(RetryError::Operation(err)) => EngineError::Store(err),
                _ => EngineError::CircuitOpen {
                    operation_id: "batch_commit".to_string(),
                },
            });
        }

        // Record mandate usage; a failure here leaves a batch whose
        // mandates were never charged, so the batch is rolled back
        for entry in &candidate.entries {
            let sequence = match sequences.get(&entry.mandate_reference) {
                Some(seq) => *seq,
                None => continue,
            };
            if let Err(err) = self.validator.record_usage(
                &entry.mandate_reference,
                sequence,
                entry.amount,
                &entry.invoice_id,
                &record.id,
            ) {
                tracing::error!(
                    batch_id = %record.id,
                    mandate = %entry.mandate_reference,
                    error = %err,
                    "usage recording failed, rolling the batch back"
                );
                let outcome = self.rollback.initiate_rollback(
                    &record.id,
                    RollbackReason::TechnicalError,
                    RollbackScope::FullBatch,
                    None,
                    initiated_by,
                );
                let mut rollback_errors =
                    vec![format!("usage recording for {}: {err}", entry.mandate_reference)];
                rollback_errors.extend(outcome.errors);
                return Err(EngineError::RolledBack {
                    batch_id: record.id.clone(),
                    operation_id: outcome
                        .operation_id
                        .unwrap_or_else(|| "unpersisted".to_string()),
                    errors: rollback_errors,
                });
            }
        }

        Ok(BatchCreation {
            batch_id: record.id,
            total_amount: record.total_amount,
            invoice_count: record.entry_count,
            warnings,
        })
    }

    // ========================================================================
    // Subsystem pass-throughs
    // ========================================================================

    /// Read-only conflict report for a candidate
    pub fn detect_conflicts(&self, candidate: &BatchCandidate) -> ConflictReport {
        self.detector.report(candidate)
    }

    /// Sequence derivation for a mandate
    pub fn determine_sequence_type(
        &self,
        mandate_id: &str,
        context: &TransactionContext,
    ) -> Result<SequenceValidation, EngineError> {
        Ok(self.validator.determine_sequence_type(mandate_id, context)?)
    }

    /// Full mandate validation for an intended collection
    pub fn validate_mandate(
        &self,
        mandate_id: &str,
        amount: i64,
        context: &TransactionContext,
    ) -> Result<SequenceValidation, EngineError> {
        Ok(self
            .validator
            .validate_for_transaction(mandate_id, amount, context)?)
    }

    /// Lifecycle assessment of a mandate
    pub fn mandate_lifecycle(&self, mandate_id: &str) -> Result<MandateLifecycle, EngineError> {
        Ok(self.validator.lifecycle(mandate_id)?)
    }

    /// Manually initiated rollback
    pub fn initiate_rollback(
        &self,
        batch_id: &str,
        reason: RollbackReason,
        scope: RollbackScope,
        affected: Option<&[String]>,
        initiated_by: &str,
    ) -> RollbackOutcome {
        self.rollback
            .initiate_rollback(batch_id, reason, scope, affected, initiated_by)
    }

    /// Operation, compensations, and audit trail
    pub fn rollback_status(
        &self,
        operation_id: &str,
    ) -> Result<Option<RollbackStatus>, EngineError> {
        Ok(self.rollback.rollback_status(operation_id)?)
    }

    /// Recent rollback operations, newest first
    pub fn list_rollbacks(
        &self,
        days_back: i64,
        batch_id: Option<&str>,
    ) -> Result<Vec<RollbackOperation>, EngineError> {
        Ok(self.rollback.list_operations(days_back, batch_id)?)
    }

    /// Lock state of a resource
    pub fn lock_status(&self, resource: &str) -> Result<LockStatus, EngineError> {
        Ok(self.locks.lock_status(resource)?)
    }

    /// Administrative unlock. `elevated` must be set by an operator path;
    /// without it the call is refused.
    pub fn force_release_lock(&self, resource: &str, elevated: bool) -> Result<bool, EngineError> {
        Ok(self.locks.force_release(resource, elevated)?.is_some())
    }

    /// Expire stale leases and purge old rows; returns (expired, purged)
    pub fn sweep_locks(&self) -> Result<(usize, usize), EngineError> {
        Ok(self.locks.sweep()?)
    }

    /// Run an arbitrary operation under a retry policy
    pub fn execute_with_retry<T, E, F>(
        &self,
        operation_id: &str,
        config: &RetryConfig,
        op: F,
    ) -> RetryResult<T, E>
    where
        E: crate::error::FailureClass + std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        self.retry.execute(operation_id, config, op)
    }

    /// Breaker state for an operation id
    pub fn breaker_state(&self, operation_id: &str) -> Option<BreakerState> {
        self.retry.breaker_state(operation_id)
    }

    /// Manually close an operation's breaker
    pub fn reset_breaker(&self, operation_id: &str) -> bool {
        self.retry.reset_breaker(operation_id)
    }
}
