//! Rollback and compensation manager
//!
//! Unwinds a failed or rejected batch: the batch is marked rolled back,
//! settled invoices revert to unpaid, payment entries are cancelled, member
//! payment flags are cleared, and mandate usage counters are decremented.
//! Once the unwind succeeds, a compensation transaction is opened per
//! affected invoice, its action carried out, and the per-transaction outcome
//! recorded. Every phase is written to an append-only audit trail.
//!
//! # Critical Invariants
//!
//! - Initiation never returns `Err`: the outcome always reports what
//!   happened, and partial failures are accumulated per step instead of
//!   aborting the remaining steps. A rollback that stops halfway leaves the
//!   books in a worse state than one that pushes through and reports what
//!   it could not undo.
//! - Scope violations (partial set not in the batch, single-transaction with
//!   more than one invoice) are rejected before any write.
//! - Usage counters are decremented through the store's floor-at-zero
//!   primitive and can never go negative.

pub mod types;

use std::sync::Arc;

use uuid::Uuid;

use crate::core::Clock;
use crate::events::{DomainEvent, EventSink};
use crate::models::InvoiceStatus;
use crate::store::{BatchStore, InvoiceStore, MandateStore, RecoveryStore, StoreError};

pub use types::{
    AuditEntry, CompensationAction, CompensationStatus, CompensationTransaction, OperationStatus,
    RollbackOperation, RollbackOutcome, RollbackReason, RollbackScope, RollbackStatus,
};

/// Rollback manager over batch, invoice, mandate, and recovery stores
pub struct RollbackManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl<S> RollbackManager<S>
where
    S: BatchStore + InvoiceStore + MandateStore + RecoveryStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Initiate a rollback of `batch_id`.
    ///
    /// # Arguments
    /// * `scope` - how much of the batch to unwind
    /// * `affected` - required for partial and single-transaction scopes,
    ///   ignored otherwise
    /// * `initiated_by` - recorded on the operation and every audit entry
    pub fn initiate_rollback(
        &self,
        batch_id: &str,
        reason: RollbackReason,
        scope: RollbackScope,
        affected: Option<&[String]>,
        initiated_by: &str,
    ) -> RollbackOutcome {
        let now = self.clock.now();

        let batch = match self.store.batch(batch_id) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                return rejected(batch_id, vec![format!("batch {batch_id} not found")]);
            }
            Err(err) => {
                return rejected(batch_id, vec![format!("cannot load batch: {err}")]);
            }
        };

        // (invoice_id, amount) pairs covered by the scope
        let targets = match self.resolve_scope(&batch, scope, affected) {
            Ok(targets) => targets,
            Err(message) => return rejected(batch_id, vec![message]),
        };

        let total_amount: i64 = targets.iter().map(|(_, amount)| amount).sum();
        let operation_id = format!(
            "RB-{batch_id}-{}",
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let mut operation = RollbackOperation {
            operation_id: operation_id.clone(),
            batch_id: batch_id.to_string(),
            reason,
            scope,
            initiated_by: initiated_by.to_string(),
            initiated_at: now,
            affected_invoices: targets.iter().map(|(id, _)| id.clone()).collect(),
            affected_members: vec![],
            total_amount,
            status: OperationStatus::Pending,
            completed_at: None,
            errors: vec![],
        };

        if let Err(err) = self.store.insert_rollback_operation(&operation) {
            return rejected(batch_id, vec![format!("cannot persist operation: {err}")]);
        }
        self.audit(
            &operation_id,
            initiated_by,
            "rollback_initiated",
            serde_json::json!({
                "batch_id": batch_id,
                "reason": reason.as_str(),
                "scope": scope.as_str(),
                "invoice_count": targets.len(),
                "total_amount_cents": total_amount,
            }),
        );

        tracing::info!(
            operation_id = %operation_id,
            batch_id,
            reason = reason.as_str(),
            scope = scope.as_str(),
            invoice_count = targets.len(),
            "rollback initiated"
        );

        let mut errors = Vec::new();
        let members = self.execute_steps(&operation, &targets, &mut errors);
        self.audit(
            &operation_id,
            initiated_by,
            "rollback_steps_executed",
            serde_json::json!({ "errors": errors.clone(), "members": members.clone() }),
        );
        // Compensations only make sense over a fully unwound batch
        if errors.is_empty() {
            self.create_compensations(&operation, &targets, reason, &mut errors);
        }

        let success = errors.is_empty();
        operation.affected_members = members;
        operation.errors = errors.clone();
        operation.status = if success {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        };
        operation.completed_at = Some(self.clock.now());
        if let Err(err) = self.store.update_rollback_operation(&operation) {
            errors.push(format!("cannot finalize operation: {err}"));
        }

        if success {
            self.audit(
                &operation_id,
                initiated_by,
                "rollback_completed",
                serde_json::json!({ "total_amount_cents": total_amount }),
            );
            self.events.publish(&DomainEvent::RollbackCompleted {
                operation_id: operation_id.clone(),
                batch_id: batch_id.to_string(),
                total_amount,
                invoice_count: targets.len(),
            });
        } else {
            self.audit(
                &operation_id,
                initiated_by,
                "rollback_failed",
                serde_json::json!({ "errors": errors.clone() }),
            );
            self.events.publish(&DomainEvent::RollbackFailed {
                operation_id: operation_id.clone(),
                batch_id: batch_id.to_string(),
                errors: errors.clone(),
            });
            tracing::error!(
                operation_id = %operation_id,
                batch_id,
                error_count = errors.len(),
                "rollback finished with errors"
            );
        }

        RollbackOutcome {
            success,
            operation_id: Some(operation_id),
            batch_id: batch_id.to_string(),
            affected_invoice_count: targets.len(),
            total_amount,
            errors,
        }
    }

    /// Operation with its compensations and audit trail
    pub fn rollback_status(
        &self,
        operation_id: &str,
    ) -> Result<Option<RollbackStatus>, StoreError> {
        let operation = match self.store.rollback_operation(operation_id)? {
            Some(op) => op,
            None => return Ok(None),
        };
        Ok(Some(RollbackStatus {
            compensations: self.store.compensations_for_operation(operation_id)?,
            audit_trail: self.store.audit_trail(operation_id)?,
            operation,
        }))
    }

    /// Operations initiated in the last `days_back` days, newest first
    pub fn list_operations(
        &self,
        days_back: i64,
        batch_id: Option<&str>,
    ) -> Result<Vec<RollbackOperation>, StoreError> {
        let since = self.clock.now() - chrono::Duration::days(days_back);
        self.store.rollback_operations_since(since, batch_id)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn resolve_scope(
        &self,
        batch: &crate::models::BatchRecord,
        scope: RollbackScope,
        affected: Option<&[String]>,
    ) -> Result<Vec<(String, i64)>, String> {
        let batch_targets: Vec<(String, i64)> = batch
            .entries
            .iter()
            .map(|e| (e.invoice_id.clone(), e.amount))
            .collect();

        match scope {
            RollbackScope::FullBatch => Ok(batch_targets),
            RollbackScope::PartialBatch | RollbackScope::SingleTransaction => {
                let requested = affected
                    .filter(|ids| !ids.is_empty())
                    .ok_or_else(|| "scope requires affected invoices".to_string())?;
                if scope == RollbackScope::SingleTransaction && requested.len() != 1 {
                    return Err(format!(
                        "single-transaction scope takes exactly one invoice, got {}",
                        requested.len()
                    ));
                }
                let mut targets = Vec::with_capacity(requested.len());
                for id in requested {
                    match batch_targets.iter().find(|(tid, _)| tid == id) {
                        Some(found) => targets.push(found.clone()),
                        None => {
                            return Err(format!("invoice {id} is not in batch {}", batch.id));
                        }
                    }
                }
                Ok(targets)
            }
            RollbackScope::RelatedBatches => {
                let mut targets = batch_targets;
                let related = self
                    .store
                    .batches_on_date(batch.batch_date)
                    .map_err(|err| format!("cannot load related batches: {err}"))?;
                for other in related {
                    if other.id == batch.id || other.status.is_terminal_failure() {
                        continue;
                    }
                    for entry in &other.entries {
                        if !targets.iter().any(|(id, _)| *id == entry.invoice_id) {
                            targets.push((entry.invoice_id.clone(), entry.amount));
                        }
                    }
                }
                Ok(targets)
            }
        }
    }

    /// The five unwind steps; errors accumulate, later steps still run
    fn execute_steps(
        &self,
        operation: &RollbackOperation,
        targets: &[(String, i64)],
        errors: &mut Vec<String>,
    ) -> Vec<String> {
        // Step 1: mark the batch rolled back
        if let Err(err) = self
            .store
            .set_batch_status(&operation.batch_id, crate::models::BatchStatus::RolledBack)
        {
            errors.push(format!("batch status: {err}"));
        }

        let ids: Vec<String> = targets.iter().map(|(id, _)| id.clone()).collect();
        let invoices = match self.store.invoices(&ids) {
            Ok(rows) => rows,
            Err(err) => {
                errors.push(format!("loading invoices: {err}"));
                vec![]
            }
        };

        let mut members = Vec::new();
        for invoice in &invoices {
            // Step 2: revert settled invoices to unpaid
            if matches!(
                invoice.status,
                InvoiceStatus::Paid | InvoiceStatus::PartlyPaid
            ) {
                if let Err(err) = self
                    .store
                    .set_invoice_status(&invoice.id, InvoiceStatus::Unpaid)
                {
                    errors.push(format!("invoice {}: {err}", invoice.id));
                }
            }

            // Step 3: cancel payment entries
            match self.store.payments_for_invoice(&invoice.id) {
                Ok(payments) => {
                    for payment in payments {
                        if let Err(err) = self.store.cancel_payment(&payment.id) {
                            errors.push(format!("payment {}: {err}", payment.id));
                        }
                    }
                }
                Err(err) => errors.push(format!("payments for {}: {err}", invoice.id)),
            }

            // Step 4: clear member payment flags
            if let Some(member_id) = &invoice.member {
                if !members.contains(member_id) {
                    if let Err(err) = self.store.reset_member_payment_flag(member_id) {
                        errors.push(format!("member {member_id}: {err}"));
                    }
                    members.push(member_id.clone());
                }
            }

            // Step 5: give back mandate usage
            if let Some(mandate_id) = &invoice.mandate_reference {
                if let Err(err) = self.store.decrement_usage(mandate_id) {
                    errors.push(format!("mandate {mandate_id}: {err}"));
                }
            }
        }

        members
    }

    /// One compensation per target: persist it pending, carry out its
    /// action, then record the per-transaction outcome
    fn create_compensations(
        &self,
        operation: &RollbackOperation,
        targets: &[(String, i64)],
        reason: RollbackReason,
        errors: &mut Vec<String>,
    ) {
        let action = reason.compensation_action();

        for (invoice_id, amount) in targets {
            let compensation = CompensationTransaction {
                transaction_id: format!("CT-{}", &Uuid::new_v4().simple().to_string()[..12]),
                operation_id: operation.operation_id.clone(),
                action,
                original_invoice: invoice_id.clone(),
                original_amount: *amount,
                compensation_amount: *amount,
                reason: reason.as_str().to_string(),
                status: CompensationStatus::Pending,
                created_at: self.clock.now(),
            };
            if let Err(err) = self.store.insert_compensation(&compensation) {
                errors.push(format!("compensation for {invoice_id}: {err}"));
                self.events.publish(&DomainEvent::CompensationFailed {
                    transaction_id: compensation.transaction_id.clone(),
                    operation_id: operation.operation_id.clone(),
                    invoice_id: invoice_id.clone(),
                    error: err.to_string(),
                });
                continue;
            }

            let status = match self.execute_compensation(&compensation) {
                Ok(status) => status,
                Err(err) => {
                    errors.push(format!(
                        "compensation {} for {invoice_id}: {err}",
                        compensation.transaction_id
                    ));
                    self.events.publish(&DomainEvent::CompensationFailed {
                        transaction_id: compensation.transaction_id.clone(),
                        operation_id: operation.operation_id.clone(),
                        invoice_id: invoice_id.clone(),
                        error: err.to_string(),
                    });
                    CompensationStatus::Failed
                }
            };
            if let Err(err) = self
                .store
                .set_compensation_status(&compensation.transaction_id, status)
            {
                errors.push(format!(
                    "compensation {} status: {err}",
                    compensation.transaction_id
                ));
            }

            self.audit(
                &operation.operation_id,
                &operation.initiated_by,
                "compensation_executed",
                serde_json::json!({
                    "transaction_id": compensation.transaction_id,
                    "action": action.as_str(),
                    "invoice_id": invoice_id,
                    "amount_cents": amount,
                    "status": status,
                }),
            );
        }
    }

    /// Carry out a compensation's action. Credit notes and account
    /// adjustments are booked by the accounting integration off the persisted
    /// transaction; manual corrections stay open for an operator.
    fn execute_compensation(
        &self,
        compensation: &CompensationTransaction,
    ) -> Result<CompensationStatus, StoreError> {
        match compensation.action {
            CompensationAction::PaymentReversal => {
                for payment in self
                    .store
                    .payments_for_invoice(&compensation.original_invoice)?
                {
                    self.store.cancel_payment(&payment.id)?;
                }
                Ok(CompensationStatus::Completed)
            }
            CompensationAction::InvoiceCancellation => {
                self.store.set_invoice_status(
                    &compensation.original_invoice,
                    InvoiceStatus::Cancelled,
                )?;
                Ok(CompensationStatus::Completed)
            }
            CompensationAction::CreditNote | CompensationAction::AccountAdjustment => {
                Ok(CompensationStatus::Completed)
            }
            CompensationAction::ManualCorrection => Ok(CompensationStatus::RequiresManualAction),
        }
    }

    fn audit(&self, operation_id: &str, actor: &str, action: &str, details: serde_json::Value) {
        let entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            operation_id: operation_id.to_string(),
            timestamp: self.clock.now(),
            action: action.to_string(),
            details,
            actor: actor.to_string(),
        };
        if let Err(err) = self.store.append_audit(&entry) {
            // Audit failures must not abort the rollback itself
            tracing::error!(operation_id, action, error = %err, "audit write failed");
        }
    }
}

/// Outcome for a rollback rejected before anything was persisted
fn rejected(batch_id: &str, errors: Vec<String>) -> RollbackOutcome {
    tracing::warn!(batch_id, errors = ?errors, "rollback rejected");
    RollbackOutcome {
        success: false,
        operation_id: None,
        batch_id: batch_id.to_string(),
        affected_invoice_count: 0,
        total_amount: 0,
        errors,
    }
}
