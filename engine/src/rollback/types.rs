//! Rollback and compensation record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a rollback was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollbackReason {
    BatchProcessingFailed,
    BankRejection,
    ValidationErrors,
    MandateIssues,
    TechnicalError,
    BusinessRuleViolation,
    UserRequested,
    ComplianceIssue,
}

impl RollbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::BatchProcessingFailed => "batch_processing_failed",
            RollbackReason::BankRejection => "bank_rejection",
            RollbackReason::ValidationErrors => "validation_errors",
            RollbackReason::MandateIssues => "mandate_issues",
            RollbackReason::TechnicalError => "technical_error",
            RollbackReason::BusinessRuleViolation => "business_rule_violation",
            RollbackReason::UserRequested => "user_requested",
            RollbackReason::ComplianceIssue => "compliance_issue",
        }
    }

    /// Which compensation a failed collection for this reason calls for
    pub fn compensation_action(&self) -> CompensationAction {
        match self {
            RollbackReason::BankRejection => CompensationAction::CreditNote,
            RollbackReason::TechnicalError => CompensationAction::AccountAdjustment,
            RollbackReason::BusinessRuleViolation => CompensationAction::InvoiceCancellation,
            RollbackReason::ComplianceIssue => CompensationAction::CreditNote,
            _ => CompensationAction::ManualCorrection,
        }
    }
}

/// How much of the batch the rollback covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackScope {
    /// Every invoice in the batch
    FullBatch,
    /// A caller-supplied subset of the batch
    PartialBatch,
    /// Exactly one invoice
    SingleTransaction,
    /// This batch plus every non-failed batch on the same collection date
    RelatedBatches,
}

impl RollbackScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackScope::FullBatch => "full_batch",
            RollbackScope::PartialBatch => "partial_batch",
            RollbackScope::SingleTransaction => "single_transaction",
            RollbackScope::RelatedBatches => "related_batches",
        }
    }
}

/// Compensating action attached to an affected invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationAction {
    CreditNote,
    PaymentReversal,
    InvoiceCancellation,
    AccountAdjustment,
    /// Needs a human; recorded but never auto-completed
    ManualCorrection,
}

impl CompensationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationAction::CreditNote => "credit_note",
            CompensationAction::PaymentReversal => "payment_reversal",
            CompensationAction::InvoiceCancellation => "invoice_cancellation",
            CompensationAction::AccountAdjustment => "account_adjustment",
            CompensationAction::ManualCorrection => "manual_correction",
        }
    }
}

/// Rollback operation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

/// Compensation transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationStatus {
    Pending,
    Completed,
    Failed,
    RequiresManualAction,
}

/// Persisted rollback operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOperation {
    pub operation_id: String,
    pub batch_id: String,
    pub reason: RollbackReason,
    pub scope: RollbackScope,
    pub initiated_by: String,
    pub initiated_at: DateTime<Utc>,
    pub affected_invoices: Vec<String>,
    pub affected_members: Vec<String>,
    /// Sum of affected entry amounts, euro cents
    pub total_amount: i64,
    pub status: OperationStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

/// Persisted compensation transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationTransaction {
    pub transaction_id: String,
    pub operation_id: String,
    pub action: CompensationAction,
    pub original_invoice: String,
    /// Euro cents
    pub original_amount: i64,
    /// Euro cents; equals the original for full compensation
    pub compensation_amount: i64,
    pub reason: String,
    pub status: CompensationStatus,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"rollback_initiated"`, `"rollback_steps_executed"`
    pub action: String,
    pub details: serde_json::Value,
    pub actor: String,
}

/// What the caller gets back from an initiation, success or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    /// Absent when the rollback was rejected before anything was persisted
    pub operation_id: Option<String>,
    pub batch_id: String,
    pub affected_invoice_count: usize,
    pub total_amount: i64,
    pub errors: Vec<String>,
}

/// Operation plus its compensations and audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStatus {
    pub operation: RollbackOperation,
    pub compensations: Vec<CompensationTransaction>,
    pub audit_trail: Vec<AuditEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensation_action_mapping() {
        assert_eq!(
            RollbackReason::BankRejection.compensation_action(),
            CompensationAction::CreditNote
        );
        assert_eq!(
            RollbackReason::TechnicalError.compensation_action(),
            CompensationAction::AccountAdjustment
        );
        assert_eq!(
            RollbackReason::BusinessRuleViolation.compensation_action(),
            CompensationAction::InvoiceCancellation
        );
        assert_eq!(
            RollbackReason::ComplianceIssue.compensation_action(),
            CompensationAction::CreditNote
        );
        assert_eq!(
            RollbackReason::UserRequested.compensation_action(),
            CompensationAction::ManualCorrection
        );
        assert_eq!(
            RollbackReason::BatchProcessingFailed.compensation_action(),
            CompensationAction::ManualCorrection
        );
    }
}
