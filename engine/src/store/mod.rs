//! Storage abstraction
//!
//! Every subsystem talks to persistence through these traits, so the whole
//! engine runs unchanged against the in-memory store used in tests or a real
//! database adapter. The traits are deliberately narrow: each subsystem only
//! requires the capabilities it actually uses, and the orchestrator is
//! generic over a store that implements all of them.
//!
//! # Critical Invariants
//!
//! - `upsert_lock_if_available` is the single compare-and-set primitive the
//!   lock service builds on. It must be atomic with respect to other callers
//!   on the same resource key.
//! - `decrement_usage` floors at zero; usage counters never go negative.
//! - `append_audit` is append-only; audit entries are never updated.

pub mod memory;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::lock::LockRow;
use crate::models::{
    BatchAssignment, BatchRecord, BatchStatus, InvoiceRecord, InvoiceStatus, Mandate,
    MandateStatus, MemberRecord, PaymentRecord, UsageRecord,
};
use crate::rollback::{AuditEntry, CompensationStatus, CompensationTransaction, RollbackOperation};

pub use memory::MemoryStore;

/// Errors surfaced by a store backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend temporarily unreachable, safe to retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Concurrent writer won, safe to retry
    #[error("write contention: {0}")]
    Contention(String),

    /// Stored data fails to deserialize or violates an invariant
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

/// Persistence for resource lock rows
pub trait LockStore: Send + Sync {
    /// Atomically install `row` if the resource is free or its current lock
    /// is inactive/expired at `now`. Returns the row that holds the resource
    /// after the call: the proposed row on success, the competing holder's
    /// row otherwise.
    fn upsert_lock_if_available(
        &self,
        row: LockRow,
        now: DateTime<Utc>,
    ) -> Result<LockRow, StoreError>;

    /// Current lock row for a resource, active or not
    fn read_lock(&self, resource: &str) -> Result<Option<LockRow>, StoreError>;

    /// Deactivate the lock if `lock_id` still holds it. Returns whether a
    /// release happened.
    fn release_lock(&self, resource: &str, lock_id: &str) -> Result<bool, StoreError>;

    /// Deactivate the lock regardless of holder. Returns the displaced row.
    fn force_release_lock(&self, resource: &str) -> Result<Option<LockRow>, StoreError>;

    /// Deactivate every active lock whose lease expired before `now`.
    /// Returns the number of rows swept.
    fn expire_stale_locks(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Delete inactive lock rows last modified before `cutoff`
    fn purge_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Persistence for invoices, payments, and members
pub trait InvoiceStore: Send + Sync {
    /// Fetch the listed invoices; missing ids are simply absent from the
    /// result, callers detect them by comparing against the request
    fn invoices(&self, ids: &[String]) -> Result<Vec<InvoiceRecord>, StoreError>;

    /// Fetch invoices with row-level write intent (SELECT ... FOR UPDATE on
    /// database backends). The memory store treats it as a plain read.
    fn invoices_for_update(&self, ids: &[String]) -> Result<Vec<InvoiceRecord>, StoreError>;

    fn set_invoice_status(&self, id: &str, status: InvoiceStatus) -> Result<(), StoreError>;

    /// Non-cancelled payment entries against an invoice
    fn payments_for_invoice(&self, invoice_id: &str) -> Result<Vec<PaymentRecord>, StoreError>;

    fn cancel_payment(&self, payment_id: &str) -> Result<(), StoreError>;

    fn member(&self, id: &str) -> Result<Option<MemberRecord>, StoreError>;

    /// Clear the member's payment-current flag during rollback
    fn reset_member_payment_flag(&self, member_id: &str) -> Result<(), StoreError>;
}

/// Persistence for direct-debit batches
pub trait BatchStore: Send + Sync {
    fn batch(&self, id: &str) -> Result<Option<BatchRecord>, StoreError>;

    /// Assignments of the listed invoices to any batch, regardless of status
    fn batches_containing(&self, invoice_ids: &[String])
        -> Result<Vec<BatchAssignment>, StoreError>;

    /// Batches scheduled for collection on `date`
    fn batches_on_date(&self, date: NaiveDate) -> Result<Vec<BatchRecord>, StoreError>;

    fn insert_batch(&self, batch: &BatchRecord) -> Result<(), StoreError>;

    fn set_batch_status(&self, id: &str, status: BatchStatus) -> Result<(), StoreError>;
}

/// Persistence for mandates and their usage history
pub trait MandateStore: Send + Sync {
    fn mandate(&self, mandate_id: &str) -> Result<Option<Mandate>, StoreError>;

    /// Usage records ordered by usage date ascending
    fn usage_history(&self, mandate_id: &str) -> Result<Vec<UsageRecord>, StoreError>;

    /// Append a usage record and bump the mandate's usage counter
    fn append_usage(&self, mandate_id: &str, usage: UsageRecord) -> Result<(), StoreError>;

    fn set_mandate_status(&self, mandate_id: &str, status: MandateStatus)
        -> Result<(), StoreError>;

    /// Decrement the usage counter, flooring at zero
    fn decrement_usage(&self, mandate_id: &str) -> Result<(), StoreError>;
}

/// Persistence for rollback operations, compensations, and the audit trail
pub trait RecoveryStore: Send + Sync {
    fn insert_rollback_operation(&self, operation: &RollbackOperation) -> Result<(), StoreError>;

    fn update_rollback_operation(&self, operation: &RollbackOperation) -> Result<(), StoreError>;

    fn rollback_operation(&self, operation_id: &str)
        -> Result<Option<RollbackOperation>, StoreError>;

    /// Operations initiated at or after `since`, optionally restricted to a
    /// batch, newest first
    fn rollback_operations_since(
        &self,
        since: DateTime<Utc>,
        batch_id: Option<&str>,
    ) -> Result<Vec<RollbackOperation>, StoreError>;

    fn insert_compensation(&self, compensation: &CompensationTransaction)
        -> Result<(), StoreError>;

    fn set_compensation_status(
        &self,
        transaction_id: &str,
        status: CompensationStatus,
    ) -> Result<(), StoreError>;

    fn compensations_for_operation(
        &self,
        operation_id: &str,
    ) -> Result<Vec<CompensationTransaction>, StoreError>;

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Audit entries for an operation in insertion order
    fn audit_trail(&self, operation_id: &str) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Marker shorthand for stores that back the full orchestrator
pub trait EngineStore:
    LockStore + InvoiceStore + BatchStore + MandateStore + RecoveryStore
{
}

impl<S> EngineStore for S where
    S: LockStore + InvoiceStore + BatchStore + MandateStore + RecoveryStore
{
}
