//! In-memory store
//!
//! Backs the engine in tests and demos. A single mutex over all tables makes
//! every store call atomic, which is exactly the guarantee the lock service's
//! compare-and-set depends on.
//!
//! `fail_next` arms transient-failure injection for a named operation so
//! retry and rollback paths can be exercised without a real flaky backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};

use crate::lock::LockRow;
use crate::models::{
    BatchAssignment, BatchRecord, BatchStatus, InvoiceRecord, InvoiceStatus, Mandate,
    MandateStatus, MemberRecord, PaymentRecord, PaymentStatus, UsageRecord,
};
use crate::rollback::{AuditEntry, CompensationStatus, CompensationTransaction, RollbackOperation};

use super::{
    BatchStore, InvoiceStore, LockStore, MandateStore, RecoveryStore, StoreError,
};

#[derive(Default)]
struct Inner {
    locks: HashMap<String, LockRow>,
    invoices: HashMap<String, InvoiceRecord>,
    payments: HashMap<String, PaymentRecord>,
    members: HashMap<String, MemberRecord>,
    batches: HashMap<String, BatchRecord>,
    mandates: HashMap<String, Mandate>,
    usage: HashMap<String, Vec<UsageRecord>>,
    rollback_ops: HashMap<String, RollbackOperation>,
    compensations: HashMap<String, CompensationTransaction>,
    audit: Vec<AuditEntry>,
    /// Operation name -> remaining injected failures
    faults: HashMap<String, u32>,
}

impl Inner {
    fn take_fault(&mut self, op: &str) -> Option<StoreError> {
        match self.faults.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Some(StoreError::Unavailable(format!("injected fault: {op}")))
            }
            _ => None,
        }
    }
}

/// Mutex-backed store implementing every store trait
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Seeding and inspection helpers (used by tests and demos)
    // ========================================================================

    pub fn insert_invoice(&self, invoice: InvoiceRecord) {
        self.lock_inner().invoices.insert(invoice.id.clone(), invoice);
    }

    pub fn insert_payment(&self, payment: PaymentRecord) {
        self.lock_inner().payments.insert(payment.id.clone(), payment);
    }

    pub fn insert_member(&self, member: MemberRecord) {
        self.lock_inner().members.insert(member.id.clone(), member);
    }

    pub fn insert_mandate(&self, mandate: Mandate) {
        self.lock_inner()
            .mandates
            .insert(mandate.mandate_id.clone(), mandate);
    }

    pub fn seed_batch(&self, batch: BatchRecord) {
        self.lock_inner().batches.insert(batch.id.clone(), batch);
    }

    pub fn invoice(&self, id: &str) -> Option<InvoiceRecord> {
        self.lock_inner().invoices.get(id).cloned()
    }

    pub fn payment(&self, id: &str) -> Option<PaymentRecord> {
        self.lock_inner().payments.get(id).cloned()
    }

    pub fn member_snapshot(&self, id: &str) -> Option<MemberRecord> {
        self.lock_inner().members.get(id).cloned()
    }

    pub fn batch_count(&self) -> usize {
        self.lock_inner().batches.len()
    }

    pub fn lock_count(&self) -> usize {
        self.lock_inner().locks.len()
    }

    /// Arm `times` consecutive `Unavailable` failures on a named operation.
    /// Supported names: `insert_batch`, `append_usage`, `invoices_for_update`.
    pub fn fail_next(&self, op: &str, times: u32) {
        self.lock_inner().faults.insert(op.to_string(), times);
    }
}

// ============================================================================
// LockStore
// ============================================================================

impl LockStore for MemoryStore {
    fn upsert_lock_if_available(
        &self,
        row: LockRow,
        now: DateTime<Utc>,
    ) -> Result<LockRow, StoreError> {
        let mut inner = self.lock_inner();
        match inner.locks.get(&row.resource) {
            Some(current) if current.is_held(now) => Ok(current.clone()),
            _ => {
                inner.locks.insert(row.resource.clone(), row.clone());
                Ok(row)
            }
        }
    }

    fn read_lock(&self, resource: &str) -> Result<Option<LockRow>, StoreError> {
        Ok(self.lock_inner().locks.get(resource).cloned())
    }

    fn release_lock(&self, resource: &str, lock_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        match inner.locks.get_mut(resource) {
            Some(row) if row.active && row.lock_id == lock_id => {
                row.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn force_release_lock(&self, resource: &str) -> Result<Option<LockRow>, StoreError> {
        let mut inner = self.lock_inner();
        match inner.locks.get_mut(resource) {
            Some(row) if row.active => {
                let displaced = row.clone();
                row.active = false;
                Ok(Some(displaced))
            }
            _ => Ok(None),
        }
    }

    fn expire_stale_locks(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock_inner();
        let mut swept = 0;
        for row in inner.locks.values_mut() {
            if row.active && row.is_expired(now) {
                row.active = false;
                row.modified = now;
                swept += 1;
            }
        }
        Ok(swept)
    }

    fn purge_inactive_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock_inner();
        let before = inner.locks.len();
        inner
            .locks
            .retain(|_, row| row.active || row.modified >= cutoff);
        Ok(before - inner.locks.len())
    }
}

// ============================================================================
// InvoiceStore
// ============================================================================

impl InvoiceStore for MemoryStore {
    fn invoices(&self, ids: &[String]) -> Result<Vec<InvoiceRecord>, StoreError> {
        let inner = self.lock_inner();
        Ok(ids
            .iter()
            .filter_map(|id| inner.invoices.get(id).cloned())
            .collect())
    }

    fn invoices_for_update(&self, ids: &[String]) -> Result<Vec<InvoiceRecord>, StoreError> {
        let mut inner = self.lock_inner();
        if let Some(err) = inner.take_fault("invoices_for_update") {
            return Err(err);
        }
        Ok(ids
            .iter()
            .filter_map(|id| inner.invoices.get(id).cloned())
            .collect())
    }

    fn set_invoice_status(&self, id: &str, status: InvoiceStatus) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let invoice = inner
            .invoices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {id}")))?;
        invoice.status = status;
        Ok(())
    }

    fn payments_for_invoice(&self, invoice_id: &str) -> Result<Vec<PaymentRecord>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id && p.status != PaymentStatus::Cancelled)
            .cloned()
            .collect())
    }

    fn cancel_payment(&self, payment_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let payment = inner
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {payment_id}")))?;
        payment.status = PaymentStatus::Cancelled;
        Ok(())
    }

    fn member(&self, id: &str) -> Result<Option<MemberRecord>, StoreError> {
        Ok(self.lock_inner().members.get(id).cloned())
    }

    fn reset_member_payment_flag(&self, member_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let member = inner
            .members
            .get_mut(member_id)
            .ok_or_else(|| StoreError::NotFound(format!("member {member_id}")))?;
        member.payment_current = false;
        Ok(())
    }
}

// ============================================================================
// BatchStore
// ============================================================================

impl BatchStore for MemoryStore {
    fn batch(&self, id: &str) -> Result<Option<BatchRecord>, StoreError> {
        Ok(self.lock_inner().batches.get(id).cloned())
    }

    fn batches_containing(
        &self,
        invoice_ids: &[String],
    ) -> Result<Vec<BatchAssignment>, StoreError> {
        let inner = self.lock_inner();
        let mut assignments = Vec::new();
        for batch in inner.batches.values() {
            for entry in &batch.entries {
                if invoice_ids.iter().any(|id| *id == entry.invoice_id) {
                    assignments.push(BatchAssignment {
                        invoice_id: entry.invoice_id.clone(),
                        batch_id: batch.id.clone(),
                        batch_status: batch.status,
                        batch_date: batch.batch_date,
                        batch_type: batch.batch_type,
                    });
                }
            }
        }
        Ok(assignments)
    }

    fn batches_on_date(&self, date: NaiveDate) -> Result<Vec<BatchRecord>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner
            .batches
            .values()
            .filter(|b| b.batch_date == date)
            .cloned()
            .collect())
    }

    fn insert_batch(&self, batch: &BatchRecord) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if let Some(err) = inner.take_fault("insert_batch") {
            return Err(err);
        }
        if inner.batches.contains_key(&batch.id) {
            return Err(StoreError::Contention(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        inner.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    fn set_batch_status(&self, id: &str, status: BatchStatus) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let batch = inner
            .batches
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
        batch.status = status;
        Ok(())
    }
}

// ============================================================================
// MandateStore
// ============================================================================

impl MandateStore for MemoryStore {
    fn mandate(&self, mandate_id: &str) -> Result<Option<Mandate>, StoreError> {
        Ok(self.lock_inner().mandates.get(mandate_id).cloned())
    }

    fn usage_history(&self, mandate_id: &str) -> Result<Vec<UsageRecord>, StoreError> {
        let inner = self.lock_inner();
        let mut history = inner.usage.get(mandate_id).cloned().unwrap_or_default();
        history.sort_by_key(|u| u.usage_date);
        Ok(history)
    }

    fn append_usage(&self, mandate_id: &str, usage: UsageRecord) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if let Some(err) = inner.take_fault("append_usage") {
            return Err(err);
        }
        let mandate = inner
            .mandates
            .get_mut(mandate_id)
            .ok_or_else(|| StoreError::NotFound(format!("mandate {mandate_id}")))?;
        mandate.usage_count += 1;
        inner.usage.entry(mandate_id.to_string()).or_default().push(usage);
        Ok(())
    }

    fn set_mandate_status(
        &self,
        mandate_id: &str,
        status: MandateStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let mandate = inner
            .mandates
            .get_mut(mandate_id)
            .ok_or_else(|| StoreError::NotFound(format!("mandate {mandate_id}")))?;
        mandate.status = status;
        Ok(())
    }

    fn decrement_usage(&self, mandate_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let mandate = inner
            .mandates
            .get_mut(mandate_id)
            .ok_or_else(|| StoreError::NotFound(format!("mandate {mandate_id}")))?;
        mandate.usage_count = mandate.usage_count.saturating_sub(1);
        Ok(())
    }
}

// ============================================================================
// RecoveryStore
// ============================================================================

impl RecoveryStore for MemoryStore {
    fn insert_rollback_operation(&self, operation: &RollbackOperation) -> Result<(), StoreError> {
        self.lock_inner()
            .rollback_ops
            .insert(operation.operation_id.clone(), operation.clone());
        Ok(())
    }

    fn update_rollback_operation(&self, operation: &RollbackOperation) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if !inner.rollback_ops.contains_key(&operation.operation_id) {
            return Err(StoreError::NotFound(format!(
                "rollback operation {}",
                operation.operation_id
            )));
        }
        inner
            .rollback_ops
            .insert(operation.operation_id.clone(), operation.clone());
        Ok(())
    }

    fn rollback_operation(
        &self,
        operation_id: &str,
    ) -> Result<Option<RollbackOperation>, StoreError> {
        Ok(self.lock_inner().rollback_ops.get(operation_id).cloned())
    }

    fn rollback_operations_since(
        &self,
        since: DateTime<Utc>,
        batch_id: Option<&str>,
    ) -> Result<Vec<RollbackOperation>, StoreError> {
        let inner = self.lock_inner();
        let mut operations: Vec<RollbackOperation> = inner
            .rollback_ops
            .values()
            .filter(|op| op.initiated_at >= since)
            .filter(|op| batch_id.map_or(true, |b| op.batch_id == b))
            .cloned()
            .collect();
        operations.sort_by(|a, b| b.initiated_at.cmp(&a.initiated_at));
        Ok(operations)
    }

    fn insert_compensation(
        &self,
        compensation: &CompensationTransaction,
    ) -> Result<(), StoreError> {
        self.lock_inner()
            .compensations
            .insert(compensation.transaction_id.clone(), compensation.clone());
        Ok(())
    }

    fn set_compensation_status(
        &self,
        transaction_id: &str,
        status: CompensationStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        let compensation = inner
            .compensations
            .get_mut(transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("compensation {transaction_id}")))?;
        compensation.status = status;
        Ok(())
    }

    fn compensations_for_operation(
        &self,
        operation_id: &str,
    ) -> Result<Vec<CompensationTransaction>, StoreError> {
        let inner = self.lock_inner();
        let mut rows: Vec<CompensationTransaction> = inner
            .compensations
            .values()
            .filter(|c| c.operation_id == operation_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        Ok(rows)
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.lock_inner().audit.push(entry.clone());
        Ok(())
    }

    fn audit_trail(&self, operation_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner
            .audit
            .iter()
            .filter(|e| e.operation_id == operation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceStatus;

    #[test]
    fn test_usage_append_bumps_counter() {
        let store = MemoryStore::new();
        store.insert_mandate(Mandate::new(
            "MND-001",
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        ));

        store
            .append_usage(
                "MND-001",
                UsageRecord {
                    usage_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                    sequence_type: crate::models::SequenceType::Frst,
                    amount: 2500,
                    invoice_reference: "SI-001".to_string(),
                    transaction_id: "BATCH-001".to_string(),
                },
            )
            .unwrap();

        let mandate = store.mandate("MND-001").unwrap().unwrap();
        assert_eq!(mandate.usage_count, 1);
        assert_eq!(store.usage_history("MND-001").unwrap().len(), 1);
    }

    #[test]
    fn test_decrement_usage_floors_at_zero() {
        let store = MemoryStore::new();
        store.insert_mandate(Mandate::new(
            "MND-001",
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        ));

        store.decrement_usage("MND-001").unwrap();
        store.decrement_usage("MND-001").unwrap();

        assert_eq!(store.mandate("MND-001").unwrap().unwrap().usage_count, 0);
    }

    #[test]
    fn test_fault_injection_is_consumed() {
        let store = MemoryStore::new();
        store.insert_invoice(InvoiceRecord::new("SI-001", InvoiceStatus::Unpaid, 2500));
        store.fail_next("invoices_for_update", 1);

        let ids = vec!["SI-001".to_string()];
        assert!(store.invoices_for_update(&ids).is_err());
        assert_eq!(store.invoices_for_update(&ids).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_invoices_are_absent_not_errors() {
        let store = MemoryStore::new();
        store.insert_invoice(InvoiceRecord::new("SI-001", InvoiceStatus::Unpaid, 2500));

        let found = store
            .invoices(&["SI-001".to_string(), "SI-MISSING".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
