//! Invoice, payment, and member records
//!
//! These are the read models the engine coordinates over. They are snapshots
//! of rows held by the backing store; the engine mutates them only through
//! the store traits, never in place.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The only currency SEPA direct debit operates in
pub const CURRENCY_EUR: &str = "EUR";

// ============================================================================
// Invoice
// ============================================================================

/// Lifecycle status of a receivable invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Unpaid,
    Overdue,
    Paid,
    PartlyPaid,
    Cancelled,
}

impl InvoiceStatus {
    /// Whether the invoice may be pulled into a new direct-debit batch
    pub fn is_collectable(&self) -> bool {
        matches!(self, InvoiceStatus::Unpaid | InvoiceStatus::Overdue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "Unpaid",
            InvoiceStatus::Overdue => "Overdue",
            InvoiceStatus::Paid => "Paid",
            InvoiceStatus::PartlyPaid => "Partly Paid",
            InvoiceStatus::Cancelled => "Cancelled",
        }
    }
}

/// Stored invoice row as seen by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    /// Invoice identifier, e.g. `"SI-2025-00042"`
    pub id: String,
    pub status: InvoiceStatus,
    /// Amount still owed, in euro cents
    pub outstanding_amount: i64,
    /// Member the invoice bills, when known
    pub member: Option<String>,
    /// Mandate expected to collect this invoice
    pub mandate_reference: Option<String>,
    /// Next due date on the member's dues schedule, drives early/late checks
    pub schedule_next_due: Option<NaiveDate>,
    pub posting_date: Option<NaiveDate>,
}

impl InvoiceRecord {
    pub fn new(id: impl Into<String>, status: InvoiceStatus, outstanding_amount: i64) -> Self {
        Self {
            id: id.into(),
            status,
            outstanding_amount,
            member: None,
            mandate_reference: None,
            schedule_next_due: None,
            posting_date: None,
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_mandate(mut self, mandate_reference: impl Into<String>) -> Self {
        self.mandate_reference = Some(mandate_reference.into());
        self
    }

    pub fn with_schedule_next_due(mut self, due: NaiveDate) -> Self {
        self.schedule_next_due = Some(due);
        self
    }
}

/// One invoice line inside a candidate or stored batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceEntry {
    pub invoice_id: String,
    /// Amount to collect, in euro cents
    pub amount: i64,
    pub iban: String,
    pub bic: Option<String>,
    pub member_name: String,
    pub mandate_reference: String,
    pub currency: String,
}

impl InvoiceEntry {
    pub fn new(
        invoice_id: impl Into<String>,
        amount: i64,
        iban: impl Into<String>,
        member_name: impl Into<String>,
        mandate_reference: impl Into<String>,
    ) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            amount,
            iban: iban.into(),
            bic: None,
            member_name: member_name.into(),
            mandate_reference: mandate_reference.into(),
            currency: CURRENCY_EUR.to_string(),
        }
    }

    pub fn with_bic(mut self, bic: impl Into<String>) -> Self {
        self.bic = Some(bic.into());
        self
    }
}

// ============================================================================
// Payment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Submitted,
    Cancelled,
}

/// Payment entry linked to an invoice, reversed during rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub invoice_id: String,
    /// Paid amount, in euro cents
    pub amount: i64,
    pub status: PaymentStatus,
}

// ============================================================================
// Member
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Active,
    Current,
    Suspended,
    Terminated,
}

impl MemberStatus {
    /// Whether the member is in good standing for new collections
    pub fn is_eligible(&self) -> bool {
        matches!(self, MemberStatus::Active | MemberStatus::Current)
    }
}

/// Member row, carries the payment flag reset during rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: String,
    pub full_name: String,
    pub status: MemberStatus,
    /// Set when a settled batch covered the member's dues
    pub payment_current: bool,
}

impl MemberRecord {
    pub fn new(id: impl Into<String>, full_name: impl Into<String>, status: MemberStatus) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            status,
            payment_current: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collectable_statuses() {
        assert!(InvoiceStatus::Unpaid.is_collectable());
        assert!(InvoiceStatus::Overdue.is_collectable());
        assert!(!InvoiceStatus::Paid.is_collectable());
        assert!(!InvoiceStatus::PartlyPaid.is_collectable());
        assert!(!InvoiceStatus::Cancelled.is_collectable());
    }

    #[test]
    fn test_entry_defaults_to_eur() {
        let entry = InvoiceEntry::new("SI-001", 2500, "NL91ABNA0417164300", "Jan Visser", "MND-001");
        assert_eq!(entry.currency, CURRENCY_EUR);
        assert!(entry.bic.is_none());
    }

    #[test]
    fn test_member_eligibility() {
        assert!(MemberStatus::Active.is_eligible());
        assert!(MemberStatus::Current.is_eligible());
        assert!(!MemberStatus::Suspended.is_eligible());
        assert!(!MemberStatus::Terminated.is_eligible());
    }
}
