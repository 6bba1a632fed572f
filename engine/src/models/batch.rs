//! Direct-debit batch models
//!
//! A `BatchCandidate` is the caller's proposal: a collection date, a scheme
//! type, and invoice entries. It only becomes a `BatchRecord` after passing
//! through the orchestrator's protected creation path.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::invoice::InvoiceEntry;

// ============================================================================
// Batch type and status
// ============================================================================

/// SEPA direct-debit scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// Consumer scheme (CORE)
    Core,
    /// Business-to-business scheme, stricter mandate requirements
    B2b,
    /// Legacy shortened-timeline consumer scheme
    Cor1,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Core => "CORE",
            BatchType::B2b => "B2B",
            BatchType::Cor1 => "COR1",
        }
    }
}

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Draft,
    Generated,
    Submitted,
    Processing,
    Settled,
    Failed,
    Cancelled,
    Rejected,
    RolledBack,
}

impl BatchStatus {
    /// Statuses under which an invoice in the batch must not be re-batched
    pub fn blocks_reuse(&self) -> bool {
        matches!(
            self,
            BatchStatus::Draft
                | BatchStatus::Generated
                | BatchStatus::Submitted
                | BatchStatus::Processing
        )
    }

    /// Terminal failure states, invisible to cross-batch conflict checks
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Cancelled | BatchStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Draft => "Draft",
            BatchStatus::Generated => "Generated",
            BatchStatus::Submitted => "Submitted",
            BatchStatus::Processing => "Processing",
            BatchStatus::Settled => "Settled",
            BatchStatus::Failed => "Failed",
            BatchStatus::Cancelled => "Cancelled",
            BatchStatus::Rejected => "Rejected",
            BatchStatus::RolledBack => "Rolled Back",
        }
    }
}

// ============================================================================
// Candidate and record
// ============================================================================

/// Proposed batch, not yet persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCandidate {
    /// Requested collection date; `None` is a critical conflict
    pub batch_date: Option<NaiveDate>,
    pub batch_type: BatchType,
    pub entries: Vec<InvoiceEntry>,
    pub description: Option<String>,
}

impl BatchCandidate {
    pub fn new(batch_date: Option<NaiveDate>, batch_type: BatchType) -> Self {
        Self {
            batch_date,
            batch_type,
            entries: Vec::new(),
            description: None,
        }
    }

    pub fn with_entry(mut self, entry: InvoiceEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Invoice ids in entry order, duplicates preserved
    pub fn invoice_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.invoice_id.clone()).collect()
    }

    /// Sum of entry amounts in euro cents
    pub fn total_amount(&self) -> i64 {
        self.entries.iter().map(|e| e.amount).sum()
    }
}

/// Persisted batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub batch_date: NaiveDate,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub description: String,
    pub entries: Vec<InvoiceEntry>,
    /// Sum of entry amounts in euro cents
    pub total_amount: i64,
    pub entry_count: usize,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn contains_invoice(&self, invoice_id: &str) -> bool {
        self.entries.iter().any(|e| e.invoice_id == invoice_id)
    }
}

/// Where an invoice currently sits: one row per (invoice, batch) pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAssignment {
    pub invoice_id: String,
    pub batch_id: String,
    pub batch_status: BatchStatus,
    pub batch_date: NaiveDate,
    pub batch_type: BatchType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_statuses() {
        assert!(BatchStatus::Draft.blocks_reuse());
        assert!(BatchStatus::Processing.blocks_reuse());
        assert!(!BatchStatus::Settled.blocks_reuse());
        assert!(!BatchStatus::Failed.blocks_reuse());
        assert!(!BatchStatus::RolledBack.blocks_reuse());
    }

    #[test]
    fn test_terminal_failures_are_invisible() {
        assert!(BatchStatus::Failed.is_terminal_failure());
        assert!(BatchStatus::Cancelled.is_terminal_failure());
        assert!(BatchStatus::Rejected.is_terminal_failure());
        assert!(!BatchStatus::RolledBack.is_terminal_failure());
        assert!(!BatchStatus::Settled.is_terminal_failure());
    }

    #[test]
    fn test_candidate_totals() {
        let candidate = BatchCandidate::new(
            NaiveDate::from_ymd_opt(2025, 6, 2),
            BatchType::Core,
        )
        .with_entry(InvoiceEntry::new(
            "SI-001",
            2500,
            "NL91ABNA0417164300",
            "Jan Visser",
            "MND-001",
        ))
        .with_entry(InvoiceEntry::new(
            "SI-002",
            4375,
            "DE89370400440532013000",
            "Anna Schmidt",
            "MND-002",
        ));

        assert_eq!(candidate.total_amount(), 6875);
        assert_eq!(candidate.invoice_ids(), vec!["SI-001", "SI-002"]);
    }
}
