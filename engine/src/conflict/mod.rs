//! Pre-flight conflict detection
//!
//! Runs every check against a proposed batch before anything is written:
//! duplicates, cross-batch membership, collection dates, dues schedules,
//! business limits, mandates, and amount agreement. Detection is strictly
//! read-only and safe to call repeatedly; a store hiccup during one check is
//! folded into the result set as a warning instead of aborting the run, so
//! one flaky table never hides the conflicts the other checks found.

pub mod report;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::core::Clock;
use crate::models::{BatchCandidate, BatchStatus, BatchType, MandateStatus};
use crate::store::{BatchStore, InvoiceStore, MandateStore, StoreError};

pub use report::ConflictReport;

// ============================================================================
// Types
// ============================================================================

/// Conflict severity, ordered so `Critical` compares greatest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ConflictSeverity {
    /// Advisory only
    Info,
    /// Proceed allowed, review recommended
    Warning,
    /// Blocks batch creation
    Critical,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Info => "info",
            ConflictSeverity::Warning => "warning",
            ConflictSeverity::Critical => "critical",
        }
    }
}

/// What a conflict is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    EmptyBatch,
    DuplicateInvoice,
    CrossBatchConflict,
    MissingBatchDate,
    PastBatchDate,
    WeekendCollection,
    FarFutureDate,
    SameDateBatch,
    EarlyCollection,
    LateCollection,
    BatchSizeLimit,
    AmountLimit,
    NonPositiveAmount,
    B2bRequirements,
    MandateNotFound,
    InactiveMandate,
    ExpiredMandate,
    HighMandateUsage,
    InvoiceNotFound,
    InvalidInvoiceStatus,
    AmountMismatch,
    DetectionError,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::EmptyBatch => "empty_batch",
            ConflictKind::DuplicateInvoice => "duplicate_invoice",
            ConflictKind::CrossBatchConflict => "cross_batch_conflict",
            ConflictKind::MissingBatchDate => "missing_batch_date",
            ConflictKind::PastBatchDate => "past_batch_date",
            ConflictKind::WeekendCollection => "weekend_collection",
            ConflictKind::FarFutureDate => "far_future_date",
            ConflictKind::SameDateBatch => "same_date_batch",
            ConflictKind::EarlyCollection => "early_collection",
            ConflictKind::LateCollection => "late_collection",
            ConflictKind::BatchSizeLimit => "batch_size_limit",
            ConflictKind::AmountLimit => "amount_limit",
            ConflictKind::NonPositiveAmount => "non_positive_amount",
            ConflictKind::B2bRequirements => "b2b_requirements",
            ConflictKind::MandateNotFound => "mandate_not_found",
            ConflictKind::InactiveMandate => "inactive_mandate",
            ConflictKind::ExpiredMandate => "expired_mandate",
            ConflictKind::HighMandateUsage => "high_mandate_usage",
            ConflictKind::InvoiceNotFound => "invoice_not_found",
            ConflictKind::InvalidInvoiceStatus => "invalid_invoice_status",
            ConflictKind::AmountMismatch => "amount_mismatch",
            ConflictKind::DetectionError => "detection_error",
        }
    }
}

/// One detected conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResult {
    pub severity: ConflictSeverity,
    pub kind: ConflictKind,
    pub message: String,
    /// Invoice, batch, or mandate ids the conflict touches
    pub affected_resources: Vec<String>,
    pub suggested_action: String,
    /// Structured context for diagnostics
    pub details: serde_json::Value,
}

/// Tunable detection thresholds
#[derive(Debug, Clone)]
pub struct ConflictLimits {
    /// Maximum entries per batch
    pub max_entries: usize,
    /// Maximum batch total, in euro cents
    pub max_total_amount: i64,
    /// Allowed difference between requested and outstanding amount, cents
    pub amount_tolerance: i64,
    /// Entries per mandate in one batch before a usage warning
    pub mandate_usage_warning: usize,
    /// Days before the dues schedule date that counts as collecting early
    pub early_collection_days: i64,
    /// Days after the dues schedule date that counts as collecting late
    pub late_collection_days: i64,
    /// Collection dates further out than this draw a warning
    pub future_window_days: i64,
}

impl Default for ConflictLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_total_amount: 99_999_999_999,
            amount_tolerance: 1,
            mandate_usage_warning: 50,
            early_collection_days: 30,
            late_collection_days: 90,
            future_window_days: 30,
        }
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Read-only conflict detector over invoice, batch, and mandate stores
pub struct ConflictDetector<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    limits: ConflictLimits,
}

impl<S> ConflictDetector<S>
where
    S: InvoiceStore + BatchStore + MandateStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, limits: ConflictLimits) -> Self {
        Self {
            store,
            clock,
            limits,
        }
    }

    /// Run every check against the candidate.
    ///
    /// Results are sorted critical-first; within a severity, check order is
    /// preserved.
    pub fn detect(&self, candidate: &BatchCandidate) -> Vec<ConflictResult> {
        if candidate.entries.is_empty() {
            return vec![ConflictResult {
                severity: ConflictSeverity::Critical,
                kind: ConflictKind::EmptyBatch,
                message: "batch candidate has no entries".to_string(),
                affected_resources: vec![],
                suggested_action: "add at least one invoice entry".to_string(),
                details: serde_json::json!({}),
            }];
        }

        let mut conflicts = Vec::new();
        self.check_duplicates(candidate, &mut conflicts);
        self.check_cross_batch(candidate, &mut conflicts);
        self.check_dates(candidate, &mut conflicts);
        self.check_schedules(candidate, &mut conflicts);
        self.check_business_limits(candidate, &mut conflicts);
        self.check_mandates(candidate, &mut conflicts);
        self.check_amounts(candidate, &mut conflicts);

        conflicts.sort_by(|a, b| b.severity.cmp(&a.severity));
        conflicts
    }

    /// Convenience wrapper building a full [`ConflictReport`]
    pub fn report(&self, candidate: &BatchCandidate) -> ConflictReport {
        ConflictReport::from_conflicts(self.detect(candidate))
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    fn check_duplicates(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for entry in &candidate.entries {
            *counts.entry(entry.invoice_id.as_str()).or_default() += 1;
        }
        let mut duplicates: Vec<String> = counts
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(id, _)| id.to_string())
            .collect();
        duplicates.sort();

        if !duplicates.is_empty() {
            out.push(ConflictResult {
                severity: ConflictSeverity::Critical,
                kind: ConflictKind::DuplicateInvoice,
                message: format!(
                    "{} invoice(s) appear more than once in the batch",
                    duplicates.len()
                ),
                affected_resources: duplicates.clone(),
                suggested_action: "remove the duplicate entries".to_string(),
                details: serde_json::json!({ "duplicates": duplicates }),
            });
        }
    }

    fn check_cross_batch(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        let ids = candidate.invoice_ids();
        let assignments = match self.store.batches_containing(&ids) {
            Ok(a) => a,
            Err(err) => {
                out.push(detection_error("cross_batch", err));
                return;
            }
        };

        for assignment in assignments {
            if assignment.batch_status.is_terminal_failure() {
                continue;
            }
            let severity = if assignment.batch_status.blocks_reuse() {
                ConflictSeverity::Critical
            } else {
                ConflictSeverity::Warning
            };
            out.push(ConflictResult {
                severity,
                kind: ConflictKind::CrossBatchConflict,
                message: format!(
                    "invoice {} is already in batch {} ({})",
                    assignment.invoice_id,
                    assignment.batch_id,
                    assignment.batch_status.as_str()
                ),
                affected_resources: vec![
                    assignment.invoice_id.clone(),
                    assignment.batch_id.clone(),
                ],
                suggested_action: if severity == ConflictSeverity::Critical {
                    "remove the invoice or cancel the other batch".to_string()
                } else {
                    "verify the earlier collection before re-batching".to_string()
                },
                details: serde_json::json!({
                    "batch_id": assignment.batch_id,
                    "batch_status": assignment.batch_status.as_str(),
                    "batch_date": assignment.batch_date,
                }),
            });
        }
    }

    fn check_dates(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        let today = self.clock.today();
        let date = match candidate.batch_date {
            Some(d) => d,
            None => {
                out.push(ConflictResult {
                    severity: ConflictSeverity::Critical,
                    kind: ConflictKind::MissingBatchDate,
                    message: "batch has no collection date".to_string(),
                    affected_resources: vec![],
                    suggested_action: "set a collection date".to_string(),
                    details: serde_json::json!({}),
                });
                return;
            }
        };

        if date < today {
            out.push(ConflictResult {
                severity: ConflictSeverity::Critical,
                kind: ConflictKind::PastBatchDate,
                message: format!("collection date {date} is in the past"),
                affected_resources: vec![],
                suggested_action: "move the collection date to a future business day".to_string(),
                details: serde_json::json!({ "batch_date": date, "today": today }),
            });
        }

        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            out.push(ConflictResult {
                severity: ConflictSeverity::Warning,
                kind: ConflictKind::WeekendCollection,
                message: format!("collection date {date} falls on a weekend"),
                affected_resources: vec![],
                suggested_action: "banks settle on business days, consider moving the date"
                    .to_string(),
                details: serde_json::json!({ "weekday": date.weekday().to_string() }),
            });
        }

        if date > today + chrono::Duration::days(self.limits.future_window_days) {
            out.push(ConflictResult {
                severity: ConflictSeverity::Warning,
                kind: ConflictKind::FarFutureDate,
                message: format!(
                    "collection date {date} is more than {} days out",
                    self.limits.future_window_days
                ),
                affected_resources: vec![],
                suggested_action: "verify the collection date is intentional".to_string(),
                details: serde_json::json!({ "batch_date": date }),
            });
        }

        match self.store.batches_on_date(date) {
            Ok(batches) => {
                let active: Vec<String> = batches
                    .iter()
                    .filter(|b| matches!(b.status, BatchStatus::Draft | BatchStatus::Generated))
                    .map(|b| b.id.clone())
                    .collect();
                if !active.is_empty() {
                    out.push(ConflictResult {
                        severity: ConflictSeverity::Warning,
                        kind: ConflictKind::SameDateBatch,
                        message: format!(
                            "{} other unsubmitted batch(es) already target {date}",
                            active.len()
                        ),
                        affected_resources: active.clone(),
                        suggested_action: "consider merging into the existing batch".to_string(),
                        details: serde_json::json!({ "batches": active }),
                    });
                }
            }
            Err(err) => out.push(detection_error("same_date", err)),
        }
    }

    fn check_schedules(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        let date = match candidate.batch_date {
            Some(d) => d,
            None => return,
        };
        let invoices = match self.store.invoices(&candidate.invoice_ids()) {
            Ok(rows) => rows,
            Err(err) => {
                out.push(detection_error("schedules", err));
                return;
            }
        };

        for invoice in &invoices {
            let due = match invoice.schedule_next_due {
                Some(d) => d,
                None => continue,
            };
            let offset_days = (date - due).num_days();
            if offset_days < -self.limits.early_collection_days {
                out.push(ConflictResult {
                    severity: ConflictSeverity::Warning,
                    kind: ConflictKind::EarlyCollection,
                    message: format!(
                        "invoice {} would be collected {} days before its due date {due}",
                        invoice.id, -offset_days
                    ),
                    affected_resources: vec![invoice.id.clone()],
                    suggested_action: "confirm early collection with the member".to_string(),
                    details: serde_json::json!({ "due": due, "offset_days": offset_days }),
                });
            } else if offset_days > self.limits.late_collection_days {
                out.push(ConflictResult {
                    severity: ConflictSeverity::Warning,
                    kind: ConflictKind::LateCollection,
                    message: format!(
                        "invoice {} would be collected {offset_days} days after its due date {due}",
                        invoice.id
                    ),
                    affected_resources: vec![invoice.id.clone()],
                    suggested_action: "check whether the invoice should be dunned instead"
                        .to_string(),
                    details: serde_json::json!({ "due": due, "offset_days": offset_days }),
                });
            }
        }
    }

    fn check_business_limits(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        if candidate.entries.len() > self.limits.max_entries {
            out.push(ConflictResult {
                severity: ConflictSeverity::Critical,
                kind: ConflictKind::BatchSizeLimit,
                message: format!(
                    "batch has {} entries, limit is {}",
                    candidate.entries.len(),
                    self.limits.max_entries
                ),
                affected_resources: vec![],
                suggested_action: "split the batch".to_string(),
                details: serde_json::json!({ "entries": candidate.entries.len() }),
            });
        }

        let total = candidate.total_amount();
        if total > self.limits.max_total_amount {
            out.push(ConflictResult {
                severity: ConflictSeverity::Critical,
                kind: ConflictKind::AmountLimit,
                message: format!(
                    "batch total {total} cents exceeds the limit of {} cents",
                    self.limits.max_total_amount
                ),
                affected_resources: vec![],
                suggested_action: "split the batch".to_string(),
                details: serde_json::json!({ "total_cents": total }),
            });
        }

        let non_positive: Vec<String> = candidate
            .entries
            .iter()
            .filter(|e| e.amount <= 0)
            .map(|e| e.invoice_id.clone())
            .collect();
        if !non_positive.is_empty() {
            out.push(ConflictResult {
                severity: ConflictSeverity::Warning,
                kind: ConflictKind::NonPositiveAmount,
                message: format!("{} entries have a non-positive amount", non_positive.len()),
                affected_resources: non_positive,
                suggested_action: "remove zero and negative entries".to_string(),
                details: serde_json::json!({}),
            });
        }

        if candidate.batch_type == BatchType::B2b {
            out.push(ConflictResult {
                severity: ConflictSeverity::Info,
                kind: ConflictKind::B2bRequirements,
                message: "B2B scheme requires business mandates validated by the debtor bank"
                    .to_string(),
                affected_resources: vec![],
                suggested_action: "confirm all mandates are registered as B2B".to_string(),
                details: serde_json::json!({}),
            });
        }
    }

    fn check_mandates(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        let today = self.clock.today();
        let mut grouped: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in &candidate.entries {
            grouped
                .entry(entry.mandate_reference.as_str())
                .or_default()
                .push(entry.invoice_id.as_str());
        }

        let mut references: Vec<&&str> = grouped.keys().collect();
        references.sort();

        for reference in references {
            let invoices = &grouped[*reference];
            let mandate = match self.store.mandate(reference) {
                Ok(m) => m,
                Err(err) => {
                    out.push(detection_error("mandates", err));
                    continue;
                }
            };

            match mandate {
                None => out.push(ConflictResult {
                    severity: ConflictSeverity::Critical,
                    kind: ConflictKind::MandateNotFound,
                    message: format!("mandate {reference} does not exist"),
                    affected_resources: invoices.iter().map(|s| s.to_string()).collect(),
                    suggested_action: "obtain a signed mandate before collecting".to_string(),
                    details: serde_json::json!({ "mandate": reference }),
                }),
                Some(m) => {
                    if m.status != MandateStatus::Active {
                        out.push(ConflictResult {
                            severity: ConflictSeverity::Critical,
                            kind: ConflictKind::InactiveMandate,
                            message: format!(
                                "mandate {reference} is {}, not Active",
                                m.status.as_str()
                            ),
                            affected_resources: invoices.iter().map(|s| s.to_string()).collect(),
                            suggested_action: "reactivate or replace the mandate".to_string(),
                            details: serde_json::json!({ "status": m.status.as_str() }),
                        });
                    }
                    if let Some(expiry) = m.expiry_date {
                        if expiry < today {
                            out.push(ConflictResult {
                                severity: ConflictSeverity::Critical,
                                kind: ConflictKind::ExpiredMandate,
                                message: format!("mandate {reference} expired on {expiry}"),
                                affected_resources: invoices
                                    .iter()
                                    .map(|s| s.to_string())
                                    .collect(),
                                suggested_action: "obtain a new mandate".to_string(),
                                details: serde_json::json!({ "expiry": expiry }),
                            });
                        }
                    }
                    if invoices.len() > self.limits.mandate_usage_warning {
                        out.push(ConflictResult {
                            severity: ConflictSeverity::Warning,
                            kind: ConflictKind::HighMandateUsage,
                            message: format!(
                                "mandate {reference} collects {} invoices in this batch",
                                invoices.len()
                            ),
                            affected_resources: vec![reference.to_string()],
                            suggested_action: "verify the mandate covers bulk collection"
                                .to_string(),
                            details: serde_json::json!({ "count": invoices.len() }),
                        });
                    }
                }
            }
        }
    }

    fn check_amounts(&self, candidate: &BatchCandidate, out: &mut Vec<ConflictResult>) {
        let ids = candidate.invoice_ids();
        let invoices = match self.store.invoices(&ids) {
            Ok(rows) => rows,
            Err(err) => {
                out.push(detection_error("amounts", err));
                return;
            }
        };
        let by_id: HashMap<&str, _> = invoices.iter().map(|i| (i.id.as_str(), i)).collect();

        for entry in &candidate.entries {
            let invoice = match by_id.get(entry.invoice_id.as_str()) {
                Some(i) => *i,
                None => {
                    out.push(ConflictResult {
                        severity: ConflictSeverity::Critical,
                        kind: ConflictKind::InvoiceNotFound,
                        message: format!("invoice {} does not exist", entry.invoice_id),
                        affected_resources: vec![entry.invoice_id.clone()],
                        suggested_action: "remove the entry".to_string(),
                        details: serde_json::json!({}),
                    });
                    continue;
                }
            };

            if !invoice.status.is_collectable() {
                out.push(ConflictResult {
                    severity: ConflictSeverity::Critical,
                    kind: ConflictKind::InvalidInvoiceStatus,
                    message: format!(
                        "invoice {} is {}, not collectable",
                        invoice.id,
                        invoice.status.as_str()
                    ),
                    affected_resources: vec![invoice.id.clone()],
                    suggested_action: "remove the entry".to_string(),
                    details: serde_json::json!({ "status": invoice.status.as_str() }),
                });
            }

            let delta = (entry.amount - invoice.outstanding_amount).abs();
            if delta > self.limits.amount_tolerance {
                out.push(ConflictResult {
                    severity: ConflictSeverity::Critical,
                    kind: ConflictKind::AmountMismatch,
                    message: format!(
                        "invoice {}: requested {} cents but {} cents outstanding",
                        invoice.id, entry.amount, invoice.outstanding_amount
                    ),
                    affected_resources: vec![invoice.id.clone()],
                    suggested_action: "re-sync the entry amount with the invoice".to_string(),
                    details: serde_json::json!({
                        "requested_cents": entry.amount,
                        "outstanding_cents": invoice.outstanding_amount,
                        "delta_cents": delta,
                    }),
                });
            }
        }
    }
}

/// Fold a store failure during one check into a warning-level result
fn detection_error(check: &str, err: StoreError) -> ConflictResult {
    tracing::warn!(check, error = %err, "conflict check could not complete");
    ConflictResult {
        severity: ConflictSeverity::Warning,
        kind: ConflictKind::DetectionError,
        message: format!("check '{check}' could not complete: {err}"),
        affected_resources: vec![],
        suggested_action: "re-run conflict detection".to_string(),
        details: serde_json::json!({ "check": check }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::models::{InvoiceEntry, InvoiceRecord, InvoiceStatus};
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn detector(store: Arc<MemoryStore>) -> ConflictDetector<MemoryStore> {
        // Monday 2025-06-02
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
        ));
        ConflictDetector::new(store, clock, ConflictLimits::default())
    }

    fn entry(id: &str, amount: i64) -> InvoiceEntry {
        InvoiceEntry::new(id, amount, "NL91ABNA0417164300", "Jan Visser", "MND-001")
    }

    #[test]
    fn test_empty_batch_is_critical() {
        let store = Arc::new(MemoryStore::new());
        let d = detector(store);
        let candidate = BatchCandidate::new(NaiveDate::from_ymd_opt(2025, 6, 9), BatchType::Core);

        let conflicts = d.detect(&candidate);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::EmptyBatch);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Critical);
    }

    #[test]
    fn test_duplicates_detected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_invoice(InvoiceRecord::new("SI-001", InvoiceStatus::Unpaid, 2500));
        store.insert_mandate(crate::models::Mandate::new(
            "MND-001",
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        ));
        let d = detector(store);

        let candidate = BatchCandidate::new(NaiveDate::from_ymd_opt(2025, 6, 9), BatchType::Core)
            .with_entry(entry("SI-001", 2500))
            .with_entry(entry("SI-001", 2500));

        let conflicts = d.detect(&candidate);
        assert!(conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::DuplicateInvoice
                && c.severity == ConflictSeverity::Critical));
    }

    #[test]
    fn test_missing_date_skips_other_date_checks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_invoice(InvoiceRecord::new("SI-001", InvoiceStatus::Unpaid, 2500));
        store.insert_mandate(crate::models::Mandate::new(
            "MND-001",
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        ));
        let d = detector(store);

        let candidate =
            BatchCandidate::new(None, BatchType::Core).with_entry(entry("SI-001", 2500));

        let conflicts = d.detect(&candidate);
        assert!(conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::MissingBatchDate));
        assert!(!conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::WeekendCollection));
    }

    #[test]
    fn test_results_sorted_critical_first() {
        let store = Arc::new(MemoryStore::new());
        // Saturday date (warning) + missing invoice/mandate (critical)
        let d = detector(store);
        let candidate = BatchCandidate::new(NaiveDate::from_ymd_opt(2025, 6, 7), BatchType::Core)
            .with_entry(entry("SI-404", 2500));

        let conflicts = d.detect(&candidate);
        assert!(conflicts.len() >= 2);
        for pair in conflicts.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
    }
}
