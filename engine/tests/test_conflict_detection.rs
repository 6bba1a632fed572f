//! Integration tests for conflict detection and reporting

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use sepa_batch_engine::conflict::{
    ConflictDetector, ConflictKind, ConflictLimits, ConflictReport, ConflictResult,
    ConflictSeverity,
};
use sepa_batch_engine::core::ManualClock;
use sepa_batch_engine::models::{
    BatchCandidate, BatchRecord, BatchStatus, BatchType, InvoiceEntry, InvoiceRecord,
    InvoiceStatus, Mandate, MandateStatus,
};
use sepa_batch_engine::store::MemoryStore;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Detector with "today" fixed to Monday 2025-06-02
fn detector(store: Arc<MemoryStore>) -> ConflictDetector<MemoryStore> {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ));
    ConflictDetector::new(store, clock, ConflictLimits::default())
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_invoice(
        InvoiceRecord::new("SI-001", InvoiceStatus::Unpaid, 2500)
            .with_member("MEM-001")
            .with_mandate("MND-001"),
    );
    store.insert_invoice(
        InvoiceRecord::new("SI-002", InvoiceStatus::Overdue, 4375)
            .with_member("MEM-002")
            .with_mandate("MND-002"),
    );
    store.insert_mandate(Mandate::new("MND-001", date(2024, 1, 10)).with_member("MEM-001"));
    store.insert_mandate(Mandate::new("MND-002", date(2024, 3, 5)).with_member("MEM-002"));
    store
}

fn entry(id: &str, amount: i64, mandate: &str) -> InvoiceEntry {
    InvoiceEntry::new(id, amount, "NL91ABNA0417164300", "Jan Visser", mandate)
}

fn candidate() -> BatchCandidate {
    // Monday a week out
    BatchCandidate::new(Some(date(2025, 6, 9)), BatchType::Core)
        .with_entry(entry("SI-001", 2500, "MND-001"))
        .with_entry(entry("SI-002", 4375, "MND-002"))
}

fn batch_with(id: &str, status: BatchStatus, invoice: &str, amount: i64) -> BatchRecord {
    BatchRecord {
        id: id.to_string(),
        batch_date: date(2025, 6, 5),
        batch_type: BatchType::Core,
        status,
        description: "existing batch".to_string(),
        entries: vec![entry(invoice, amount, "MND-001")],
        total_amount: amount,
        entry_count: 1,
        created_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
    }
}

#[test]
fn clean_candidate_passes() {
    let store = seeded_store();
    let report = detector(store).report(&candidate());
    assert!(report.can_proceed, "unexpected conflicts: {report:?}");
    assert_eq!(report.critical_count, 0);
}

#[test]
fn invoice_in_submitted_batch_blocks() {
    let store = seeded_store();
    store.seed_batch(batch_with("DD-OLD", BatchStatus::Submitted, "SI-001", 2500));

    let report = detector(store).report(&candidate());
    assert!(!report.can_proceed);
    assert!(report.conflicts.iter().any(|c| {
        c.kind == ConflictKind::CrossBatchConflict && c.severity == ConflictSeverity::Critical
    }));
}

#[test]
fn invoice_in_settled_batch_only_warns() {
    let store = seeded_store();
    store.seed_batch(batch_with("DD-OLD", BatchStatus::Settled, "SI-001", 2500));

    let report = detector(store).report(&candidate());
    assert!(report.can_proceed);
    assert!(report.conflicts.iter().any(|c| {
        c.kind == ConflictKind::CrossBatchConflict && c.severity == ConflictSeverity::Warning
    }));
}

#[test]
fn invoice_in_failed_batch_is_invisible() {
    let store = seeded_store();
    store.seed_batch(batch_with("DD-OLD", BatchStatus::Failed, "SI-001", 2500));

    let report = detector(store).report(&candidate());
    assert!(!report
        .conflicts
        .iter()
        .any(|c| c.kind == ConflictKind::CrossBatchConflict));
}

#[test]
fn amount_mismatch_beyond_one_cent_blocks() {
    let store = seeded_store();
    let d = detector(store);

    // One cent off: inside tolerance
    let near = BatchCandidate::new(Some(date(2025, 6, 9)), BatchType::Core)
        .with_entry(entry("SI-001", 2501, "MND-001"));
    assert!(d.report(&near).can_proceed);

    // Two cents off: blocked
    let off = BatchCandidate::new(Some(date(2025, 6, 9)), BatchType::Core)
        .with_entry(entry("SI-001", 2502, "MND-001"));
    let report = d.report(&off);
    assert!(!report.can_proceed);
    assert!(report
        .conflicts
        .iter()
        .any(|c| c.kind == ConflictKind::AmountMismatch));
}

#[test]
fn past_date_blocks_weekend_warns() {
    let store = seeded_store();
    let d = detector(store);

    let past = BatchCandidate::new(Some(date(2025, 5, 30)), BatchType::Core)
        .with_entry(entry("SI-001", 2500, "MND-001"));
    assert!(d
        .report(&past)
        .conflicts
        .iter()
        .any(|c| c.kind == ConflictKind::PastBatchDate
            && c.severity == ConflictSeverity::Critical));

    // Saturday
    let weekend = BatchCandidate::new(Some(date(2025, 6, 7)), BatchType::Core)
        .with_entry(entry("SI-001", 2500, "MND-001"));
    let report = d.report(&weekend);
    assert!(report.can_proceed);
    assert!(report
        .conflicts
        .iter()
        .any(|c| c.kind == ConflictKind::WeekendCollection));
}

#[test]
fn schedule_windows_warn() {
    let store = Arc::new(MemoryStore::new());
    store.insert_invoice(
        InvoiceRecord::new("SI-001", InvoiceStatus::Unpaid, 2500)
            .with_mandate("MND-001")
            .with_schedule_next_due(date(2025, 8, 1)),
    );
    store.insert_invoice(
        InvoiceRecord::new("SI-002", InvoiceStatus::Unpaid, 2500)
            .with_mandate("MND-001")
            .with_schedule_next_due(date(2025, 2, 1)),
    );
    store.insert_mandate(Mandate::new("MND-001", date(2024, 1, 10)));
    let d = detector(store);

    let c = BatchCandidate::new(Some(date(2025, 6, 9)), BatchType::Core)
        .with_entry(entry("SI-001", 2500, "MND-001"))
        .with_entry(entry("SI-002", 2500, "MND-001"));
    let report = d.report(&c);

    // SI-001: 53 days early; SI-002: 128 days late
    assert!(report
        .conflicts
        .iter()
        .any(|r| r.kind == ConflictKind::EarlyCollection));
    assert!(report
        .conflicts
        .iter()
        .any(|r| r.kind == ConflictKind::LateCollection));
    assert!(report.can_proceed);
}

#[test]
fn inactive_and_expired_mandates_block() {
    let store = seeded_store();
    store.insert_mandate(
        Mandate::new("MND-003", date(2024, 1, 10)).with_status(MandateStatus::Suspended),
    );
    store.insert_mandate(
        Mandate::new("MND-004", date(2020, 1, 10)).with_expiry(date(2025, 1, 1)),
    );
    store.insert_invoice(InvoiceRecord::new("SI-003", InvoiceStatus::Unpaid, 1000));
    store.insert_invoice(InvoiceRecord::new("SI-004", InvoiceStatus::Unpaid, 1000));
    let d = detector(store);

    let c = BatchCandidate::new(Some(date(2025, 6, 9)), BatchType::Core)
        .with_entry(entry("SI-003", 1000, "MND-003"))
        .with_entry(entry("SI-004", 1000, "MND-004"));
    let report = d.report(&c);
    assert!(!report.can_proceed);
    assert!(report
        .conflicts
        .iter()
        .any(|r| r.kind == ConflictKind::InactiveMandate));
    assert!(report
        .conflicts
        .iter()
        .any(|r| r.kind == ConflictKind::ExpiredMandate));
}

#[test]
fn recommendations_and_next_steps_follow_outcome() {
    let store = seeded_store();
    let d = detector(store);

    let clean = d.report(&candidate());
    assert_eq!(
        clean.next_steps(),
        vec!["no conflicts, batch creation may proceed".to_string()]
    );

    let broken = d.report(
        &BatchCandidate::new(Some(date(2025, 6, 9)), BatchType::Core)
            .with_entry(entry("SI-404", 1000, "MND-404")),
    );
    assert!(!broken.can_proceed);
    assert!(broken.next_steps()[0].contains("critical"));
    assert!(!broken.recommendations().is_empty());
}

// ----------------------------------------------------------------------------
// Property: report gating is exactly "no critical conflicts"
// ----------------------------------------------------------------------------

fn arb_conflict() -> impl Strategy<Value = ConflictResult> {
    prop_oneof![
        Just(ConflictSeverity::Info),
        Just(ConflictSeverity::Warning),
        Just(ConflictSeverity::Critical),
    ]
    .prop_map(|severity| ConflictResult {
        severity,
        kind: ConflictKind::DetectionError,
        message: "generated".to_string(),
        affected_resources: vec![],
        suggested_action: "n/a".to_string(),
        details: serde_json::json!({}),
    })
}

proptest! {
    #[test]
    fn report_gates_on_critical_only(conflicts in proptest::collection::vec(arb_conflict(), 0..20)) {
        let has_critical = conflicts
            .iter()
            .any(|c| c.severity == ConflictSeverity::Critical);
        let report = ConflictReport::from_conflicts(conflicts.clone());

        prop_assert_eq!(report.can_proceed, !has_critical);
        prop_assert_eq!(
            report.critical_count + report.warning_count + report.info_count,
            conflicts.len()
        );
    }
}
