//! Mandate sequence validation
//!
//! Derives the SEPA sequence type (FRST/RCUR/FNAL/OOFF) a collection must
//! carry from the mandate's usage history, and records usage after a batch
//! commits. Banks reject instructions whose sequence type contradicts the
//! mandate history, so derivation is conservative: when the history says the
//! mandate can no longer be used, no sequence type is recommended at all.
//!
//! # Critical Invariants
//!
//! - A one-off mandate supports exactly one collection; any further attempt
//!   classifies as expired use.
//! - A mandate whose last collection was FNAL is closed permanently.
//! - A recurring mandate unused for more than 36 months is no longer valid
//!   under the scheme rules and must be re-signed. The same window applies to
//!   the signature itself: a mandate signed more than 36 months ago fails
//!   transaction validation outright.
//! - A mandate without an IBAN can never be collected against.
//! - Usage recording is idempotent per (invoice, transaction) pair, so a
//!   retried batch commit never double-counts.
//!
//! Month arithmetic is day-exact: a mandate signed Jan 31 is one month old
//! on Feb 28/29 plus one day, not on Feb 28. `whole_months_between` only
//! counts a month as elapsed once the day-of-month has been reached.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::core::Clock;
use crate::models::{Mandate, MandateStatus, SequenceType, UsageRecord};
use crate::store::{InvoiceStore, MandateStore, StoreError};

// ============================================================================
// Types
// ============================================================================

/// How the upcoming collection classifies against the mandate history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageType {
    NeverUsed,
    FirstUse,
    RecurringUse,
    FinalUse,
    /// Mandate can no longer be used (consumed, closed, or lapsed)
    ExpiredUse,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::NeverUsed => "never_used",
            UsageType::FirstUse => "first_use",
            UsageType::RecurringUse => "recurring_use",
            UsageType::FinalUse => "final_use",
            UsageType::ExpiredUse => "expired_use",
        }
    }
}

/// Caller intent for the collection being validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionContext {
    /// Collect once and consume the mandate
    pub one_off: bool,
    /// This is the last collection under the mandate
    pub is_final: bool,
}

/// Scheme and house rules for mandate validity
#[derive(Debug, Clone)]
pub struct MandateRules {
    /// Scheme validity window for unused recurring mandates
    pub validity_months: i32,
    /// Age at which a renewal reminder is warranted
    pub renewal_warning_months: i32,
    /// Days without usage before the mandate counts as dormant
    pub dormancy_warning_days: i64,
    /// Days before expiry at which to start warning
    pub expiry_warning_days: i64,
    /// Per-transaction ceiling, in euro cents
    pub max_transaction_amount: i64,
    /// Lifetime usage count that draws a warning
    pub high_usage_threshold: u32,
}

impl Default for MandateRules {
    fn default() -> Self {
        Self {
            validity_months: 36,
            renewal_warning_months: 30,
            dormancy_warning_days: 365,
            expiry_warning_days: 30,
            max_transaction_amount: 99_999_999_999,
            high_usage_threshold: 50,
        }
    }
}

/// Outcome of sequence derivation and transaction validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceValidation {
    /// No errors and a sequence type could be recommended
    pub is_valid: bool,
    /// Sequence type to put on the instruction, absent when unusable
    pub recommended: Option<SequenceType>,
    pub usage_type: UsageType,
    pub last_usage_date: Option<NaiveDate>,
    pub usage_count: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Sequence types the mandate's current history permits
    pub next_allowed: Vec<SequenceType>,
}

/// Coarse lifecycle stage for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStage {
    /// Signed but never collected
    Fresh,
    /// In regular use
    Established,
    /// Old enough that renewal should be planned
    RenewalDue,
    /// Explicit expiry date is close
    ExpiringSoon,
    /// No collection within the dormancy window
    Dormant,
    /// Consumed, completed, cancelled, or expired
    Closed,
}

/// Lifecycle assessment of a mandate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MandateLifecycle {
    pub stage: LifecycleStage,
    pub age_months: i32,
    pub last_usage: Option<NaiveDate>,
    pub usage_count: u32,
    pub notes: Vec<String>,
}

// ============================================================================
// Month arithmetic
// ============================================================================

/// Whole months elapsed from `from` to `to`, day-exact
pub fn whole_months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    let mut months =
        (to.year() - from.year()) * 12 + (to.month() as i32 - from.month() as i32);
    if to.day() < from.day() {
        months -= 1;
    }
    months
}

// ============================================================================
// Validator
// ============================================================================

/// Sequence validator over mandate and member stores
pub struct MandateSequenceValidator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    rules: MandateRules,
}

impl<S> MandateSequenceValidator<S>
where
    S: MandateStore + InvoiceStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, rules: MandateRules) -> Self {
        Self {
            store,
            clock,
            rules,
        }
    }

    /// Derive the sequence type the upcoming collection must carry.
    ///
    /// Unusable mandates (consumed one-offs, FNAL-closed, lapsed) come back
    /// with `recommended: None` and the reason in `errors`; only store
    /// failures surface as `Err`.
    pub fn determine_sequence_type(
        &self,
        mandate_id: &str,
        context: &TransactionContext,
    ) -> Result<SequenceValidation, StoreError> {
        let mandate = match self.store.mandate(mandate_id)? {
            Some(m) => m,
            None => {
                return Ok(SequenceValidation {
                    is_valid: false,
                    recommended: None,
                    usage_type: UsageType::NeverUsed,
                    last_usage_date: None,
                    usage_count: 0,
                    warnings: vec![],
                    errors: vec![format!("mandate {mandate_id} not found")],
                    next_allowed: vec![],
                });
            }
        };

        let history = self.store.usage_history(mandate_id)?;
        let today = self.clock.today();
        let last_usage_date = history.last().map(|u| u.usage_date);

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let (usage_type, recommended) = if mandate.one_off || context.one_off {
            if history.is_empty() {
                (UsageType::FirstUse, Some(SequenceType::Ooff))
            } else {
                errors.push(format!(
                    "one-off mandate {mandate_id} has already been used"
                ));
                (UsageType::ExpiredUse, None)
            }
        } else if history.is_empty() {
            if context.is_final {
                warnings.push("final collection requested on an unused mandate".to_string());
            }
            (UsageType::FirstUse, Some(SequenceType::Frst))
        } else if context.is_final {
            (UsageType::FinalUse, Some(SequenceType::Fnal))
        } else {
            let last = &history[history.len() - 1];
            if last.sequence_type == SequenceType::Fnal {
                errors.push(format!(
                    "mandate {mandate_id} was closed by a final collection on {}",
                    last.usage_date
                ));
                (UsageType::ExpiredUse, None)
            } else if whole_months_between(last.usage_date, today) > self.rules.validity_months {
                errors.push(format!(
                    "mandate {mandate_id} unused since {}, past the {}-month validity window",
                    last.usage_date, self.rules.validity_months
                ));
                (UsageType::ExpiredUse, None)
            } else {
                (UsageType::RecurringUse, Some(SequenceType::Rcur))
            }
        };

        self.lifecycle_warnings(&mandate, last_usage_date, today, &mut warnings);

        let next_allowed = next_allowed_sequences(&mandate, &history, usage_type);
        let is_valid = errors.is_empty() && recommended.is_some();

        Ok(SequenceValidation {
            is_valid,
            recommended,
            usage_type,
            last_usage_date,
            usage_count: history.len(),
            warnings,
            errors,
            next_allowed,
        })
    }

    /// Full pre-collection validation: sequence derivation plus amount,
    /// mandate status, signature age, IBAN presence, expiry, and member
    /// standing checks.
    pub fn validate_for_transaction(
        &self,
        mandate_id: &str,
        amount: i64,
        context: &TransactionContext,
    ) -> Result<SequenceValidation, StoreError> {
        let mut validation = self.determine_sequence_type(mandate_id, context)?;

        let mandate = match self.store.mandate(mandate_id)? {
            Some(m) => m,
            None => return Ok(validation),
        };
        let today = self.clock.today();

        if amount <= 0 {
            validation
                .errors
                .push("collection amount must be positive".to_string());
        } else if amount > self.rules.max_transaction_amount {
            validation.errors.push(format!(
                "collection amount {amount} cents exceeds the {} cent limit",
                self.rules.max_transaction_amount
            ));
        }

        if mandate.status != MandateStatus::Active {
            validation.errors.push(format!(
                "mandate {mandate_id} is {}, not Active",
                mandate.status.as_str()
            ));
        }

        // Scheme validity runs from the signature as well as from the last
        // collection; a stale signature alone makes the mandate unusable
        let age_months = whole_months_between(mandate.sign_date, today);
        if age_months > self.rules.validity_months {
            validation.errors.push(format!(
                "mandate {mandate_id} was signed {age_months} months ago, past the \
                 {}-month validity window",
                self.rules.validity_months
            ));
            validation.usage_type = UsageType::ExpiredUse;
            validation.recommended = None;
            validation.next_allowed.clear();
        }

        if mandate.iban.as_deref().map_or(true, |i| i.trim().is_empty()) {
            validation
                .errors
                .push(format!("mandate {mandate_id} has no IBAN"));
        }

        if let Some(expiry) = mandate.expiry_date {
            if expiry < today {
                validation
                    .errors
                    .push(format!("mandate {mandate_id} expired on {expiry}"));
            }
        }

        if let Some(member_id) = &mandate.member {
            match self.store.member(member_id)? {
                Some(member) if !member.status.is_eligible() => {
                    validation.errors.push(format!(
                        "member {member_id} is not in good standing"
                    ));
                }
                Some(_) => {}
                None => validation
                    .warnings
                    .push(format!("member {member_id} not found")),
            }
        }

        validation.is_valid = validation.errors.is_empty() && validation.recommended.is_some();
        Ok(validation)
    }

    /// Record a completed collection against the mandate.
    ///
    /// Idempotent: a usage with the same transaction and invoice reference
    /// is skipped and reported as `false`. OOFF consumption and FNAL
    /// completion transition the mandate status.
    pub fn record_usage(
        &self,
        mandate_id: &str,
        sequence_type: SequenceType,
        amount: i64,
        invoice_reference: &str,
        transaction_id: &str,
    ) -> Result<bool, StoreError> {
        let history = self.store.usage_history(mandate_id)?;
        let duplicate = history.iter().any(|u| {
            u.transaction_id == transaction_id && u.invoice_reference == invoice_reference
        });
        if duplicate {
            tracing::debug!(
                mandate_id,
                transaction_id,
                invoice_reference,
                "usage already recorded, skipping"
            );
            return Ok(false);
        }

        self.store.append_usage(
            mandate_id,
            UsageRecord {
                usage_date: self.clock.today(),
                sequence_type,
                amount,
                invoice_reference: invoice_reference.to_string(),
                transaction_id: transaction_id.to_string(),
            },
        )?;

        match sequence_type {
            SequenceType::Ooff => {
                self.store.set_mandate_status(mandate_id, MandateStatus::Used)?;
            }
            SequenceType::Fnal => {
                self.store
                    .set_mandate_status(mandate_id, MandateStatus::Completed)?;
            }
            _ => {}
        }

        tracing::info!(
            mandate_id,
            sequence = sequence_type.code(),
            amount_cents = amount,
            transaction_id,
            "mandate usage recorded"
        );
        Ok(true)
    }

    /// Lifecycle assessment for reporting and renewal planning
    pub fn lifecycle(&self, mandate_id: &str) -> Result<MandateLifecycle, StoreError> {
        let mandate = self
            .store
            .mandate(mandate_id)?
            .ok_or_else(|| StoreError::NotFound(format!("mandate {mandate_id}")))?;
        let history = self.store.usage_history(mandate_id)?;
        let today = self.clock.today();
        let age_months = whole_months_between(mandate.sign_date, today);
        let last_usage = history.last().map(|u| u.usage_date);

        let mut notes = Vec::new();
        self.lifecycle_warnings(&mandate, last_usage, today, &mut notes);

        let stage = if matches!(
            mandate.status,
            MandateStatus::Used
                | MandateStatus::Completed
                | MandateStatus::Cancelled
                | MandateStatus::Expired
        ) {
            LifecycleStage::Closed
        } else if mandate
            .expiry_date
            .map_or(false, |e| (e - today).num_days() <= self.rules.expiry_warning_days)
        {
            LifecycleStage::ExpiringSoon
        } else if age_months >= self.rules.renewal_warning_months {
            LifecycleStage::RenewalDue
        } else if last_usage
            .map_or(false, |d| (today - d).num_days() > self.rules.dormancy_warning_days)
        {
            LifecycleStage::Dormant
        } else if history.is_empty() {
            LifecycleStage::Fresh
        } else {
            LifecycleStage::Established
        };

        Ok(MandateLifecycle {
            stage,
            age_months,
            last_usage,
            usage_count: mandate.usage_count,
            notes,
        })
    }

    fn lifecycle_warnings(
        &self,
        mandate: &Mandate,
        last_usage: Option<NaiveDate>,
        today: NaiveDate,
        out: &mut Vec<String>,
    ) {
        let age_months = whole_months_between(mandate.sign_date, today);
        if age_months >= self.rules.renewal_warning_months {
            out.push(format!(
                "mandate is {age_months} months old, plan renewal before the {}-month mark",
                self.rules.validity_months
            ));
        }

        if let Some(expiry) = mandate.expiry_date {
            let days = (expiry - today).num_days();
            if (0..=self.rules.expiry_warning_days).contains(&days) {
                out.push(format!("mandate expires in {days} day(s) on {expiry}"));
            }
        }

        if let Some(last) = last_usage {
            if (today - last).num_days() > self.rules.dormancy_warning_days {
                out.push(format!("mandate dormant since {last}"));
            }
        }

        if mandate.usage_count >= self.rules.high_usage_threshold {
            out.push(format!(
                "mandate has {} recorded usages",
                mandate.usage_count
            ));
        }
    }
}

/// Sequence types the current history permits, independent of caller intent
fn next_allowed_sequences(
    mandate: &Mandate,
    history: &[UsageRecord],
    usage_type: UsageType,
) -> Vec<SequenceType> {
    if usage_type == UsageType::ExpiredUse {
        return vec![];
    }
    if history.is_empty() {
        return vec![SequenceType::Frst, SequenceType::Ooff];
    }
    if mandate.one_off {
        return vec![];
    }
    match history.last().map(|u| u.sequence_type) {
        Some(SequenceType::Fnal) | Some(SequenceType::Ooff) => vec![],
        _ => vec![SequenceType::Rcur, SequenceType::Fnal],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::store::{MandateStore, MemoryStore};
    use chrono::{TimeZone, Utc};

    fn validator(
        store: Arc<MemoryStore>,
        today: NaiveDate,
    ) -> MandateSequenceValidator<MemoryStore> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(today.year(), today.month(), today.day(), 9, 0, 0).unwrap(),
        ));
        MandateSequenceValidator::new(store, clock, MandateRules::default())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn usage(day: NaiveDate, seq: SequenceType, txn: &str) -> UsageRecord {
        UsageRecord {
            usage_date: day,
            sequence_type: seq,
            amount: 2500,
            invoice_reference: format!("SI-{txn}"),
            transaction_id: txn.to_string(),
        }
    }

    #[test]
    fn test_day_exact_month_arithmetic() {
        assert_eq!(whole_months_between(date(2025, 1, 31), date(2025, 2, 28)), 0);
        assert_eq!(whole_months_between(date(2025, 1, 31), date(2025, 3, 1)), 1);
        assert_eq!(whole_months_between(date(2022, 6, 15), date(2025, 6, 15)), 36);
        assert_eq!(whole_months_between(date(2022, 6, 15), date(2025, 6, 14)), 35);
    }

    #[test]
    fn test_unused_mandate_gets_frst() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2025, 1, 10)));
        let v = validator(store, date(2025, 6, 2));

        let result = v
            .determine_sequence_type("MND-001", &TransactionContext::default())
            .unwrap();
        assert!(result.is_valid);
        assert_eq!(result.recommended, Some(SequenceType::Frst));
        assert_eq!(result.usage_type, UsageType::FirstUse);
        assert_eq!(
            result.next_allowed,
            vec![SequenceType::Frst, SequenceType::Ooff]
        );
    }

    #[test]
    fn test_used_mandate_gets_rcur() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2024, 1, 10)));
        store
            .append_usage("MND-001", usage(date(2025, 5, 1), SequenceType::Frst, "B1"))
            .unwrap();
        let v = validator(store, date(2025, 6, 2));

        let result = v
            .determine_sequence_type("MND-001", &TransactionContext::default())
            .unwrap();
        assert_eq!(result.recommended, Some(SequenceType::Rcur));
        assert_eq!(
            result.next_allowed,
            vec![SequenceType::Rcur, SequenceType::Fnal]
        );
    }

    #[test]
    fn test_consumed_one_off_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2024, 1, 10)).one_off());
        store
            .append_usage("MND-001", usage(date(2025, 5, 1), SequenceType::Ooff, "B1"))
            .unwrap();
        let v = validator(store, date(2025, 6, 2));

        let result = v
            .determine_sequence_type("MND-001", &TransactionContext::default())
            .unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.recommended, None);
        assert_eq!(result.usage_type, UsageType::ExpiredUse);
        assert!(result.next_allowed.is_empty());
    }

    #[test]
    fn test_fnal_closes_mandate() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2023, 1, 10)));
        store
            .append_usage("MND-001", usage(date(2025, 4, 1), SequenceType::Fnal, "B1"))
            .unwrap();
        let v = validator(store, date(2025, 6, 2));

        let result = v
            .determine_sequence_type("MND-001", &TransactionContext::default())
            .unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.usage_type, UsageType::ExpiredUse);
    }

    #[test]
    fn test_lapsed_mandate_exactly_36_months_still_valid() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2020, 1, 10)));
        store
            .append_usage("MND-001", usage(date(2022, 6, 2), SequenceType::Frst, "B1"))
            .unwrap();
        // Exactly 36 months later: still usable
        let v = validator(Arc::clone(&store), date(2025, 6, 2));
        let result = v
            .determine_sequence_type("MND-001", &TransactionContext::default())
            .unwrap();
        assert_eq!(result.recommended, Some(SequenceType::Rcur));

        // 37 whole months: lapsed
        let v = validator(store, date(2025, 7, 3));
        let result = v
            .determine_sequence_type("MND-001", &TransactionContext::default())
            .unwrap();
        assert_eq!(result.usage_type, UsageType::ExpiredUse);
    }

    #[test]
    fn test_record_usage_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2024, 1, 10)));
        let v = validator(Arc::clone(&store), date(2025, 6, 2));

        assert!(v
            .record_usage("MND-001", SequenceType::Frst, 2500, "SI-001", "BATCH-1")
            .unwrap());
        assert!(!v
            .record_usage("MND-001", SequenceType::Frst, 2500, "SI-001", "BATCH-1")
            .unwrap());
        assert_eq!(store.usage_history("MND-001").unwrap().len(), 1);
    }

    #[test]
    fn test_ooff_usage_consumes_mandate() {
        let store = Arc::new(MemoryStore::new());
        store.insert_mandate(Mandate::new("MND-001", date(2024, 1, 10)).one_off());
        let v = validator(Arc::clone(&store), date(2025, 6, 2));

        v.record_usage("MND-001", SequenceType::Ooff, 2500, "SI-001", "BATCH-1")
            .unwrap();
        assert_eq!(
            store.mandate("MND-001").unwrap().unwrap().status,
            MandateStatus::Used
        );
    }
}
