//! SEPA mandate models
//!
//! A mandate authorizes collections from a member's account. The sequence
//! type reported to the bank (FRST/RCUR/FNAL/OOFF) must be consistent with
//! the mandate's usage history; getting it wrong is a guaranteed bank-side
//! rejection, so sequence derivation lives in its own validator module.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Mandate lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MandateStatus {
    Pending,
    Active,
    Suspended,
    Cancelled,
    Expired,
    /// One-off mandate that has been consumed
    Used,
    /// Recurring mandate closed by a final (FNAL) collection
    Completed,
}

impl MandateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MandateStatus::Pending => "Pending",
            MandateStatus::Active => "Active",
            MandateStatus::Suspended => "Suspended",
            MandateStatus::Cancelled => "Cancelled",
            MandateStatus::Expired => "Expired",
            MandateStatus::Used => "Used",
            MandateStatus::Completed => "Completed",
        }
    }
}

/// SEPA sequence type reported in the payment instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceType {
    /// One-off collection
    Ooff,
    /// First collection under a recurring mandate
    Frst,
    /// Recurring collection
    Rcur,
    /// Final collection, closes the mandate
    Fnal,
}

impl SequenceType {
    /// Wire code as it appears in pain.008
    pub fn code(&self) -> &'static str {
        match self {
            SequenceType::Ooff => "OOFF",
            SequenceType::Frst => "FRST",
            SequenceType::Rcur => "RCUR",
            SequenceType::Fnal => "FNAL",
        }
    }
}

/// Stored mandate row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mandate {
    pub mandate_id: String,
    pub member: Option<String>,
    pub status: MandateStatus,
    pub sign_date: NaiveDate,
    /// Explicit expiry, in addition to the implicit 36-month validity window
    pub expiry_date: Option<NaiveDate>,
    pub iban: Option<String>,
    /// One-off mandates permit exactly one collection
    pub one_off: bool,
    /// Successful collections recorded against this mandate
    pub usage_count: u32,
}

impl Mandate {
    pub fn new(mandate_id: impl Into<String>, sign_date: NaiveDate) -> Self {
        Self {
            mandate_id: mandate_id.into(),
            member: None,
            status: MandateStatus::Active,
            sign_date,
            expiry_date: None,
            iban: None,
            one_off: false,
            usage_count: 0,
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_status(mut self, status: MandateStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_expiry(mut self, expiry: NaiveDate) -> Self {
        self.expiry_date = Some(expiry);
        self
    }

    pub fn with_iban(mut self, iban: impl Into<String>) -> Self {
        self.iban = Some(iban.into());
        self
    }

    pub fn one_off(mut self) -> Self {
        self.one_off = true;
        self
    }
}

/// One collection recorded against a mandate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub usage_date: NaiveDate,
    pub sequence_type: SequenceType,
    /// Collected amount in euro cents
    pub amount: i64,
    pub invoice_reference: String,
    /// Batch or payment identifier the usage belongs to
    pub transaction_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wire_codes() {
        assert_eq!(SequenceType::Ooff.code(), "OOFF");
        assert_eq!(SequenceType::Frst.code(), "FRST");
        assert_eq!(SequenceType::Rcur.code(), "RCUR");
        assert_eq!(SequenceType::Fnal.code(), "FNAL");
    }

    #[test]
    fn test_mandate_builder() {
        let mandate = Mandate::new("MND-001", NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .with_member("MEM-001")
            .one_off();

        assert_eq!(mandate.status, MandateStatus::Active);
        assert!(mandate.one_off);
        assert_eq!(mandate.usage_count, 0);
    }
}
