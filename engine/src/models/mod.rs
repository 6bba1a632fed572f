//! Domain models for SEPA direct-debit batch coordination
//!
//! All monetary amounts are `i64` euro cents. Floating point is never used
//! for money anywhere in the engine; the only tolerance applied is an
//! integer cent tolerance when comparing a requested collection amount to an
//! invoice's outstanding amount.

pub mod batch;
pub mod invoice;
pub mod mandate;

pub use batch::{BatchAssignment, BatchCandidate, BatchRecord, BatchStatus, BatchType};
pub use invoice::{
    InvoiceEntry, InvoiceRecord, InvoiceStatus, MemberRecord, MemberStatus, PaymentRecord,
    PaymentStatus, CURRENCY_EUR,
};
pub use mandate::{Mandate, MandateStatus, SequenceType, UsageRecord};
