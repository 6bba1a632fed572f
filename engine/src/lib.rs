//! SEPA batch coordination and recovery engine
//!
//! Coordinates concurrent SEPA direct-debit batch creation over shared
//! invoice, mandate, and member state, and recovers cleanly when a batch
//! fails after the fact. Five subsystems compose into one protected entry
//! point:
//!
//! - [`lock`] - lease-based resource locking with capped-backoff acquisition
//! - [`conflict`] - read-only pre-flight conflict detection
//! - [`sequence`] - SEPA mandate sequence derivation and usage recording
//! - [`retry`] - classified retries with per-operation circuit breakers
//! - [`rollback`] - batch unwinding with compensations and an audit trail
//!
//! [`orchestrator::BatchOrchestrator`] wires them together; storage is
//! injected through the [`store`] traits and time through [`core::Clock`],
//! so the whole engine is deterministic under test.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use chrono::NaiveDate;
//! use sepa_batch_engine::models::{BatchCandidate, BatchType, InvoiceEntry};
//! use sepa_batch_engine::orchestrator::BatchOrchestrator;
//! use sepa_batch_engine::store::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = BatchOrchestrator::with_defaults(Arc::clone(&store));
//!
//! let candidate = BatchCandidate::new(
//!     NaiveDate::from_ymd_opt(2030, 6, 3),
//!     BatchType::Core,
//! )
//! .with_entry(InvoiceEntry::new(
//!     "SI-001",
//!     2500,
//!     "NL91ABNA0417164300",
//!     "Jan Visser",
//!     "MND-001",
//! ));
//!
//! // The invoice and mandate are not seeded, so detection reports conflicts
//! let report = engine.detect_conflicts(&candidate);
//! assert!(!report.can_proceed);
//! ```

pub mod config;
pub mod conflict;
pub mod core;
pub mod error;
pub mod events;
pub mod lock;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod rng;
pub mod rollback;
pub mod sequence;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, FailureClass, FailureKind};
pub use orchestrator::{BatchCreation, BatchOrchestrator};
