//! Batch orchestration
//!
//! The orchestrator composes the lock service, conflict detector, mandate
//! validator, retry engine, and rollback manager into the one protected
//! entry point for batch creation.

pub mod engine;

pub use engine::{BatchCreation, BatchOrchestrator};
