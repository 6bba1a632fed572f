//! Domain events
//!
//! The engine never calls notification channels directly. It publishes
//! events to an injected sink; wiring those to email, chat, or a message bus
//! is the embedding application's concern.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Events the engine publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    BatchCreated {
        batch_id: String,
        total_amount: i64,
        invoice_count: usize,
    },
    RollbackCompleted {
        operation_id: String,
        batch_id: String,
        total_amount: i64,
        invoice_count: usize,
    },
    RollbackFailed {
        operation_id: String,
        batch_id: String,
        errors: Vec<String>,
    },
    CompensationFailed {
        transaction_id: String,
        operation_id: String,
        invoice_id: String,
        error: String,
    },
}

/// Receives engine events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DomainEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &DomainEvent) {}
}

/// Logs every event at INFO via `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &DomainEvent) {
        match event {
            DomainEvent::BatchCreated {
                batch_id,
                total_amount,
                invoice_count,
            } => tracing::info!(
                %batch_id,
                total_amount_cents = total_amount,
                invoice_count,
                "batch created"
            ),
            DomainEvent::RollbackCompleted {
                operation_id,
                batch_id,
                total_amount,
                invoice_count,
            } => tracing::info!(
                %operation_id,
                %batch_id,
                total_amount_cents = total_amount,
                invoice_count,
                "rollback completed"
            ),
            DomainEvent::RollbackFailed {
                operation_id,
                batch_id,
                errors,
            } => tracing::error!(
                %operation_id,
                %batch_id,
                errors = ?errors,
                "rollback failed"
            ),
            DomainEvent::CompensationFailed {
                transaction_id,
                operation_id,
                invoice_id,
                error,
            } => tracing::error!(
                %transaction_id,
                %operation_id,
                %invoice_id,
                %error,
                "compensation failed"
            ),
        }
    }
}

/// Captures events for assertions in tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_captures_in_order() {
        let sink = RecordingSink::new();
        sink.publish(&DomainEvent::BatchCreated {
            batch_id: "B-1".into(),
            total_amount: 2500,
            invoice_count: 1,
        });
        sink.publish(&DomainEvent::RollbackFailed {
            operation_id: "RB-1".into(),
            batch_id: "B-1".into(),
            errors: vec!["x".into()],
        });

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DomainEvent::BatchCreated { .. }));
        assert!(sink.events().is_empty());
    }
}
