//! Domain events
//!
//! The return processor and batch lifecycle manager emit these instead of
//! running buried lifecycle hooks; external collaborators subscribe
//! through an [`EventSink`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::types::{InvoiceId, MandateId};

/// Events emitted by the collection core
#[derive(Debug, Clone, Serialize)]
pub enum CollectionEvent {
    /// A batch fully settled
    BatchSettled {
        /// Batch id
        batch_id: Uuid,
        /// Total collected
        total: Decimal,
    },

    /// A batch resolved with at least one failed entry
    BatchPartiallyFailed {
        /// Batch id
        batch_id: Uuid,
        /// Entries collected
        collected: usize,
        /// Entries failed or returned
        failed: usize,
    },

    /// An invoice was confirmed collected
    InvoiceCollected {
        /// Invoice id
        invoice: InvoiceId,
        /// Amount collected
        amount: Decimal,
    },

    /// An invoice terminally failed collection
    InvoiceFailed {
        /// Invoice id
        invoice: InvoiceId,
        /// Bank reason code, if any
        reason_code: Option<String>,
    },

    /// A retry was scheduled for a returned collection
    RetryScheduled {
        /// Invoice id
        invoice: InvoiceId,
        /// Attempt number being scheduled
        attempt_number: u32,
        /// Earliest time of the next attempt
        next_at: DateTime<Utc>,
    },

    /// All collection attempts exhausted
    RetriesExhausted {
        /// Invoice id
        invoice: InvoiceId,
        /// Final attempt number
        attempts: u32,
    },

    /// A mandate will expire soon through inactivity
    MandateExpiring {
        /// Mandate id
        mandate: MandateId,
        /// Projected expiry date
        expires_at: DateTime<Utc>,
    },

    /// A mandate expired through inactivity
    MandateExpired {
        /// Mandate id
        mandate: MandateId,
    },

    /// A return record could not be matched to any payment attempt
    ReconciliationAnomaly {
        /// Original end-to-end reference from the return file
        reference: String,
        /// What went wrong
        details: String,
    },
}

/// Consumer-facing seam for domain events
pub trait EventSink: Send + Sync {
    /// Handle one event; implementations must not block for long
    fn emit(&self, event: CollectionEvent);
}

/// Default sink that logs events through `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CollectionEvent) {
        match &event {
            CollectionEvent::ReconciliationAnomaly { reference, details } => {
                tracing::warn!("Reconciliation anomaly for {}: {}", reference, details);
            }
            CollectionEvent::RetriesExhausted { invoice, attempts } => {
                tracing::warn!("Retries exhausted for {} after {} attempts", invoice, attempts);
            }
            other => {
                tracing::info!("Collection event: {:?}", other);
            }
        }
    }
}

/// Sink that records every event, for tests and audit capture
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<CollectionEvent>>,
}

impl RecordingSink {
    /// Snapshot of captured events
    pub fn events(&self) -> Vec<CollectionEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CollectionEvent) {
        self.events.lock().push(event);
    }
}
