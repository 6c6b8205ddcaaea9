//! Retry scheduler
//!
//! Decides what happens after a soft-failed collection attempt. The
//! backoff table is indexed by the upcoming attempt number; once the
//! table runs out the invoice is exhausted, moved to `Failed` and
//! escalated exactly once. A scheduled retry releases the invoice back
//! to `Uncollected` with a hold-off, so the next selection run picks it
//! up and re-validates the mandate instead of blindly resubmitting.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use dues_core::{
    AttemptStore, CollectionConfig, CollectionEvent, EventSink, InvoiceStatus, InvoiceStore,
    PaymentAttempt,
};

use crate::error::Result;
use crate::metrics::Metrics;
use crate::notify::{Notifier, Severity};

/// What the scheduler decided for a returned attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry was placed on the schedule
    Scheduled {
        /// Earliest time the invoice re-enters selection
        next_at: DateTime<Utc>,
    },
    /// No retries left; the invoice terminally failed
    Exhausted,
    /// This attempt was already handled (replayed return file)
    AlreadyHandled,
}

/// Retry scheduler
pub struct RetryScheduler {
    invoices: Arc<InvoiceStore>,
    attempts: Arc<AttemptStore>,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
    metrics: Metrics,
    config: CollectionConfig,
}

impl RetryScheduler {
    /// Create a scheduler over the shared stores
    pub fn new(
        invoices: Arc<InvoiceStore>,
        attempts: Arc<AttemptStore>,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        config: CollectionConfig,
    ) -> Self {
        Self {
            invoices,
            attempts,
            events,
            notifier,
            metrics,
            config,
        }
    }

    /// Handle one returned attempt
    ///
    /// Idempotent per attempt id: the first call claims the attempt,
    /// later calls see `AlreadyHandled`.
    pub fn handle_return(&self, attempt: &PaymentAttempt, now: DateTime<Utc>) -> Result<RetryDecision> {
        if !self
            .attempts
            .claim_retry(attempt.attempt_id, &attempt.invoice)?
        {
            return Ok(RetryDecision::AlreadyHandled);
        }

        let next_number = attempt.number + 1;
        let Some(delay_hours) = self.config.retry.delay_before(next_number) else {
            // The backoff table is spent
            return self.exhaust(attempt);
        };
        let next_at = now + Duration::hours(delay_hours as i64);

        // Back to the selection pool with a hold-off; the next run
        // re-validates the mandate before attempting again
        self.invoices.release(&attempt.invoice, Some(next_at))?;
        self.metrics.retries_scheduled.inc();
        self.events.emit(CollectionEvent::RetryScheduled {
            invoice: attempt.invoice.clone(),
            attempt_number: next_number,
            next_at,
        });
        tracing::info!(
            "Retry {} for invoice {} scheduled at {}",
            next_number,
            attempt.invoice,
            next_at
        );
        Ok(RetryDecision::Scheduled { next_at })
    }

    fn exhaust(&self, attempt: &PaymentAttempt) -> Result<RetryDecision> {
        self.attempts
            .mark_exhausted(attempt.attempt_id, &attempt.invoice)?;
        self.invoices
            .transition(&attempt.invoice, InvoiceStatus::Failed)?;
        self.metrics.retries_exhausted.inc();
        self.events.emit(CollectionEvent::RetriesExhausted {
            invoice: attempt.invoice.clone(),
            attempts: attempt.number,
        });
        self.notifier.notify(
            Severity::Critical,
            attempt.invoice.as_str(),
            &format!(
                "Collection exhausted after {} attempts (last reason: {})",
                attempt.number,
                attempt.reason_code.as_deref().unwrap_or("unknown")
            ),
        );
        tracing::warn!(
            "Invoice {} exhausted after {} attempts",
            attempt.invoice,
            attempt.number
        );
        Ok(RetryDecision::Exhausted)
    }
}
