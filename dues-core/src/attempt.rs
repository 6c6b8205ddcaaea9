//! Payment attempt store
//!
//! Tracks every collection try per invoice. Attempt numbers are strictly
//! increasing, at most one attempt per invoice may be `Pending`, and
//! per-attempt updates are serialized through the per-key write lock so
//! concurrent return-file ingestion cannot interleave updates.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AttemptStatus, InvoiceId, MandateId, MemberId, PaymentAttempt};

/// In-memory attempt store
pub struct AttemptStore {
    /// Attempt history per invoice, oldest first
    by_invoice: DashMap<InvoiceId, Vec<PaymentAttempt>>,

    /// Bank end-to-end reference -> (invoice, attempt id)
    by_reference: DashMap<String, (InvoiceId, Uuid)>,
}

impl AttemptStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            by_invoice: DashMap::new(),
            by_reference: DashMap::new(),
        }
    }

    /// Open a new `Pending` attempt for an invoice
    ///
    /// The attempt number continues the invoice's history. Fails if a
    /// `Pending` attempt already exists (no two simultaneous attempts).
    pub fn open(
        &self,
        invoice: InvoiceId,
        mandate: MandateId,
        member: MemberId,
        end_to_end_id: String,
        scheduled_for: DateTime<Utc>,
    ) -> Result<PaymentAttempt> {
        let mut history = self.by_invoice.entry(invoice.clone()).or_default();

        if history.iter().any(|a| a.status == AttemptStatus::Pending) {
            return Err(Error::Attempt(format!(
                "Invoice {} already has a pending attempt",
                invoice
            )));
        }
        if history.iter().any(|a| a.status == AttemptStatus::Exhausted) {
            return Err(Error::Attempt(format!(
                "Invoice {} has exhausted its attempts",
                invoice
            )));
        }

        let number = history.last().map(|a| a.number + 1).unwrap_or(1);
        let attempt = PaymentAttempt {
            attempt_id: Uuid::new_v4(),
            end_to_end_id: end_to_end_id.clone(),
            invoice: invoice.clone(),
            mandate,
            member,
            number,
            status: AttemptStatus::Pending,
            scheduled_for,
            reason_code: None,
            retry_scheduled: false,
            created_at: Utc::now(),
        };

        history.push(attempt.clone());
        drop(history);
        self.by_reference
            .insert(end_to_end_id, (invoice, attempt.attempt_id));
        Ok(attempt)
    }

    /// Find the attempt submitted under a bank end-to-end reference
    pub fn find_by_reference(&self, end_to_end_id: &str) -> Option<PaymentAttempt> {
        let (invoice, attempt_id) = self
            .by_reference
            .get(end_to_end_id)
            .map(|r| r.value().clone())?;
        let history = self.by_invoice.get(&invoice)?;
        history.iter().find(|a| a.attempt_id == attempt_id).cloned()
    }

    /// Record the bank outcome for a pending attempt
    ///
    /// Serialized per invoice; recording the same terminal outcome twice
    /// is a no-op (replayed return files).
    pub fn record_outcome(
        &self,
        attempt_id: Uuid,
        invoice: &InvoiceId,
        status: AttemptStatus,
        reason_code: Option<String>,
    ) -> Result<PaymentAttempt> {
        let mut history = self
            .by_invoice
            .get_mut(invoice)
            .ok_or_else(|| Error::NotFound(format!("Attempts for invoice {}", invoice)))?;

        let attempt = history
            .iter_mut()
            .find(|a| a.attempt_id == attempt_id)
            .ok_or_else(|| Error::NotFound(format!("Attempt {}", attempt_id)))?;

        if attempt.status == status {
            return Ok(attempt.clone());
        }
        if attempt.status != AttemptStatus::Pending {
            return Err(Error::Conflict(format!(
                "Attempt {} already resolved as {}",
                attempt_id, attempt.status
            )));
        }

        attempt.status = status;
        attempt.reason_code = reason_code;
        Ok(attempt.clone())
    }

    /// Escalate a returned attempt to `Exhausted`
    pub fn mark_exhausted(&self, attempt_id: Uuid, invoice: &InvoiceId) -> Result<()> {
        let mut history = self
            .by_invoice
            .get_mut(invoice)
            .ok_or_else(|| Error::NotFound(format!("Attempts for invoice {}", invoice)))?;

        let attempt = history
            .iter_mut()
            .find(|a| a.attempt_id == attempt_id)
            .ok_or_else(|| Error::NotFound(format!("Attempt {}", attempt_id)))?;

        attempt.status = AttemptStatus::Exhausted;
        Ok(())
    }

    /// Void a pending attempt whose batch was cancelled before the
    /// file reached the bank
    ///
    /// Removes the attempt from the invoice history and drops its bank
    /// reference so a later selection opens a fresh attempt. Attempts
    /// that already carry a bank outcome cannot be voided.
    pub fn void(&self, attempt_id: Uuid, invoice: &InvoiceId) -> Result<()> {
        let mut history = self
            .by_invoice
            .get_mut(invoice)
            .ok_or_else(|| Error::NotFound(format!("Attempts for invoice {}", invoice)))?;

        let index = history
            .iter()
            .position(|a| a.attempt_id == attempt_id)
            .ok_or_else(|| Error::NotFound(format!("Attempt {}", attempt_id)))?;
        if history[index].status != AttemptStatus::Pending {
            return Err(Error::Conflict(format!(
                "Attempt {} already resolved as {}",
                attempt_id, history[index].status
            )));
        }

        let voided = history.remove(index);
        drop(history);
        self.by_reference.remove(&voided.end_to_end_id);
        Ok(())
    }

    /// Claim the right to schedule a retry off a returned attempt
    ///
    /// Returns `false` when a retry was already scheduled for this
    /// attempt (idempotency guard for replayed ingestion).
    pub fn claim_retry(&self, attempt_id: Uuid, invoice: &InvoiceId) -> Result<bool> {
        let mut history = self
            .by_invoice
            .get_mut(invoice)
            .ok_or_else(|| Error::NotFound(format!("Attempts for invoice {}", invoice)))?;

        let attempt = history
            .iter_mut()
            .find(|a| a.attempt_id == attempt_id)
            .ok_or_else(|| Error::NotFound(format!("Attempt {}", attempt_id)))?;

        if attempt.retry_scheduled {
            return Ok(false);
        }
        attempt.retry_scheduled = true;
        Ok(true)
    }

    /// Full attempt history for an invoice, oldest first
    pub fn history(&self, invoice: &InvoiceId) -> Vec<PaymentAttempt> {
        self.by_invoice
            .get(invoice)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Returned attempts for a mandate since `since` (failure history
    /// input to the risk scorer)
    pub fn returned_count_since(&self, mandate: &MandateId, since: DateTime<Utc>) -> u32 {
        self.by_invoice
            .iter()
            .flat_map(|h| h.value().clone())
            .filter(|a| {
                &a.mandate == mandate
                    && a.created_at >= since
                    && matches!(a.status, AttemptStatus::Returned | AttemptStatus::Exhausted)
            })
            .count() as u32
    }

    /// Attempts initiated for a member since `since` (frequency cap input)
    pub fn initiated_count_since(&self, member: &MemberId, since: DateTime<Utc>) -> u32 {
        self.by_invoice
            .iter()
            .flat_map(|h| h.value().clone())
            .filter(|a| &a.member == member && a.created_at >= since)
            .count() as u32
    }
}

impl Default for AttemptStore {
    fn default() -> Self {
        Self::new()
    }
}
