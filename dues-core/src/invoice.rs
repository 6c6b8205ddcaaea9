//! Invoice store
//!
//! Owns invoice collection status. The claim operation (`Uncollected ->
//! Queued`) is the atomic step that prevents an invoice from landing in
//! two open batches when scheduler runs race each other.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::types::{Currency, Invoice, InvoiceId, InvoiceStatus, MemberId};

/// In-memory invoice store with compare-and-set status transitions
pub struct InvoiceStore {
    invoices: DashMap<InvoiceId, Invoice>,
}

impl InvoiceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            invoices: DashMap::new(),
        }
    }

    /// Register a new invoice as `Uncollected`
    pub fn insert(
        &self,
        id: InvoiceId,
        member: MemberId,
        amount: Decimal,
        currency: Currency,
        due_date: NaiveDate,
    ) -> Result<Invoice> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "Invoice {} amount must be positive",
                id
            )));
        }
        if self.invoices.contains_key(&id) {
            return Err(Error::Conflict(format!("Invoice {} already exists", id)));
        }

        let invoice = Invoice {
            id: id.clone(),
            member,
            amount,
            currency,
            due_date,
            status: InvoiceStatus::Uncollected,
            eligible_after: None,
            version: 0,
        };
        self.invoices.insert(id, invoice.clone());
        Ok(invoice)
    }

    /// Look up an invoice
    pub fn get(&self, id: &InvoiceId) -> Result<Invoice> {
        self.invoices
            .get(id)
            .map(|i| i.clone())
            .ok_or_else(|| Error::NotFound(format!("Invoice {}", id)))
    }

    /// Atomically claim an invoice for selection (`Uncollected -> Queued`)
    ///
    /// Returns `false` when another run already claimed it; losing the
    /// race is a skip, not an error.
    pub fn claim(&self, id: &InvoiceId) -> Result<bool> {
        let mut entry = self
            .invoices
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Invoice {}", id)))?;

        if entry.status != InvoiceStatus::Uncollected {
            return Ok(false);
        }
        entry.status = InvoiceStatus::Queued;
        entry.version += 1;
        Ok(true)
    }

    /// Transition an invoice, enforcing the state machine
    pub fn transition(&self, id: &InvoiceId, next: InvoiceStatus) -> Result<()> {
        let mut entry = self
            .invoices
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Invoice {}", id)))?;

        if !entry.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: format!("invoice {}", id),
                from: entry.status.to_string(),
                to: next.to_string(),
            });
        }
        entry.status = next;
        entry.version += 1;
        Ok(())
    }

    /// Release a claimed or batched invoice back to `Uncollected`,
    /// optionally deferring re-selection until `eligible_after`
    pub fn release(&self, id: &InvoiceId, eligible_after: Option<DateTime<Utc>>) -> Result<()> {
        let mut entry = self
            .invoices
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Invoice {}", id)))?;

        if !entry.status.can_transition_to(InvoiceStatus::Uncollected) {
            return Err(Error::InvalidTransition {
                entity: format!("invoice {}", id),
                from: entry.status.to_string(),
                to: InvoiceStatus::Uncollected.to_string(),
            });
        }
        entry.status = InvoiceStatus::Uncollected;
        entry.eligible_after = eligible_after;
        entry.version += 1;
        Ok(())
    }

    /// Invoices due for collection: `Uncollected`, due on or before
    /// `as_of`, and past any retry hold-off
    pub fn due_uncollected(&self, as_of: DateTime<Utc>) -> Vec<Invoice> {
        let today = as_of.date_naive();
        self.invoices
            .iter()
            .filter(|i| {
                i.status == InvoiceStatus::Uncollected
                    && i.due_date <= today
                    && i.eligible_after.map(|t| t <= as_of).unwrap_or(true)
            })
            .map(|i| i.clone())
            .collect()
    }

    /// Invoices currently claimed into the pipeline (`Queued` or
    /// `InBatch`) for a member
    pub fn claimed_for(&self, member: &MemberId) -> Vec<Invoice> {
        self.invoices
            .iter()
            .filter(|i| {
                &i.member == member
                    && matches!(i.status, InvoiceStatus::Queued | InvoiceStatus::InBatch)
            })
            .map(|i| i.clone())
            .collect()
    }

    /// Number of invoices held (all statuses)
    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }
}

impl Default for InvoiceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(id: &str, amount: i64) -> (InvoiceStore, InvoiceId) {
        let store = InvoiceStore::new();
        let id = InvoiceId::new(id);
        store
            .insert(
                id.clone(),
                MemberId::new("MEM-1"),
                Decimal::new(amount, 0),
                Currency::EUR,
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            )
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (store, id) = store_with("INV-1", 25);

        assert!(store.claim(&id).unwrap());
        // Second claim loses the race
        assert!(!store.claim(&id).unwrap());
    }

    #[test]
    fn test_collected_never_requeues() {
        let (store, id) = store_with("INV-2", 25);
        store.claim(&id).unwrap();
        store.transition(&id, InvoiceStatus::InBatch).unwrap();
        store.transition(&id, InvoiceStatus::Collected).unwrap();

        assert!(!store.claim(&id).unwrap());
        assert!(store.transition(&id, InvoiceStatus::Queued).is_err());
        assert!(store.release(&id, None).is_err());
    }

    #[test]
    fn test_release_returns_to_pool() {
        let (store, id) = store_with("INV-3", 25);
        store.claim(&id).unwrap();
        store.release(&id, None).unwrap();

        let due = store.due_uncollected(Utc::now());
        assert_eq!(due.len(), 1);
        assert!(store.claim(&id).unwrap());
    }

    #[test]
    fn test_retry_holdoff_defers_selection() {
        let (store, id) = store_with("INV-4", 25);
        store.claim(&id).unwrap();

        let in_two_hours = Utc::now() + chrono::Duration::hours(2);
        store.release(&id, Some(in_two_hours)).unwrap();

        // Not yet eligible
        assert!(store.due_uncollected(Utc::now()).is_empty());
        // Eligible once the hold-off passes
        assert_eq!(
            store
                .due_uncollected(Utc::now() + chrono::Duration::hours(3))
                .len(),
            1
        );
    }

    #[test]
    fn test_rejects_nonpositive_amounts() {
        let store = InvoiceStore::new();
        let err = store.insert(
            InvoiceId::new("INV-5"),
            MemberId::new("MEM-1"),
            Decimal::ZERO,
            Currency::EUR,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        );
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}
