//! Eligibility selection
//!
//! Scans outstanding invoices and active mandates and claims a candidate
//! collection set. Claiming (`Uncollected -> Queued`) happens invoice by
//! invoice through the store's compare-and-set, so two concurrent
//! scheduler runs can never both select the same invoice.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use dues_core::{
    AttemptStore, AttemptStatus, CollectionConfig, Currency, Invoice, InvoiceStore, Mandate,
    MandateStore, MemberId, SequenceType,
};

use crate::error::Result;

/// One selected (invoice, mandate) pair with its sequence type snapshot
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Claimed invoice
    pub invoice: Invoice,

    /// Backing mandate at selection time
    pub mandate: Mandate,

    /// `FRST` iff the mandate was first-use-pending at selection
    pub sequence_type: SequenceType,
}

/// Result of one selection run
#[derive(Debug, Default)]
pub struct SelectionReport {
    /// Claimed candidates
    pub candidates: Vec<Candidate>,

    /// Invoices deferred by the per-member frequency cap (left
    /// `Uncollected` for the next run, not dropped)
    pub deferred: usize,

    /// Invoices skipped for lack of an active mandate
    pub no_mandate: usize,
}

/// Eligibility selector
pub struct EligibilitySelector {
    invoices: Arc<InvoiceStore>,
    mandates: Arc<MandateStore>,
    attempts: Arc<AttemptStore>,
    config: CollectionConfig,
}

impl EligibilitySelector {
    /// Create a selector over the shared stores
    pub fn new(
        invoices: Arc<InvoiceStore>,
        mandates: Arc<MandateStore>,
        attempts: Arc<AttemptStore>,
        config: CollectionConfig,
    ) -> Self {
        Self {
            invoices,
            mandates,
            attempts,
            config,
        }
    }

    /// Select and claim candidates due as of `as_of`
    ///
    /// Only `Uncollected` invoices in the base currency with an `Active`
    /// mandate qualify. A per-member rolling 30-day frequency cap defers
    /// excess candidates to the next run.
    pub fn select_candidates(&self, as_of: DateTime<Utc>) -> Result<SelectionReport> {
        let mut due = self.invoices.due_uncollected(as_of);
        // Oldest dues first, largest amounts first within a day
        due.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then(b.amount.cmp(&a.amount))
        });

        let window_start = as_of - Duration::days(30);
        let cap = self.config.member_monthly_collection_cap;
        let mut report = SelectionReport::default();

        for invoice in due {
            if invoice.currency != Currency::EUR {
                tracing::warn!(
                    "Invoice {} skipped: currency {} is not the member base currency",
                    invoice.id,
                    invoice.currency
                );
                continue;
            }

            let Some(mandate) = self.mandates.active_for_member(&invoice.member) else {
                report.no_mandate += 1;
                continue;
            };

            let already_initiated = self
                .attempts
                .initiated_count_since(&invoice.member, window_start);
            if already_initiated + self.outstanding_claims(&invoice.member) >= cap {
                report.deferred += 1;
                continue;
            }

            // The atomic claim; losing a race to a concurrent run is a skip
            if !self.invoices.claim(&invoice.id)? {
                continue;
            }

            let sequence_type = SequenceType::for_state(mandate.sequence_state);
            report.candidates.push(Candidate {
                invoice,
                mandate,
                sequence_type,
            });
        }

        tracing::info!(
            "Selected {} candidates ({} deferred by frequency cap, {} without mandate)",
            report.candidates.len(),
            report.deferred,
            report.no_mandate
        );
        Ok(report)
    }

    /// Claimed invoices that have not reached submission yet
    ///
    /// Counted against the frequency cap alongside initiated attempts;
    /// invoices in submitted batches already carry a pending attempt
    /// and are counted through the attempt store instead.
    fn outstanding_claims(&self, member: &MemberId) -> u32 {
        self.invoices
            .claimed_for(member)
            .iter()
            .filter(|invoice| {
                !self
                    .attempts
                    .history(&invoice.id)
                    .iter()
                    .any(|a| a.status == AttemptStatus::Pending)
            })
            .count() as u32
    }
}
