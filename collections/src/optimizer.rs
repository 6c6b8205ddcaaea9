//! Batch optimizer
//!
//! Partitions scored candidates into batches under the configured
//! amount, entry-count and risk-concentration limits. Largest-first
//! greedy packing: candidates are sorted by risk class ascending then
//! amount descending, and each goes to the compatible open batch with
//! the lowest running total, spreading high-risk entries across
//! batches.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use dues_core::{CollectionConfig, RiskClass};

use crate::batch::{Batch, BatchEntry};
use crate::calendar::collection_date;
use crate::selector::Candidate;

/// A selection candidate with its assigned risk class and resolved
/// debtor name, ready for batching
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    /// Claimed candidate
    pub candidate: Candidate,

    /// Risk class from the scorer
    pub risk: RiskClass,

    /// Debtor name from the member directory
    pub debtor_name: String,
}

/// Outcome of one packing run
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// Batches satisfying all size and amount bounds
    pub batches: Vec<Batch>,

    /// Candidates whose single amount exceeds the per-collection
    /// maximum; surfaced for manual handling, never silently dropped
    pub rejected: Vec<ScoredCandidate>,

    /// Undersized remainder rolled over to the next run (empty when
    /// force-flush is set)
    pub deferred: Vec<ScoredCandidate>,
}

struct DraftBatch {
    entries: Vec<ScoredCandidate>,
    total: Decimal,
    high_risk: usize,
}

impl DraftBatch {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            total: Decimal::ZERO,
            high_risk: 0,
        }
    }

    fn fits(&self, scored: &ScoredCandidate, config: &CollectionConfig) -> bool {
        self.entries.len() < config.batch.max_entries
            && self.total + scored.candidate.invoice.amount <= config.batch.max_amount
            && (scored.risk != RiskClass::High
                || self.high_risk < config.batch.high_risk_ceiling)
    }

    fn push(&mut self, scored: ScoredCandidate) {
        self.total += scored.candidate.invoice.amount;
        if scored.risk == RiskClass::High {
            self.high_risk += 1;
        }
        self.entries.push(scored);
    }
}

/// Batch optimizer
pub struct BatchOptimizer {
    config: CollectionConfig,
}

impl BatchOptimizer {
    /// Create an optimizer with injected limits
    pub fn new(config: CollectionConfig) -> Self {
        Self { config }
    }

    /// Partition `candidates` into batches dated `lead_days` business
    /// days after `as_of`
    ///
    /// Every produced batch satisfies the min/max entry count and max
    /// amount bounds. A remainder too small to form a valid batch is
    /// deferred rather than emitted, unless `force_flush` is set.
    pub fn build_batches(
        &self,
        candidates: Vec<ScoredCandidate>,
        as_of: DateTime<Utc>,
        force_flush: bool,
    ) -> BatchPlan {
        let mut plan = BatchPlan::default();
        let mut pool: Vec<ScoredCandidate> = Vec::with_capacity(candidates.len());

        for scored in candidates {
            if scored.candidate.invoice.amount > self.config.batch.max_single_amount {
                tracing::warn!(
                    "Invoice {} rejected from batching: amount {} exceeds single-collection maximum {}",
                    scored.candidate.invoice.id,
                    scored.candidate.invoice.amount,
                    self.config.batch.max_single_amount
                );
                plan.rejected.push(scored);
            } else {
                pool.push(scored);
            }
        }

        // Risk ascending, then largest amounts first
        pool.sort_by(|a, b| {
            a.risk
                .cmp(&b.risk)
                .then(b.candidate.invoice.amount.cmp(&a.candidate.invoice.amount))
        });

        let mut drafts: Vec<DraftBatch> = Vec::new();
        for scored in pool {
            let target = drafts
                .iter_mut()
                .filter(|d| d.fits(&scored, &self.config))
                .min_by_key(|d| d.total);
            match target {
                Some(draft) => draft.push(scored),
                None => {
                    let mut draft = DraftBatch::new();
                    draft.push(scored);
                    drafts.push(draft);
                }
            }
        }

        let value_date = collection_date(
            as_of.date_naive(),
            self.config.batch.lead_days,
            &self.config.holidays,
        );

        let mut sequence = 1u32;
        for draft in drafts {
            if draft.entries.len() < self.config.batch.min_entries && !force_flush {
                plan.deferred.extend(draft.entries);
                continue;
            }
            let entries: Vec<BatchEntry> = draft
                .entries
                .into_iter()
                .map(|s| BatchEntry {
                    invoice: s.candidate.invoice.id.clone(),
                    mandate: s.candidate.mandate.id.clone(),
                    member: s.candidate.invoice.member.clone(),
                    debtor_name: s.debtor_name,
                    iban: s.candidate.mandate.iban.clone(),
                    bic: s.candidate.mandate.bic.clone(),
                    amount: s.candidate.invoice.amount,
                    sequence_type: s.candidate.sequence_type,
                    risk: s.risk,
                    mandate_signed_at: s.candidate.mandate.signed_at,
                    attempt_id: None,
                    end_to_end_id: None,
                    outcome: None,
                    reason_code: None,
                })
                .collect();
            plan.batches.push(Batch::new(sequence, value_date, entries));
            sequence += 1;
        }

        tracing::info!(
            "Packed {} batches for value date {} ({} rejected, {} deferred)",
            plan.batches.len(),
            value_date,
            plan.rejected.len(),
            plan.deferred.len()
        );
        plan
    }
}
