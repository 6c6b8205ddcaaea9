//! Collection batch aggregate
//!
//! A batch groups claimed invoices into one direct-debit submission. It
//! moves through a fixed state machine: created batches wait for
//! approval, approved batches are submitted to the bank, and submitted
//! batches settle (or partially fail) once every entry has an outcome.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dues_core::{Bic, Iban, InvoiceId, MandateId, MemberId, RiskClass, SequenceType};

/// Batch lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Freshly built by the optimizer
    Generated,
    /// Registered, waiting for operator approval
    PendingApproval,
    /// Approved, ready to submit
    Approved,
    /// Sent to the bank, awaiting entry outcomes
    Submitted,
    /// Every entry collected
    Settled,
    /// At least one entry returned or pulled
    PartiallyFailed,
    /// Rejected or cancelled before submission
    Rejected,
}

impl BatchStatus {
    /// Whether the batch can move from this state to `next`
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Generated, PendingApproval)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Submitted)
                | (Approved, Rejected)
                | (Submitted, Settled)
                | (Submitted, PartiallyFailed)
        )
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Settled | BatchStatus::PartiallyFailed | BatchStatus::Rejected
        )
    }
}

/// Outcome of a single batch entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOutcome {
    /// Funds collected
    Collected,
    /// Returned by the debtor bank with a reason code
    Returned,
    /// Pulled before submission (mandate no longer active)
    Failed,
}

/// One debit instruction inside a batch
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Invoice being collected
    pub invoice: InvoiceId,

    /// Mandate authorizing the debit
    pub mandate: MandateId,

    /// Member being debited
    pub member: MemberId,

    /// Debtor name as it appears on the mandate
    pub debtor_name: String,

    /// Debtor account
    pub iban: Iban,

    /// Debtor agent
    pub bic: Bic,

    /// Instructed amount in the base currency
    pub amount: Decimal,

    /// FRST/RCUR snapshot, re-checked at submission
    pub sequence_type: SequenceType,

    /// Risk class assigned at selection
    pub risk: RiskClass,

    /// Mandate signature date carried into `DtOfSgntr`
    pub mandate_signed_at: NaiveDate,

    /// Attempt opened at submission time
    pub attempt_id: Option<Uuid>,

    /// End-to-end reference, assigned with the attempt
    pub end_to_end_id: Option<String>,

    /// Final outcome, set during reconciliation
    pub outcome: Option<EntryOutcome>,

    /// ISO return reason code when the entry was returned
    pub reason_code: Option<String>,
}

/// A direct-debit collection batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Batch identifier
    pub id: Uuid,

    /// Human-readable message reference, also used as the pain.008
    /// message id
    pub reference: String,

    /// Requested collection date (business day)
    pub collection_date: NaiveDate,

    /// Current lifecycle state
    pub status: BatchStatus,

    /// Debit instructions
    pub entries: Vec<BatchEntry>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Set when the bank accepted the file
    pub submitted_at: Option<DateTime<Utc>>,

    /// Set when the batch reached a terminal reconciled state
    pub settled_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Create a batch in `Generated` with a dated reference
    pub fn new(sequence: u32, collection_date: NaiveDate, entries: Vec<BatchEntry>) -> Self {
        let id = Uuid::new_v4();
        let reference = format!(
            "COL-{}-{:03}",
            collection_date.format("%Y%m%d"),
            sequence
        );
        Self {
            id,
            reference,
            collection_date,
            status: BatchStatus::Generated,
            entries,
            created_at: Utc::now(),
            submitted_at: None,
            settled_at: None,
        }
    }

    /// Sum of instructed amounts
    pub fn total_amount(&self) -> Decimal {
        self.entries.iter().map(|e| e.amount).sum()
    }

    /// Number of debit instructions
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of high-risk entries
    pub fn high_risk_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.risk == RiskClass::High)
            .count()
    }

    /// Whether every entry has a recorded outcome
    pub fn fully_reconciled(&self) -> bool {
        self.entries.iter().all(|e| e.outcome.is_some())
    }

    /// Terminal status once all outcomes are in: `Settled` only when
    /// every entry collected
    pub fn derived_terminal_status(&self) -> BatchStatus {
        if self
            .entries
            .iter()
            .all(|e| e.outcome == Some(EntryOutcome::Collected))
        {
            BatchStatus::Settled
        } else {
            BatchStatus::PartiallyFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dues_core::{Bic, Iban};

    fn entry(invoice: &str, amount: i64, risk: RiskClass) -> BatchEntry {
        BatchEntry {
            invoice: InvoiceId::new(invoice),
            mandate: MandateId::parse("M-001").unwrap(),
            member: MemberId::new("MEM-1"),
            debtor_name: "J. Jansen".to_string(),
            iban: Iban::parse("NL91ABNA0417164300").unwrap(),
            bic: Bic::parse("ABNANL2A").unwrap(),
            amount: Decimal::new(amount, 0),
            sequence_type: SequenceType::Rcur,
            risk,
            mandate_signed_at: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            attempt_id: None,
            end_to_end_id: None,
            outcome: None,
            reason_code: None,
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        use BatchStatus::*;
        assert!(Generated.can_transition_to(PendingApproval));
        assert!(PendingApproval.can_transition_to(Approved));
        assert!(PendingApproval.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Settled));
        assert!(Submitted.can_transition_to(PartiallyFailed));

        assert!(!Submitted.can_transition_to(Rejected));
        assert!(!Settled.can_transition_to(Submitted));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(Settled.is_terminal());
    }

    #[test]
    fn test_totals_and_risk_summary() {
        let batch = Batch::new(
            1,
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
            vec![
                entry("INV-1", 25, RiskClass::Low),
                entry("INV-2", 40, RiskClass::High),
                entry("INV-3", 35, RiskClass::Medium),
            ],
        );
        assert_eq!(batch.total_amount(), Decimal::new(100, 0));
        assert_eq!(batch.entry_count(), 3);
        assert_eq!(batch.high_risk_count(), 1);
        assert_eq!(batch.status, BatchStatus::Generated);
        assert!(batch.reference.starts_with("COL-20250107-"));
    }

    #[test]
    fn test_terminal_status_derivation() {
        let mut batch = Batch::new(
            1,
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
            vec![entry("INV-1", 25, RiskClass::Low), entry("INV-2", 40, RiskClass::Low)],
        );
        batch.entries[0].outcome = Some(EntryOutcome::Collected);
        assert!(!batch.fully_reconciled());

        batch.entries[1].outcome = Some(EntryOutcome::Collected);
        assert!(batch.fully_reconciled());
        assert_eq!(batch.derived_terminal_status(), BatchStatus::Settled);

        batch.entries[1].outcome = Some(EntryOutcome::Returned);
        assert_eq!(batch.derived_terminal_status(), BatchStatus::PartiallyFailed);
    }
}
