//! Risk scoring
//!
//! Pure classification of collection candidates. The score is a
//! deterministic function of the candidate snapshot: the same snapshot
//! always yields the same class, which the batch optimizer relies on to
//! spread risk across batches.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use dues_core::config::RiskConfig;
use dues_core::types::{RiskClass, SequenceType};

/// Point-in-time inputs to the risk function
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSnapshot {
    /// Mandate signature date
    pub mandate_signed_at: NaiveDate,

    /// Scoring date
    pub as_of: NaiveDate,

    /// Returned attempts in the trailing failure window
    pub recent_failures: u32,

    /// Amount to collect
    pub amount: Decimal,

    /// Sequence type assigned at selection
    pub sequence_type: SequenceType,
}

/// Risk scorer with injected thresholds
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    /// Create a scorer with the given thresholds
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Classify a candidate
    ///
    /// A heavy failure history is `High` outright; otherwise the class
    /// starts `Low` and escalates one level per factor: young mandate,
    /// large amount, `FRST` sequence type.
    pub fn score(&self, snapshot: &CandidateSnapshot) -> RiskClass {
        if snapshot.recent_failures >= self.config.failure_count_high {
            return RiskClass::High;
        }

        let mut class = RiskClass::Low;

        let mandate_age = (snapshot.as_of - snapshot.mandate_signed_at).num_days();
        if mandate_age < self.config.young_mandate_days {
            class = class.escalate();
        }

        if snapshot.amount > self.config.large_amount_threshold {
            class = class.escalate();
        }

        if snapshot.sequence_type == SequenceType::Frst {
            class = class.escalate();
        }

        class
    }
}
