//! Configuration for the collection engine
//!
//! Modeled as an explicitly injected struct passed to each component at
//! construction. Nothing reads ambient global state, so tests can run
//! with arbitrary limits side by side.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for dues collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Creditor identity carried into the bank file
    pub creditor: CreditorConfig,

    /// Batch sizing and scheduling limits
    pub batch: BatchConfig,

    /// Risk scoring thresholds
    pub risk: RiskConfig,

    /// Mandate lifecycle windows
    pub mandate: MandateConfig,

    /// Retry backoff table
    pub retry: RetryConfig,

    /// Bank submission transport limits
    pub submission: SubmissionConfig,

    /// Per-member collection frequency cap in a rolling 30-day window
    pub member_monthly_collection_cap: u32,

    /// Non-business days beyond weekends
    pub holidays: Vec<NaiveDate>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            creditor: CreditorConfig::default(),
            batch: BatchConfig::default(),
            risk: RiskConfig::default(),
            mandate: MandateConfig::default(),
            retry: RetryConfig::default(),
            submission: SubmissionConfig::default(),
            member_monthly_collection_cap: 2,
            holidays: Vec::new(),
        }
    }
}

/// Creditor identity for pain.008 output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditorConfig {
    /// Creditor display name
    pub name: String,

    /// SEPA creditor identifier (`CdtrSchmeId`)
    pub creditor_id: String,

    /// Creditor collection account
    pub iban: String,

    /// Creditor agent
    pub bic: String,
}

impl Default for CreditorConfig {
    fn default() -> Self {
        Self {
            name: "Vereniging Incasso".to_string(),
            creditor_id: "NL98ZZZ999999990000".to_string(),
            iban: "NL91ABNA0417164300".to_string(),
            bic: "ABNANL2A".to_string(),
        }
    }
}

/// Batch sizing and scheduling limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum total amount per batch
    pub max_amount: Decimal,

    /// Maximum entries per batch
    pub max_entries: usize,

    /// Minimum entries per batch (smaller remainders roll over)
    pub min_entries: usize,

    /// Maximum amount for a single collection; larger invoices are
    /// rejected for manual handling
    pub max_single_amount: Decimal,

    /// Minimum business days between batch creation and value date
    pub lead_days: u32,

    /// Maximum number of `High`-risk entries per batch
    pub high_risk_ceiling: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            // Stay below the high-risk review threshold banks apply
            max_amount: Decimal::new(4_000, 0),
            max_entries: 20,
            min_entries: 3,
            max_single_amount: Decimal::new(1_000, 0),
            lead_days: 2,
            high_risk_ceiling: 2,
        }
    }
}

/// Risk scoring thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Mandates younger than this are one risk level higher
    pub young_mandate_days: i64,

    /// Amounts above this are one risk level higher
    pub large_amount_threshold: Decimal,

    /// Returned attempts within this window count toward failure history
    pub failure_window_months: u32,

    /// This many recent returns classify the candidate `High` outright
    pub failure_count_high: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            young_mandate_days: 90,
            large_amount_threshold: Decimal::new(100, 0),
            failure_window_months: 6,
            failure_count_high: 3,
        }
    }
}

/// Mandate lifecycle windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MandateConfig {
    /// Months of non-use after which a mandate expires (SEPA rulebook: 36)
    pub inactivity_expiry_months: u32,

    /// Months before expiry at which a pre-expiry notification is emitted
    pub pre_expiry_notice_months: u32,
}

impl Default for MandateConfig {
    fn default() -> Self {
        Self {
            inactivity_expiry_months: 36,
            pre_expiry_notice_months: 3,
        }
    }
}

/// Retry backoff table
///
/// `backoff_hours[n - 2]` is the delay before attempt `n`, counted from
/// the return of attempt `n - 1`. The table length bounds the total
/// number of attempts at `backoff_hours.len() + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delays in hours before attempts 2..=max
    pub backoff_hours: Vec<u64>,
}

impl RetryConfig {
    /// Maximum attempt number (first attempt included)
    pub fn max_attempts(&self) -> u32 {
        self.backoff_hours.len() as u32 + 1
    }

    /// Delay in hours before the given attempt number, `None` once the
    /// table is exhausted
    pub fn delay_before(&self, attempt_number: u32) -> Option<u64> {
        if attempt_number < 2 {
            return None;
        }
        self.backoff_hours.get(attempt_number as usize - 2).copied()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            // Attempt 2 at +2h, 3 at +24h, 4 at +72h; 4 attempts total
            backoff_hours: vec![2, 24, 72],
        }
    }
}

/// Bank submission transport limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Per-call submission timeout in seconds
    pub timeout_secs: u64,

    /// Bounded submission retry count (transport retries, not the
    /// banking-cycle retries of the retry scheduler)
    pub max_transport_retries: u32,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_transport_retries: 2,
        }
    }
}

impl CollectionConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CollectionConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check limits against each other
    pub fn validate(&self) -> Result<()> {
        if self.batch.min_entries == 0 || self.batch.min_entries > self.batch.max_entries {
            return Err(Error::Config(format!(
                "min_entries {} must be in 1..={}",
                self.batch.min_entries, self.batch.max_entries
            )));
        }
        if self.batch.max_amount <= Decimal::ZERO {
            return Err(Error::Config("max_amount must be positive".to_string()));
        }
        if self.batch.max_single_amount > self.batch.max_amount {
            return Err(Error::Config(
                "max_single_amount cannot exceed max_amount".to_string(),
            ));
        }
        if self.retry.backoff_hours.is_empty() {
            return Err(Error::Config("retry backoff table cannot be empty".to_string()));
        }
        if self.mandate.pre_expiry_notice_months >= self.mandate.inactivity_expiry_months {
            return Err(Error::Config(
                "pre-expiry notice must fall before expiry".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CollectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts(), 4);
    }

    #[test]
    fn test_backoff_table_indexing() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_before(2), Some(2));
        assert_eq!(retry.delay_before(3), Some(24));
        assert_eq!(retry.delay_before(4), Some(72));
        // No attempt 5
        assert_eq!(retry.delay_before(5), None);
        assert_eq!(retry.delay_before(1), None);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = CollectionConfig::default();
        config.batch.min_entries = 50;
        assert!(config.validate().is_err());

        let mut config = CollectionConfig::default();
        config.batch.max_single_amount = Decimal::new(10_000, 0);
        assert!(config.validate().is_err());

        let mut config = CollectionConfig::default();
        config.retry.backoff_hours.clear();
        assert!(config.validate().is_err());
    }
}
