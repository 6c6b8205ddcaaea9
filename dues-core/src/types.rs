//! Core types for dues collection
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Serde round-tripping (reports, persistence)
//! - Cheap cloning of id newtypes

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Member identifier (non-owning reference into the member directory)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create new member ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invoice identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(String);

impl InvoiceId {
    /// Create new invoice ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mandate identifier
///
/// Validated against the ISO 20022 restricted identification charset
/// (max 35 characters) so it can be carried verbatim in `MndtId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MandateId(String);

impl MandateId {
    /// Parse and validate a mandate ID
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 35 {
            return Err(Error::Validation(format!(
                "Mandate id must be 1-35 characters, got {}",
                id.len()
            )));
        }
        let ok = id.chars().all(|c| {
            c.is_ascii_alphanumeric() || "+?/-:().,' ".contains(c)
        });
        if !ok {
            return Err(Error::Validation(format!(
                "Mandate id '{}' contains characters outside the ISO 20022 restricted set",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MandateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// International Bank Account Number, checksum-validated
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Iban(String);

impl Iban {
    /// Parse and validate an IBAN (length, charset, mod-97 checksum)
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() < 15 || normalized.len() > 34 {
            return Err(Error::Validation(format!(
                "IBAN length {} outside 15-34",
                normalized.len()
            )));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Validation("IBAN contains invalid characters".to_string()));
        }
        if !normalized[..2].chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::Validation("IBAN must start with a country code".to_string()));
        }

        if Self::mod97(&normalized) != 1 {
            return Err(Error::Validation(format!("IBAN '{}' fails checksum", normalized)));
        }

        Ok(Self(normalized))
    }

    /// ISO 7064 mod-97 over the rearranged IBAN
    fn mod97(iban: &str) -> u32 {
        let rearranged = format!("{}{}", &iban[4..], &iban[..4]);
        let mut rem: u32 = 0;
        for c in rearranged.chars() {
            let value = c.to_digit(36).unwrap_or(0);
            if value >= 10 {
                rem = (rem * 100 + value) % 97;
            } else {
                rem = (rem * 10 + value) % 97;
            }
        }
        rem
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Country code (first two characters)
    pub fn country_code(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Iban {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bank Identifier Code (BIC/SWIFT)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bic(String);

impl Bic {
    /// Parse and validate a BIC (8 or 11 alphanumeric characters)
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw.trim().to_ascii_uppercase();
        if normalized.len() != 8 && normalized.len() != 11 {
            return Err(Error::Validation(format!(
                "BIC must be 8 or 11 characters, got {}",
                normalized.len()
            )));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Validation("BIC contains invalid characters".to_string()));
        }
        Ok(Self(normalized))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// Euro (member base currency)
    EUR,
    /// US Dollar
    USD,
    /// British Pound
    GBP,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::EUR => "EUR",
            Currency::USD => "USD",
            Currency::GBP => "GBP",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Whether the next collection under a mandate is the first ever or recurring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceState {
    /// No successful collection yet; next entry uses `FRST`
    FirstUsePending,
    /// At least one successful collection; entries use `RCUR`
    Recurring,
}

/// ISO 20022 sequence type carried per batch entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceType {
    /// First collection under a mandate
    Frst,
    /// Recurring collection
    Rcur,
}

impl SequenceType {
    /// Wire code for `SeqTp`
    pub fn code(&self) -> &'static str {
        match self {
            SequenceType::Frst => "FRST",
            SequenceType::Rcur => "RCUR",
        }
    }

    /// Sequence type implied by a mandate's sequence state
    pub fn for_state(state: SequenceState) -> Self {
        match state {
            SequenceState::FirstUsePending => SequenceType::Frst,
            SequenceState::Recurring => SequenceType::Rcur,
        }
    }
}

impl fmt::Display for SequenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Coarse likelihood-of-failure classification, used to spread risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskClass {
    /// Established mandate, unremarkable amount
    Low,
    /// Elevated on one factor
    Medium,
    /// Elevated on several factors or recent failure history
    High,
}

impl RiskClass {
    /// One level up, saturating at `High`
    pub fn escalate(self) -> Self {
        match self {
            RiskClass::Low => RiskClass::Medium,
            RiskClass::Medium | RiskClass::High => RiskClass::High,
        }
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskClass::Low => write!(f, "Low"),
            RiskClass::Medium => write!(f, "Medium"),
            RiskClass::High => write!(f, "High"),
        }
    }
}

/// Mandate lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MandateStatus {
    /// Captured but not yet usable
    Draft,
    /// Usable for collection
    Active,
    /// Temporarily blocked (e.g. account frozen by bank)
    Suspended,
    /// Revoked; never usable again
    Cancelled,
    /// Lapsed through inactivity; never usable again
    Expired,
}

impl MandateStatus {
    /// Terminal statuses can never transition away
    pub fn is_terminal(&self) -> bool {
        matches!(self, MandateStatus::Cancelled | MandateStatus::Expired)
    }

    /// Allowed status transitions
    pub fn can_transition_to(&self, next: MandateStatus) -> bool {
        use MandateStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Cancelled)
                | (Active, Suspended)
                | (Active, Cancelled)
                | (Active, Expired)
                | (Suspended, Active)
                | (Suspended, Cancelled)
                | (Suspended, Expired)
        )
    }
}

impl fmt::Display for MandateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MandateStatus::Draft => "Draft",
            MandateStatus::Active => "Active",
            MandateStatus::Suspended => "Suspended",
            MandateStatus::Cancelled => "Cancelled",
            MandateStatus::Expired => "Expired",
        };
        write!(f, "{}", s)
    }
}

/// Standing authorization to collect from one bank account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mandate {
    /// Mandate id (unique, pattern-validated)
    pub id: MandateId,

    /// Owning member (non-owning reference)
    pub member: MemberId,

    /// Debtor account
    pub iban: Iban,

    /// Debtor agent
    pub bic: Bic,

    /// First-use/recurring state
    pub sequence_state: SequenceState,

    /// Lifecycle status
    pub status: MandateStatus,

    /// Signature date carried into `DtOfSgntr`
    pub signed_at: NaiveDate,

    /// Last successful or attempted use
    pub last_used_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Version counter for compare-and-set
    pub version: u64,

    /// Attempt ids already applied via `mark_used` (idempotency guard)
    pub applied_attempts: HashSet<Uuid>,
}

impl Mandate {
    /// Whether this mandate may back a new collection
    pub fn is_collectable(&self) -> bool {
        self.status == MandateStatus::Active
    }

    /// Age in days as of the given date
    pub fn age_days(&self, as_of: NaiveDate) -> i64 {
        (as_of - self.signed_at).num_days()
    }
}

/// Invoice collection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    /// Due but not yet picked up
    Uncollected,
    /// Claimed by a selection run
    Queued,
    /// Placed in an open batch
    InBatch,
    /// Paid; terminal for collection purposes
    Collected,
    /// All collection attempts exhausted or hard-failed; terminal
    Failed,
    /// Manually written off; terminal
    WrittenOff,
}

impl InvoiceStatus {
    /// Allowed status transitions
    ///
    /// `Collected` has no outgoing edges: a collected invoice can never
    /// re-enter the queue.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Uncollected, Queued)
                | (Uncollected, WrittenOff)
                | (Queued, InBatch)
                | (Queued, Uncollected)
                | (InBatch, Collected)
                | (InBatch, Failed)
                | (InBatch, Uncollected)
                | (Uncollected, Failed)
                | (Failed, WrittenOff)
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceStatus::Uncollected => "Uncollected",
            InvoiceStatus::Queued => "Queued",
            InvoiceStatus::InBatch => "InBatch",
            InvoiceStatus::Collected => "Collected",
            InvoiceStatus::Failed => "Failed",
            InvoiceStatus::WrittenOff => "WrittenOff",
        };
        write!(f, "{}", s)
    }
}

/// An amount owed by a member with a due date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice id
    pub id: InvoiceId,

    /// Owning member (non-owning reference)
    pub member: MemberId,

    /// Amount due
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Due date
    pub due_date: NaiveDate,

    /// Collection status
    pub status: InvoiceStatus,

    /// Earliest time a retry may pick this invoice up again
    pub eligible_after: Option<DateTime<Utc>>,

    /// Version counter for compare-and-set
    pub version: u64,
}

/// Payment attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// Submitted to the bank, outcome unknown
    Pending,
    /// Confirmed collected
    Collected,
    /// Returned by the bank (reason code recorded)
    Returned,
    /// Final attempt failed; no further attempts
    Exhausted,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptStatus::Pending => "Pending",
            AttemptStatus::Collected => "Collected",
            AttemptStatus::Returned => "Returned",
            AttemptStatus::Exhausted => "Exhausted",
        };
        write!(f, "{}", s)
    }
}

/// One collection try for a given batch entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    /// Attempt id
    pub attempt_id: Uuid,

    /// Bank-facing end-to-end reference this attempt was submitted under
    pub end_to_end_id: String,

    /// Invoice being collected
    pub invoice: InvoiceId,

    /// Mandate used
    pub mandate: MandateId,

    /// Member (for frequency-cap queries)
    pub member: MemberId,

    /// Attempt number, strictly increasing per invoice (1..=max)
    pub number: u32,

    /// Attempt status
    pub status: AttemptStatus,

    /// When the collection was scheduled for
    pub scheduled_for: DateTime<Utc>,

    /// Bank return reason code, if returned
    pub reason_code: Option<String>,

    /// Set once a retry has been scheduled off this attempt (idempotency)
    pub retry_scheduled: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iban_checksum() {
        // Valid Dutch and German IBANs
        assert!(Iban::parse("NL91 ABNA 0417 1643 00").is_ok());
        assert!(Iban::parse("DE89370400440532013000").is_ok());

        // Single digit flipped
        assert!(Iban::parse("NL91ABNA0417164301").is_err());
        // Too short
        assert!(Iban::parse("NL91").is_err());
    }

    #[test]
    fn test_iban_normalization() {
        let iban = Iban::parse("nl91 abna 0417 1643 00").unwrap();
        assert_eq!(iban.as_str(), "NL91ABNA0417164300");
        assert_eq!(iban.country_code(), "NL");
    }

    #[test]
    fn test_bic_validation() {
        assert!(Bic::parse("INGBNL2A").is_ok());
        assert!(Bic::parse("ABNANL2AXXX").is_ok());
        assert!(Bic::parse("SHORT").is_err());
        assert!(Bic::parse("INGB NL2A").is_err());
    }

    #[test]
    fn test_mandate_id_charset() {
        assert!(MandateId::parse("M-2024-00042").is_ok());
        assert!(MandateId::parse("").is_err());
        assert!(MandateId::parse("x".repeat(36)).is_err());
        assert!(MandateId::parse("M#42").is_err());
    }

    #[test]
    fn test_invoice_transitions() {
        use InvoiceStatus::*;
        assert!(Uncollected.can_transition_to(Queued));
        assert!(Queued.can_transition_to(InBatch));
        assert!(InBatch.can_transition_to(Collected));

        // Collected is terminal, never back to Queued
        assert!(!Collected.can_transition_to(Queued));
        assert!(!Collected.can_transition_to(Uncollected));
    }

    #[test]
    fn test_mandate_transitions() {
        use MandateStatus::*;
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Active));
        assert!(Expired.is_terminal());
    }

    #[test]
    fn test_risk_escalation() {
        assert_eq!(RiskClass::Low.escalate(), RiskClass::Medium);
        assert_eq!(RiskClass::Medium.escalate(), RiskClass::High);
        assert_eq!(RiskClass::High.escalate(), RiskClass::High);
        assert!(RiskClass::Low < RiskClass::High);
    }

    #[test]
    fn test_sequence_type_codes() {
        assert_eq!(SequenceType::Frst.code(), "FRST");
        assert_eq!(SequenceType::Rcur.code(), "RCUR");
        assert_eq!(
            SequenceType::for_state(SequenceState::FirstUsePending),
            SequenceType::Frst
        );
        assert_eq!(
            SequenceType::for_state(SequenceState::Recurring),
            SequenceType::Rcur
        );
    }
}
