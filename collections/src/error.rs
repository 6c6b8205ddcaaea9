//! Error types for the collection engine

use thiserror::Error;

/// Result type for collection operations
pub type Result<T> = std::result::Result<T, Error>;

/// Collection engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Core store error
    #[error("Core error: {0}")]
    Core(#[from] dues_core::Error),

    /// Bank submission or network failure; the batch stays resumable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bank submission exceeded its bounded timeout
    #[error("Submission timed out after {0} seconds")]
    SubmissionTimeout(u64),

    /// pain.008 generation or schema validation failure
    #[error("ISO 20022 error: {0}")]
    Iso20022(String),

    /// Return file could not be parsed
    #[error("Return file error: {0}")]
    ReturnFile(String),

    /// Approval refused or approver lacks authority
    #[error("Approval refused: {0}")]
    Approval(String),

    /// Unmatched return record; escalated, never dropped
    #[error("Reconciliation anomaly: {0}")]
    ReconciliationAnomaly(String),

    /// All collection attempts exhausted for an invoice
    #[error("Retries exhausted: {0}")]
    ExhaustedRetries(String),

    /// Batch not in the right state for the requested operation
    #[error("Invalid batch state: {0}")]
    BatchState(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
