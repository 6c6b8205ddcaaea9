//! Error types for the dues core

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core domain errors
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Concurrent writers raced on the same record
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown mandate/invoice/attempt reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// An `Active` mandate already exists for the (member, account) pair
    #[error("Duplicate mandate: {0}")]
    DuplicateMandate(String),

    /// Status transition not allowed by the state machine
    #[error("Invalid transition from {from} to {to} for {entity}")]
    InvalidTransition {
        /// Entity kind and id
        entity: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Attempt bookkeeping violation (out-of-order or duplicate pending)
    #[error("Attempt error: {0}")]
    Attempt(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
