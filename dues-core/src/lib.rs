//! Core domain for membership dues collection
//!
//! Holds the mandate, invoice, and payment-attempt stores together with
//! the shared types, error taxonomy, and injected configuration used by
//! the collection engine.
//!
//! # Design
//!
//! - All money is `rust_decimal::Decimal` (exact arithmetic).
//! - Status transitions go through versioned compare-and-set operations:
//!   concurrent writers either succeed or observe a `Conflict`, never a
//!   lost update.
//! - Records are never deleted, only status-transitioned (audit trail).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod attempt;
pub mod config;
pub mod error;
pub mod events;
pub mod invoice;
pub mod mandate;
pub mod types;

pub use attempt::AttemptStore;
pub use config::{
    BatchConfig, CollectionConfig, CreditorConfig, MandateConfig, RetryConfig, RiskConfig,
    SubmissionConfig,
};
pub use error::{Error, Result};
pub use events::{CollectionEvent, EventSink, RecordingSink, TracingSink};
pub use invoice::InvoiceStore;
pub use mandate::{MandateStore, NewMandate, SweepReport};
pub use types::*;
