//! Direct-debit collection engine for membership dues
//!
//! Turns a pool of due invoices into bank-submittable collection batches,
//! tracks settlement outcomes from bank return files, and retries failed
//! collections a bounded number of times.
//!
//! # Pipeline
//!
//! 1. **Selection**: claim due invoices backed by an `Active` mandate
//! 2. **Scoring**: classify each candidate `Low`/`Medium`/`High` risk
//! 3. **Optimization**: pack candidates into batches under amount/size
//!    limits, spreading high-risk entries
//! 4. **Lifecycle**: approval, pain.008 generation, bank submission
//! 5. **Returns**: pain.002 ingestion resolves each entry; soft failures
//!    feed the retry scheduler, which re-enters selection
//!
//! # Example
//!
//! ```no_run
//! use collections::EngineBuilder;
//! use dues_core::CollectionConfig;
//!
//! #[tokio::main]
//! async fn main() -> collections::Result<()> {
//!     let engine = EngineBuilder::new(CollectionConfig::default()).build()?;
//!     let report = engine.run_collection(chrono::Utc::now(), false)?;
//!     println!("created {} batches", report.batch_ids.len());
//!     for (batch, outcome) in engine.submit_approved().await {
//!         println!("batch {}: {:?}", batch, outcome.is_ok());
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod batch;
pub mod calendar;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod optimizer;
pub mod pain008;
pub mod retry;
pub mod returns;
pub mod risk;
pub mod selector;
pub mod transport;

pub use batch::{Batch, BatchEntry, BatchStatus, EntryOutcome};
pub use engine::{CollectionEngine, EngineBuilder, RunReport};
pub use error::{Error, Result};
pub use lifecycle::BatchLifecycleManager;
pub use metrics::Metrics;
pub use notify::{
    ApprovalAuthority, ApprovalDecision, MemberAccount, MemberDirectory, Notifier,
    RecordingNotifier, Severity, StaticMemberDirectory, ThresholdApprovalAuthority,
    TracingNotifier,
};
pub use optimizer::{BatchOptimizer, BatchPlan, ScoredCandidate};
pub use pain008::Pain008Generator;
pub use retry::{RetryDecision, RetryScheduler};
pub use returns::{classify_reason, IngestReport, ReasonClass, ReturnProcessor};
pub use risk::{CandidateSnapshot, RiskScorer};
pub use selector::{Candidate, EligibilitySelector, SelectionReport};
pub use transport::{BankTransport, MockBankTransport, SubmissionReceipt};
