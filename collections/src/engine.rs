//! Collection engine
//!
//! Wires the pipeline together and exposes the operational API: the
//! scheduled run (select, score, pack, register), approval, cancel,
//! submission of approved batches, return-file ingestion, mandate
//! capture and the inactivity sweep. A date-keyed single-flight lock
//! keeps two concurrent runs from producing duplicate batches for the
//! same collection window.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use dues_core::{
    AttemptStore, Bic, CollectionConfig, CollectionEvent, EventSink, Iban, InvoiceId,
    InvoiceStore, Mandate, MandateId, MandateStatus, MandateStore, MemberId, NewMandate,
    SweepReport, TracingSink,
};

use crate::batch::BatchStatus;
use crate::error::{Error, Result};
use crate::lifecycle::BatchLifecycleManager;
use crate::metrics::Metrics;
use crate::notify::{
    ApprovalAuthority, MemberDirectory, Notifier, Severity, StaticMemberDirectory,
    ThresholdApprovalAuthority, TracingNotifier,
};
use crate::optimizer::{BatchOptimizer, ScoredCandidate};
use crate::retry::RetryScheduler;
use crate::returns::{IngestReport, ReturnProcessor};
use crate::risk::{CandidateSnapshot, RiskScorer};
use crate::selector::EligibilitySelector;
use crate::transport::{BankTransport, MockBankTransport};

/// Outcome of one scheduled collection run
#[derive(Debug, Default)]
pub struct RunReport {
    /// Candidates claimed by the selector
    pub selected: usize,

    /// Invoices deferred by the per-member frequency cap
    pub deferred_by_cap: usize,

    /// Invoices skipped for lack of an active mandate
    pub no_mandate: usize,

    /// Invoices released because the member directory had no account
    pub unresolved_members: usize,

    /// Oversized invoices surfaced for manual handling
    pub rejected_for_manual: Vec<InvoiceId>,

    /// Claimed candidates rolled over as an undersized remainder
    pub rolled_over: usize,

    /// Batches registered and awaiting approval
    pub batch_ids: Vec<Uuid>,
}

/// The assembled collection pipeline
pub struct CollectionEngine {
    invoices: Arc<InvoiceStore>,
    mandates: Arc<MandateStore>,
    attempts: Arc<AttemptStore>,
    selector: EligibilitySelector,
    scorer: RiskScorer,
    optimizer: BatchOptimizer,
    lifecycle: Arc<BatchLifecycleManager>,
    returns: ReturnProcessor,
    directory: Arc<dyn MemberDirectory>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSink>,
    config: CollectionConfig,
    metrics: Metrics,

    /// Single-flight lock per collection window
    run_locks: DashMap<NaiveDate, ()>,
}

impl CollectionEngine {
    /// Start assembling an engine
    pub fn builder(config: CollectionConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Shared invoice store
    pub fn invoices(&self) -> &Arc<InvoiceStore> {
        &self.invoices
    }

    /// Shared mandate store
    pub fn mandates(&self) -> &Arc<MandateStore> {
        &self.mandates
    }

    /// Shared attempt store
    pub fn attempts(&self) -> &Arc<AttemptStore> {
        &self.attempts
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run one collection cycle as of `as_of`
    ///
    /// Selects and claims due invoices, scores them, packs them into
    /// batches and registers the batches for approval. `force_flush`
    /// lets an undersized remainder through (end-of-period cutoff).
    pub fn run_collection(&self, as_of: DateTime<Utc>, force_flush: bool) -> Result<RunReport> {
        let window = as_of.date_naive();
        let _guard = match self.run_locks.entry(window) {
            Entry::Occupied(_) => {
                return Err(dues_core::Error::Conflict(format!(
                    "A collection run for {} is already in flight",
                    window
                ))
                .into())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(());
                RunGuard {
                    locks: &self.run_locks,
                    key: window,
                }
            }
        };

        let selection = self.selector.select_candidates(as_of)?;
        let mut report = RunReport {
            selected: selection.candidates.len(),
            deferred_by_cap: selection.deferred,
            no_mandate: selection.no_mandate,
            ..RunReport::default()
        };

        let failure_window =
            Duration::days(self.config.risk.failure_window_months as i64 * 30);
        let mut scored = Vec::with_capacity(selection.candidates.len());
        for candidate in selection.candidates {
            let Some(account) = self.directory.resolve(&candidate.invoice.member) else {
                tracing::warn!(
                    "No directory entry for member {}; releasing invoice {}",
                    candidate.invoice.member,
                    candidate.invoice.id
                );
                self.invoices.release(&candidate.invoice.id, None)?;
                report.unresolved_members += 1;
                continue;
            };
            let snapshot = CandidateSnapshot {
                mandate_signed_at: candidate.mandate.signed_at,
                as_of: as_of.date_naive(),
                recent_failures: self
                    .attempts
                    .returned_count_since(&candidate.mandate.id, as_of - failure_window),
                amount: candidate.invoice.amount,
                sequence_type: candidate.sequence_type,
            };
            let risk = self.scorer.score(&snapshot);
            scored.push(ScoredCandidate {
                candidate,
                risk,
                debtor_name: account.name,
            });
        }

        let plan = self.optimizer.build_batches(scored, as_of, force_flush);

        for rejected in plan.rejected {
            let invoice = rejected.candidate.invoice;
            self.invoices.release(&invoice.id, None)?;
            self.notifier.notify(
                Severity::Warning,
                invoice.id.as_str(),
                &format!(
                    "Amount {} exceeds the single-collection maximum; handle manually",
                    invoice.amount
                ),
            );
            report.rejected_for_manual.push(invoice.id);
        }
        for deferred in plan.deferred {
            // Back to the pool for the next scheduled run
            self.invoices
                .release(&deferred.candidate.invoice.id, None)?;
            report.rolled_over += 1;
        }

        for batch in plan.batches {
            let id = self.lifecycle.register(batch)?;
            report.batch_ids.push(id);
        }

        tracing::info!(
            "Collection run for {}: {} selected, {} batches registered, {} rolled over",
            window,
            report.selected,
            report.batch_ids.len(),
            report.rolled_over
        );
        Ok(report)
    }

    /// Submit every approved batch, continuing past individual failures
    ///
    /// Failed submissions stay `Approved` and are retried on the next
    /// call.
    pub async fn submit_approved(&self) -> Vec<(Uuid, Result<()>)> {
        let mut results = Vec::new();
        for batch in self.lifecycle.batches_in(BatchStatus::Approved) {
            let outcome = self.lifecycle.submit(batch.id).await.map(|_| ());
            if let Err(e) = &outcome {
                tracing::warn!("Batch {} not submitted: {}", batch.reference, e);
            }
            results.push((batch.id, outcome));
        }
        results
    }

    /// Current status of a batch
    pub fn batch_status(&self, id: Uuid) -> Result<BatchStatus> {
        self.lifecycle.status(id)
    }

    /// Full snapshot of a batch
    pub fn batch(&self, id: Uuid) -> Result<crate::batch::Batch> {
        self.lifecycle.get(id)
    }

    /// Approve a pending batch on behalf of `approver`
    pub async fn approve_batch(&self, id: Uuid, approver: &str) -> Result<()> {
        self.lifecycle.approve(id, approver).await
    }

    /// Cancel a batch before submission
    pub fn cancel_batch(&self, id: Uuid) -> Result<()> {
        self.lifecycle.cancel(id)
    }

    /// Ingest one bank return file
    pub fn ingest_returns(&self, xml: &str, now: DateTime<Utc>) -> Result<IngestReport> {
        self.returns.ingest(xml, now)
    }

    /// Capture a mandate for a member, resolving the account through
    /// the directory
    pub fn create_mandate(
        &self,
        id: MandateId,
        member: MemberId,
        signed_at: NaiveDate,
        supersede: bool,
    ) -> Result<Mandate> {
        let account = self.directory.resolve(&member).ok_or_else(|| {
            dues_core::Error::NotFound(format!("Member {} in directory", member))
        })?;
        let mandate = self.mandates.create(
            NewMandate {
                id,
                member,
                iban: Iban::parse(&account.iban)?,
                bic: Bic::parse(&account.bic)?,
                signed_at,
            },
            supersede,
        )?;
        Ok(mandate)
    }

    /// Current status of a mandate
    pub fn mandate_status(&self, id: &MandateId) -> Result<MandateStatus> {
        Ok(self.mandates.validate(id)?)
    }

    /// Run the mandate inactivity sweep, emitting expiry events
    pub fn sweep_mandates(&self, as_of: DateTime<Utc>) -> SweepReport {
        let report = self.mandates.sweep(as_of, &self.config.mandate);
        for id in &report.expired {
            self.events
                .emit(CollectionEvent::MandateExpired { mandate: id.clone() });
        }
        for (id, expires_at) in &report.expiring_soon {
            self.events.emit(CollectionEvent::MandateExpiring {
                mandate: id.clone(),
                expires_at: *expires_at,
            });
        }
        report
    }
}

struct RunGuard<'a> {
    locks: &'a DashMap<NaiveDate, ()>,
    key: NaiveDate,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.locks.remove(&self.key);
    }
}

/// Builder wiring collaborators into a [`CollectionEngine`]
///
/// Every collaborator has a single-process default: a mock transport,
/// a threshold approval authority, tracing-based notifier and event
/// sink, and an empty member directory.
pub struct EngineBuilder {
    config: CollectionConfig,
    transport: Option<Arc<dyn BankTransport>>,
    authority: Option<Arc<dyn ApprovalAuthority>>,
    directory: Option<Arc<dyn MemberDirectory>>,
    notifier: Option<Arc<dyn Notifier>>,
    events: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    /// Start from a configuration
    pub fn new(config: CollectionConfig) -> Self {
        Self {
            config,
            transport: None,
            authority: None,
            directory: None,
            notifier: None,
            events: None,
        }
    }

    /// Use this bank transport
    pub fn transport(mut self, transport: Arc<dyn BankTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this approval authority
    pub fn authority(mut self, authority: Arc<dyn ApprovalAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Use this member directory
    pub fn directory(mut self, directory: Arc<dyn MemberDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Use this escalation channel
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use this event sink
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<CollectionEngine> {
        self.config.validate()?;
        let config = self.config;

        let invoices = Arc::new(InvoiceStore::new());
        let mandates = Arc::new(MandateStore::new());
        let attempts = Arc::new(AttemptStore::new());
        let metrics = Metrics::new().map_err(|e| Error::Config(e.to_string()))?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(MockBankTransport::new()));
        let authority = self.authority.unwrap_or_else(|| {
            Arc::new(ThresholdApprovalAuthority::new(
                config.batch.max_amount,
                Vec::new(),
            ))
        });
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticMemberDirectory::new()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier::default()));
        let events = self.events.unwrap_or_else(|| Arc::new(TracingSink));

        let lifecycle = Arc::new(BatchLifecycleManager::new(
            invoices.clone(),
            mandates.clone(),
            attempts.clone(),
            transport,
            authority,
            events.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let retry = Arc::new(RetryScheduler::new(
            invoices.clone(),
            attempts.clone(),
            events.clone(),
            notifier.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let returns = ReturnProcessor::new(
            invoices.clone(),
            mandates.clone(),
            attempts.clone(),
            lifecycle.clone(),
            retry,
            events.clone(),
            metrics.clone(),
        );

        Ok(CollectionEngine {
            selector: EligibilitySelector::new(
                invoices.clone(),
                mandates.clone(),
                attempts.clone(),
                config.clone(),
            ),
            scorer: RiskScorer::new(config.risk.clone()),
            optimizer: BatchOptimizer::new(config.clone()),
            lifecycle,
            returns,
            directory,
            notifier,
            events,
            invoices,
            mandates,
            attempts,
            config,
            metrics,
            run_locks: DashMap::new(),
        })
    }
}
