//! Batch lifecycle manager
//!
//! Owns every batch from registration to its terminal state. The state
//! machine is `Generated -> PendingApproval -> Approved -> Submitted ->
//! {Settled | PartiallyFailed | Rejected}`; approval is delegated to an
//! external authority, submission serializes the batch to pain.008 and
//! hands it to the transport, and terminal states are derived from
//! per-entry outcomes recorded by the return processor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use dues_core::{
    AttemptStore, CollectionConfig, CollectionEvent, EventSink, InvoiceStatus, InvoiceStore,
    MandateStatus, MandateStore, RiskClass, SequenceType,
};

use crate::batch::{Batch, BatchStatus, EntryOutcome};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::notify::ApprovalAuthority;
use crate::pain008::Pain008Generator;
use crate::transport::{BankTransport, SubmissionReceipt};

/// Batch lifecycle manager
pub struct BatchLifecycleManager {
    batches: DashMap<Uuid, Batch>,

    /// End-to-end reference -> owning batch, filled at submission
    entry_index: DashMap<String, Uuid>,

    /// Batches whose file is at the transport right now; cancel is
    /// refused while a batch is in here
    in_flight: DashMap<Uuid, ()>,

    invoices: Arc<InvoiceStore>,
    mandates: Arc<MandateStore>,
    attempts: Arc<AttemptStore>,
    generator: Pain008Generator,
    transport: Arc<dyn BankTransport>,
    authority: Arc<dyn ApprovalAuthority>,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    config: CollectionConfig,
}

impl BatchLifecycleManager {
    /// Wire up the manager with its stores and collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoices: Arc<InvoiceStore>,
        mandates: Arc<MandateStore>,
        attempts: Arc<AttemptStore>,
        transport: Arc<dyn BankTransport>,
        authority: Arc<dyn ApprovalAuthority>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
        config: CollectionConfig,
    ) -> Self {
        Self {
            batches: DashMap::new(),
            entry_index: DashMap::new(),
            in_flight: DashMap::new(),
            invoices,
            mandates,
            attempts,
            generator: Pain008Generator::new(config.creditor.clone()),
            transport,
            authority,
            events,
            metrics,
            config,
        }
    }

    /// Register a freshly built batch
    ///
    /// Moves the batch to `PendingApproval` and its invoices from
    /// `Queued` to `InBatch`.
    pub fn register(&self, mut batch: Batch) -> Result<Uuid> {
        if batch.status != BatchStatus::Generated {
            return Err(Error::BatchState(format!(
                "Batch {} is not freshly generated",
                batch.reference
            )));
        }
        for entry in &batch.entries {
            self.invoices
                .transition(&entry.invoice, InvoiceStatus::InBatch)?;
        }
        batch.status = BatchStatus::PendingApproval;
        self.metrics.batches_created.inc();
        tracing::info!(
            "Registered batch {} ({} entries, total {})",
            batch.reference,
            batch.entry_count(),
            batch.total_amount()
        );
        let id = batch.id;
        self.batches.insert(id, batch);
        Ok(id)
    }

    /// Fetch a batch snapshot
    pub fn get(&self, id: Uuid) -> Result<Batch> {
        self.batches
            .get(&id)
            .map(|b| b.clone())
            .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", id)).into())
    }

    /// Current lifecycle status of a batch
    pub fn status(&self, id: Uuid) -> Result<BatchStatus> {
        Ok(self.get(id)?.status)
    }

    /// Batches currently in the given status
    pub fn batches_in(&self, status: BatchStatus) -> Vec<Batch> {
        self.batches
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.clone())
            .collect()
    }

    /// Approve a pending batch on behalf of `approver`
    ///
    /// The authority check is delegated; denial leaves the batch in
    /// `PendingApproval`.
    pub async fn approve(&self, id: Uuid, approver: &str) -> Result<()> {
        let (highest_risk, total) = {
            let batch = self
                .batches
                .get(&id)
                .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", id)))?;
            if batch.status != BatchStatus::PendingApproval {
                return Err(Error::BatchState(format!(
                    "Batch {} is not awaiting approval",
                    batch.reference
                )));
            }
            let risk = batch
                .entries
                .iter()
                .map(|e| e.risk)
                .max()
                .unwrap_or(RiskClass::Low);
            (risk, batch.total_amount())
        };

        let decision = self.authority.can_approve(approver, highest_risk, total).await?;
        if !decision.allowed {
            return Err(Error::Approval(decision.reason));
        }

        let mut batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", id)))?;
        // Re-check under the lock; the status may have moved during the
        // authority call
        if batch.status != BatchStatus::PendingApproval {
            return Err(Error::BatchState(format!(
                "Batch {} is not awaiting approval",
                batch.reference
            )));
        }
        batch.status = BatchStatus::Approved;
        tracing::info!("Batch {} approved by {}", batch.reference, approver);
        Ok(())
    }

    /// Cancel a batch before submission, releasing its invoices
    ///
    /// A failed submission may have opened attempts already; those are
    /// voided so the released invoices can be selected again.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let mut batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", id)))?;
        if !matches!(
            batch.status,
            BatchStatus::PendingApproval | BatchStatus::Approved
        ) {
            return Err(Error::BatchState(format!(
                "Batch {} cannot be cancelled after submission",
                batch.reference
            )));
        }
        if self.in_flight.contains_key(&id) {
            return Err(Error::BatchState(format!(
                "Batch {} has a submission in flight",
                batch.reference
            )));
        }
        for entry in batch.entries.iter_mut() {
            if let Some(attempt_id) = entry.attempt_id.take() {
                self.attempts.void(attempt_id, &entry.invoice)?;
            }
            if let Some(end_to_end_id) = entry.end_to_end_id.take() {
                self.entry_index.remove(&end_to_end_id);
            }
            self.invoices.release(&entry.invoice, None)?;
        }
        batch.status = BatchStatus::Rejected;
        tracing::info!("Batch {} cancelled, {} invoices released", batch.reference, batch.entry_count());
        Ok(())
    }

    /// Submit an approved batch to the bank
    ///
    /// Every entry's mandate is re-validated first; entries whose
    /// mandate is no longer active are pulled and their invoices
    /// released, without failing the rest of the batch. Transport
    /// failures and timeouts leave the batch `Approved` so a later call
    /// can resubmit the same instructions without reopening attempts.
    /// While the file is at the transport the batch cannot be cancelled.
    pub async fn submit(&self, id: Uuid) -> Result<SubmissionReceipt> {
        if self.in_flight.insert(id, ()).is_some() {
            return Err(Error::BatchState(format!(
                "Batch {} already has a submission in flight",
                id
            )));
        }
        let result = self.submit_inner(id).await;
        self.in_flight.remove(&id);
        result
    }

    async fn submit_inner(&self, id: Uuid) -> Result<SubmissionReceipt> {
        let (reference, xml, entry_count) = self.prepare_submission(id)?;

        let timeout = Duration::from_secs(self.config.submission.timeout_secs);
        let mut last_err = Error::Transport(format!("Batch {} was never submitted", reference));
        for try_number in 0..=self.config.submission.max_transport_retries {
            match tokio::time::timeout(timeout, self.transport.submit(&reference, &xml)).await {
                Ok(Ok(receipt)) => {
                    let mut batch = self
                        .batches
                        .get_mut(&id)
                        .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", id)))?;
                    // The in-flight guard keeps cancel out; still never
                    // overwrite a status that moved under the transport
                    // call
                    if batch.status != BatchStatus::Approved {
                        return Err(Error::BatchState(format!(
                            "Batch {} left Approved while the file was in transit",
                            batch.reference
                        )));
                    }
                    batch.status = BatchStatus::Submitted;
                    batch.submitted_at = Some(receipt.accepted_at);
                    self.metrics.entries_submitted.inc_by(entry_count as u64);
                    tracing::info!("Batch {} submitted ({} entries)", reference, entry_count);
                    return Ok(receipt);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Submission of {} failed on try {}: {}",
                        reference,
                        try_number + 1,
                        e
                    );
                    last_err = e;
                }
                Err(_) => {
                    tracing::warn!(
                        "Submission of {} timed out after {}s on try {}",
                        reference,
                        self.config.submission.timeout_secs,
                        try_number + 1
                    );
                    last_err = Error::SubmissionTimeout(self.config.submission.timeout_secs);
                }
            }
        }
        // Batch stays Approved; the scheduler will resubmit
        Err(last_err)
    }

    /// Re-validate entries, open attempts and serialize the file
    fn prepare_submission(&self, id: Uuid) -> Result<(String, String, usize)> {
        let mut batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", id)))?;
        if batch.status != BatchStatus::Approved {
            return Err(Error::BatchState(format!(
                "Batch {} is not approved for submission",
                batch.reference
            )));
        }

        // Pull entries whose mandate stopped being collectable since
        // selection; the rest of the batch proceeds
        let mut kept = Vec::with_capacity(batch.entries.len());
        for mut entry in std::mem::take(&mut batch.entries) {
            let mandate = self.mandates.get(&entry.mandate)?;
            if mandate.status != MandateStatus::Active {
                tracing::warn!(
                    "Pulling invoice {} from {}: mandate {} is {}",
                    entry.invoice,
                    batch.reference,
                    entry.mandate,
                    mandate.status
                );
                self.invoices.release(&entry.invoice, None)?;
                continue;
            }
            // The mandate may have completed its first collection since
            // selection; the wire sequence type follows the live state
            let seq = SequenceType::for_state(mandate.sequence_state);
            if seq != entry.sequence_type {
                tracing::warn!(
                    "Sequence type for invoice {} corrected to {} at submission",
                    entry.invoice,
                    seq.code()
                );
                entry.sequence_type = seq;
            }
            kept.push(entry);
        }
        batch.entries = kept;

        if batch.entries.is_empty() {
            batch.status = BatchStatus::Rejected;
            return Err(Error::BatchState(format!(
                "Batch {} lost all entries to mandate re-validation",
                batch.reference
            )));
        }

        let scheduled_for = batch
            .collection_date
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        for entry in batch.entries.iter_mut() {
            // Already-opened attempts are kept on resubmission
            if entry.attempt_id.is_some() {
                continue;
            }
            let number = self.attempts.history(&entry.invoice).len() as u32 + 1;
            let end_to_end_id = format!("E2E-{}-{}", entry.invoice, number);
            let attempt = self.attempts.open(
                entry.invoice.clone(),
                entry.mandate.clone(),
                entry.member.clone(),
                end_to_end_id.clone(),
                scheduled_for,
            )?;
            entry.attempt_id = Some(attempt.attempt_id);
            entry.end_to_end_id = Some(attempt.end_to_end_id);
            self.entry_index.insert(end_to_end_id, id);
        }

        // A validation failure here blocks submission and leaves the
        // batch Approved
        let xml = self.generator.generate(&*batch)?;
        Ok((batch.reference.clone(), xml, batch.entry_count()))
    }

    /// Record a per-entry outcome from the return processor
    ///
    /// Returns the derived terminal status once the last outstanding
    /// entry resolves. Replaying the same outcome is a no-op.
    pub fn record_entry_outcome(
        &self,
        end_to_end_id: &str,
        outcome: EntryOutcome,
        reason_code: Option<String>,
    ) -> Result<Option<BatchStatus>> {
        let batch_id = self
            .entry_index
            .get(end_to_end_id)
            .map(|r| *r.value())
            .ok_or_else(|| {
                dues_core::Error::NotFound(format!("Batch entry for reference {}", end_to_end_id))
            })?;
        let mut batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| dues_core::Error::NotFound(format!("Batch {}", batch_id)))?;

        let reference = batch.reference.clone();
        let entry = batch
            .entries
            .iter_mut()
            .find(|e| e.end_to_end_id.as_deref() == Some(end_to_end_id))
            .ok_or_else(|| {
                dues_core::Error::NotFound(format!(
                    "Entry {} in batch {}",
                    end_to_end_id, reference
                ))
            })?;

        match entry.outcome {
            Some(existing) if existing == outcome => return Ok(None),
            Some(existing) => {
                return Err(dues_core::Error::Conflict(format!(
                    "Entry {} already resolved as {:?}",
                    end_to_end_id, existing
                ))
                .into())
            }
            None => {
                entry.outcome = Some(outcome);
                entry.reason_code = reason_code;
            }
        }

        if batch.status != BatchStatus::Submitted || !batch.fully_reconciled() {
            return Ok(None);
        }

        let terminal = batch.derived_terminal_status();
        batch.status = terminal;
        batch.settled_at = Some(Utc::now());
        match terminal {
            BatchStatus::Settled => {
                self.metrics.batches_settled.inc();
                self.events.emit(CollectionEvent::BatchSettled {
                    batch_id,
                    total: batch.total_amount(),
                });
            }
            _ => {
                let collected = batch
                    .entries
                    .iter()
                    .filter(|e| e.outcome == Some(EntryOutcome::Collected))
                    .count();
                self.metrics.batches_partially_failed.inc();
                self.events.emit(CollectionEvent::BatchPartiallyFailed {
                    batch_id,
                    collected,
                    failed: batch.entry_count() - collected,
                });
            }
        }
        tracing::info!("Batch {} reconciled as {:?}", batch.reference, terminal);
        Ok(Some(terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchEntry;
    use crate::notify::ThresholdApprovalAuthority;
    use crate::transport::MockBankTransport;
    use chrono::NaiveDate;
    use dues_core::{
        Bic, Currency, Iban, InvoiceId, MandateId, MemberId, NewMandate, RecordingSink,
    };
    use rust_decimal::Decimal;

    struct Fixture {
        invoices: Arc<InvoiceStore>,
        mandates: Arc<MandateStore>,
        attempts: Arc<AttemptStore>,
        transport: Arc<MockBankTransport>,
        events: Arc<RecordingSink>,
        manager: BatchLifecycleManager,
    }

    fn fixture() -> Fixture {
        let invoices = Arc::new(InvoiceStore::new());
        let mandates = Arc::new(MandateStore::new());
        let attempts = Arc::new(AttemptStore::new());
        let transport = Arc::new(MockBankTransport::new());
        let events = Arc::new(RecordingSink::default());
        let authority = Arc::new(ThresholdApprovalAuthority::new(
            Decimal::new(2000, 0),
            vec!["supervisor".to_string()],
        ));
        let manager = BatchLifecycleManager::new(
            invoices.clone(),
            mandates.clone(),
            attempts.clone(),
            transport.clone(),
            authority,
            events.clone(),
            Metrics::new().unwrap(),
            CollectionConfig::default(),
        );
        Fixture {
            invoices,
            mandates,
            attempts,
            transport,
            events,
            manager,
        }
    }

    /// Batch entry for member `n`, without touching the stores
    fn entry_for(n: usize, amount: i64) -> BatchEntry {
        BatchEntry {
            invoice: InvoiceId::new(format!("INV-{}", n)),
            mandate: MandateId::parse(format!("M-{:03}", n)).unwrap(),
            member: MemberId::new(format!("MEM-{}", n)),
            debtor_name: format!("Member {}", n),
            iban: Iban::parse("NL91ABNA0417164300").unwrap(),
            bic: Bic::parse("ABNANL2A").unwrap(),
            amount: Decimal::new(amount, 0),
            sequence_type: SequenceType::Frst,
            risk: RiskClass::Low,
            mandate_signed_at: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            attempt_id: None,
            end_to_end_id: None,
            outcome: None,
            reason_code: None,
        }
    }

    /// Insert a claimed invoice plus active mandate and return the entry
    fn seed_entry(fx: &Fixture, n: usize, amount: i64) -> BatchEntry {
        let entry = entry_for(n, amount);
        fx.invoices
            .insert(
                entry.invoice.clone(),
                entry.member.clone(),
                entry.amount,
                Currency::EUR,
                NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            )
            .unwrap();
        assert!(fx.invoices.claim(&entry.invoice).unwrap());
        fx.mandates
            .create(
                NewMandate {
                    id: entry.mandate.clone(),
                    member: entry.member.clone(),
                    iban: entry.iban.clone(),
                    bic: entry.bic.clone(),
                    signed_at: entry.mandate_signed_at,
                },
                false,
            )
            .unwrap();
        entry
    }

    fn seed_batch(fx: &Fixture, count: usize) -> Uuid {
        let entries = (0..count).map(|n| seed_entry(fx, n, 25)).collect();
        let batch = Batch::new(1, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(), entries);
        fx.manager.register(batch).unwrap()
    }

    #[tokio::test]
    async fn test_register_moves_invoices_in_batch() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        assert_eq!(fx.manager.status(id).unwrap(), BatchStatus::PendingApproval);
        let invoice = fx.invoices.get(&InvoiceId::new("INV-0")).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::InBatch);
    }

    #[tokio::test]
    async fn test_approval_denied_without_authority() {
        let fx = fixture();
        let entries = vec![seed_entry(&fx, 0, 900), {
            let mut e = seed_entry(&fx, 1, 900);
            e.risk = RiskClass::High;
            e
        }, seed_entry(&fx, 2, 900)];
        let batch = Batch::new(1, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(), entries);
        let id = fx.manager.register(batch).unwrap();

        // High-risk batch: clerk denied, supervisor allowed
        let denied = fx.manager.approve(id, "clerk").await;
        assert!(matches!(denied, Err(Error::Approval(_))));
        assert_eq!(fx.manager.status(id).unwrap(), BatchStatus::PendingApproval);

        fx.manager.approve(id, "supervisor").await.unwrap();
        assert_eq!(fx.manager.status(id).unwrap(), BatchStatus::Approved);
    }

    #[tokio::test]
    async fn test_cancel_releases_invoices() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        fx.manager.cancel(id).unwrap();
        assert_eq!(fx.manager.status(id).unwrap(), BatchStatus::Rejected);
        let invoice = fx.invoices.get(&InvoiceId::new("INV-1")).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Uncollected);

        // Cannot cancel twice
        assert!(fx.manager.cancel(id).is_err());
    }

    #[tokio::test]
    async fn test_cancel_after_failed_submission_frees_invoices() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        fx.manager.approve(id, "clerk").await.unwrap();
        fx.transport.fail_next(10);
        assert!(fx.manager.submit(id).await.is_err());

        // Cancellation voids the attempts the failed submission opened
        fx.manager.cancel(id).unwrap();
        for n in 0..3 {
            assert!(fx
                .attempts
                .history(&InvoiceId::new(format!("INV-{}", n)))
                .is_empty());
        }

        // The released invoices go through a fresh batch with no stale
        // pending slot in the way
        fx.transport.fail_next(0);
        let entries = (0..3)
            .map(|n| {
                let invoice = InvoiceId::new(format!("INV-{}", n));
                assert!(fx.invoices.claim(&invoice).unwrap());
                entry_for(n, 25)
            })
            .collect();
        let batch = Batch::new(2, NaiveDate::from_ymd_opt(2025, 1, 8).unwrap(), entries);
        let second = fx.manager.register(batch).unwrap();
        fx.manager.approve(second, "clerk").await.unwrap();
        fx.manager.submit(second).await.unwrap();
        assert_eq!(fx.manager.status(second).unwrap(), BatchStatus::Submitted);
    }

    /// Transport that signals entry and waits to be released, so a test
    /// can interleave other calls with an in-flight submission
    #[derive(Default)]
    struct GatedTransport {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl crate::transport::BankTransport for GatedTransport {
        async fn submit(&self, reference: &str, _xml: &str) -> Result<SubmissionReceipt> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SubmissionReceipt {
                reference: reference.to_string(),
                accepted_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_refused_while_submission_in_flight() {
        let invoices = Arc::new(InvoiceStore::new());
        let mandates = Arc::new(MandateStore::new());
        let attempts = Arc::new(AttemptStore::new());
        let transport = Arc::new(GatedTransport::default());
        let manager = Arc::new(BatchLifecycleManager::new(
            invoices.clone(),
            mandates.clone(),
            attempts,
            transport.clone(),
            Arc::new(ThresholdApprovalAuthority::new(
                Decimal::new(2000, 0),
                Vec::new(),
            )),
            Arc::new(RecordingSink::default()),
            Metrics::new().unwrap(),
            CollectionConfig::default(),
        ));

        let entries: Vec<BatchEntry> = (0..3)
            .map(|n| {
                let entry = entry_for(n, 25);
                invoices
                    .insert(
                        entry.invoice.clone(),
                        entry.member.clone(),
                        entry.amount,
                        Currency::EUR,
                        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                    )
                    .unwrap();
                assert!(invoices.claim(&entry.invoice).unwrap());
                mandates
                    .create(
                        NewMandate {
                            id: entry.mandate.clone(),
                            member: entry.member.clone(),
                            iban: entry.iban.clone(),
                            bic: entry.bic.clone(),
                            signed_at: entry.mandate_signed_at,
                        },
                        false,
                    )
                    .unwrap();
                entry
            })
            .collect();
        let batch = Batch::new(1, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(), entries);
        let id = manager.register(batch).unwrap();
        manager.approve(id, "clerk").await.unwrap();

        let submission = tokio::spawn({
            let manager = manager.clone();
            async move { manager.submit(id).await }
        });
        transport.entered.notified().await;

        // The file is at the bank; cancelling now would release invoices
        // the bank is about to collect
        let denied = manager.cancel(id);
        assert!(matches!(denied, Err(Error::BatchState(_))));

        transport.release.notify_one();
        submission.await.unwrap().unwrap();
        assert_eq!(manager.status(id).unwrap(), BatchStatus::Submitted);
        let invoice = invoices.get(&InvoiceId::new("INV-0")).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::InBatch);
    }

    #[tokio::test]
    async fn test_submit_opens_attempts_and_sends_file() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        fx.manager.approve(id, "clerk").await.unwrap();
        fx.manager.submit(id).await.unwrap();

        assert_eq!(fx.manager.status(id).unwrap(), BatchStatus::Submitted);
        let batch = fx.manager.get(id).unwrap();
        for entry in &batch.entries {
            assert!(entry.attempt_id.is_some());
            assert!(entry.end_to_end_id.as_deref().unwrap().starts_with("E2E-INV-"));
        }
        let submissions = fx.transport.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].1.contains("pain.008.001.02"));
    }

    #[tokio::test]
    async fn test_submit_pulls_inactive_mandate_entries() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        fx.manager.approve(id, "clerk").await.unwrap();
        fx.mandates
            .transition(&MandateId::parse("M-001").unwrap(), MandateStatus::Cancelled)
            .unwrap();

        fx.manager.submit(id).await.unwrap();
        let batch = fx.manager.get(id).unwrap();
        assert_eq!(batch.entry_count(), 2);

        // The pulled invoice is back to Uncollected, not failed
        let pulled = fx.invoices.get(&InvoiceId::new("INV-1")).unwrap();
        assert_eq!(pulled.status, InvoiceStatus::Uncollected);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_batch_resumable() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        fx.manager.approve(id, "clerk").await.unwrap();

        // Fails beyond the bounded in-call retries
        fx.transport.fail_next(10);
        assert!(fx.manager.submit(id).await.is_err());
        assert_eq!(fx.manager.status(id).unwrap(), BatchStatus::Approved);

        // Resubmission succeeds without duplicating attempts
        fx.transport.fail_next(0);
        fx.manager.submit(id).await.unwrap();
        let batch = fx.manager.get(id).unwrap();
        for entry in &batch.entries {
            assert!(entry.end_to_end_id.as_deref().unwrap().ends_with("-1"));
        }
    }

    #[tokio::test]
    async fn test_outcomes_derive_terminal_status() {
        let fx = fixture();
        let id = seed_batch(&fx, 3);
        fx.manager.approve(id, "clerk").await.unwrap();
        fx.manager.submit(id).await.unwrap();
        let batch = fx.manager.get(id).unwrap();
        let refs: Vec<String> = batch
            .entries
            .iter()
            .map(|e| e.end_to_end_id.clone().unwrap())
            .collect();

        assert!(fx
            .manager
            .record_entry_outcome(&refs[0], EntryOutcome::Collected, None)
            .unwrap()
            .is_none());
        assert!(fx
            .manager
            .record_entry_outcome(&refs[1], EntryOutcome::Collected, None)
            .unwrap()
            .is_none());
        let terminal = fx
            .manager
            .record_entry_outcome(&refs[2], EntryOutcome::Returned, Some("AM04".to_string()))
            .unwrap();
        assert_eq!(terminal, Some(BatchStatus::PartiallyFailed));

        // Replay is a no-op; conflicting outcome is rejected
        assert!(fx
            .manager
            .record_entry_outcome(&refs[2], EntryOutcome::Returned, Some("AM04".to_string()))
            .unwrap()
            .is_none());
        assert!(fx
            .manager
            .record_entry_outcome(&refs[2], EntryOutcome::Collected, None)
            .is_err());

        let events = fx.events.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, CollectionEvent::BatchPartiallyFailed { failed: 1, .. })));
    }
}
