//! Return file processing
//!
//! Ingests bank pain.002 status reports, matches each transaction to
//! its payment attempt by end-to-end reference and applies the outcome:
//! successes collect the invoice and advance the mandate, hard-fail
//! reason codes terminate the invoice and act on the mandate, soft-fail
//! codes go to the retry scheduler. Unmatched records and unknown
//! reason codes are surfaced for manual review, never dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::de::from_str as from_xml_str;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;

use dues_core::{
    AttemptStatus, AttemptStore, CollectionEvent, EventSink, InvoiceStatus, InvoiceStore,
    MandateStatus, MandateStore, PaymentAttempt,
};

use crate::batch::EntryOutcome;
use crate::error::{Error, Result};
use crate::lifecycle::BatchLifecycleManager;
use crate::metrics::Metrics;
use crate::retry::{RetryDecision, RetryScheduler};

/// Classification of an ISO return reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonClass {
    /// Retryable (e.g. insufficient funds)
    Soft,
    /// Terminal for the invoice, acts on the mandate
    Hard,
    /// Unrecognized; routed to manual review
    Unknown,
}

/// Classify a return reason code
pub fn classify_reason(code: &str) -> ReasonClass {
    match code {
        // Insufficient funds and bank-side processing failures clear up
        // on their own
        "AM04" | "MS02" | "MS03" => ReasonClass::Soft,
        "AC04" | "AC06" | "AG01" | "MD01" | "MD07" | "SL01" => ReasonClass::Hard,
        _ => ReasonClass::Unknown,
    }
}

/// Mandate status a hard-fail reason code forces, if any
fn mandate_consequence(code: &str) -> Option<MandateStatus> {
    match code {
        // Account closed, debtor deceased, no valid mandate: the
        // authorization is gone for good
        "AC04" | "MD01" | "MD07" => Some(MandateStatus::Cancelled),
        // Blocked account, forbidden transaction, specific service
        // refusal: suspend until a human sorts it out
        "AC06" | "AG01" | "SL01" => Some(MandateStatus::Suspended),
        _ => None,
    }
}

/// Tallies from one ingested return file
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Entries confirmed collected
    pub collected: usize,
    /// Soft failures handed to the retry scheduler
    pub returned_soft: usize,
    /// Hard failures, invoice terminally failed
    pub returned_hard: usize,
    /// Unknown reason codes routed to manual review
    pub manual_review: usize,
    /// Retries actually placed on the schedule
    pub retries_scheduled: usize,
    /// Invoices that ran out of attempts
    pub exhausted: usize,
    /// Records that matched no attempt
    pub anomalies: usize,
    /// Records that replayed an already-applied outcome
    pub replayed: usize,
}

/// Return processor
pub struct ReturnProcessor {
    invoices: Arc<InvoiceStore>,
    mandates: Arc<MandateStore>,
    attempts: Arc<AttemptStore>,
    lifecycle: Arc<BatchLifecycleManager>,
    retry: Arc<RetryScheduler>,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
}

impl ReturnProcessor {
    /// Wire up the processor with its stores and collaborators
    pub fn new(
        invoices: Arc<InvoiceStore>,
        mandates: Arc<MandateStore>,
        attempts: Arc<AttemptStore>,
        lifecycle: Arc<BatchLifecycleManager>,
        retry: Arc<RetryScheduler>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            invoices,
            mandates,
            attempts,
            lifecycle,
            retry,
            events,
            metrics,
        }
    }

    /// Ingest one pain.002 status report
    ///
    /// Per-record failures never abort the file; every record either
    /// applies cleanly or ends up in the report as an anomaly.
    pub fn ingest(&self, xml: &str, now: DateTime<Utc>) -> Result<IngestReport> {
        let document: Pain002Document = from_xml_str(xml)
            .map_err(|e| Error::ReturnFile(format!("Malformed pain.002: {}", e)))?;

        let mut report = IngestReport::default();
        let records: Vec<&TransactionStatus> = document
            .cstmr_pmt_sts_rpt
            .orgnl_pmt_inf_and_sts
            .iter()
            .flat_map(|p| p.tx_inf_and_sts.iter())
            .collect();
        tracing::info!(
            "Ingesting return file {} with {} records",
            document.cstmr_pmt_sts_rpt.grp_hdr.msg_id,
            records.len()
        );

        for record in records {
            let reference = record.orgnl_end_to_end_id.as_str();
            let Some(attempt) = self.attempts.find_by_reference(reference) else {
                self.anomaly(
                    &mut report,
                    reference,
                    "No payment attempt matches this reference",
                );
                continue;
            };

            if attempt.status != AttemptStatus::Pending {
                // Replayed file; the outcome was already applied
                tracing::debug!("Skipping already-resolved attempt {}", reference);
                report.replayed += 1;
                continue;
            }

            let reason_code = record.reason_code();
            let applied = match record.tx_sts.as_str() {
                "ACSC" | "ACCP" | "ACCC" => self.apply_success(&attempt, &mut report),
                "RJCT" => self.apply_return(&attempt, reason_code, now, &mut report),
                other => {
                    self.anomaly(
                        &mut report,
                        reference,
                        &format!("Unrecognized transaction status '{}'", other),
                    );
                    Ok(())
                }
            };
            if let Err(e) = applied {
                // Data-integrity problem on a single record; keep going
                self.anomaly(&mut report, reference, &format!("Failed to apply: {}", e));
            }
        }
        Ok(report)
    }

    fn apply_success(&self, attempt: &PaymentAttempt, report: &mut IngestReport) -> Result<()> {
        self.attempts.record_outcome(
            attempt.attempt_id,
            &attempt.invoice,
            AttemptStatus::Collected,
            None,
        )?;
        self.invoices
            .transition(&attempt.invoice, InvoiceStatus::Collected)?;
        self.mandates
            .mark_used(&attempt.mandate, attempt.attempt_id, true)?;
        self.lifecycle
            .record_entry_outcome(&attempt.end_to_end_id, EntryOutcome::Collected, None)?;

        let amount = self.invoices.get(&attempt.invoice)?.amount;
        self.metrics.entries_collected.inc();
        self.metrics
            .amount_collected
            .inc_by(amount.to_f64().unwrap_or(0.0));
        self.events.emit(CollectionEvent::InvoiceCollected {
            invoice: attempt.invoice.clone(),
            amount,
        });
        report.collected += 1;
        Ok(())
    }

    fn apply_return(
        &self,
        attempt: &PaymentAttempt,
        reason_code: Option<String>,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let applied = self.attempts.record_outcome(
            attempt.attempt_id,
            &attempt.invoice,
            AttemptStatus::Returned,
            reason_code.clone(),
        )?;
        self.mandates
            .mark_used(&attempt.mandate, attempt.attempt_id, false)?;
        self.lifecycle.record_entry_outcome(
            &attempt.end_to_end_id,
            EntryOutcome::Returned,
            reason_code.clone(),
        )?;
        self.metrics.entries_returned.inc();

        let code = reason_code.as_deref().unwrap_or("");
        match classify_reason(code) {
            ReasonClass::Soft => {
                report.returned_soft += 1;
                match self.retry.handle_return(&applied, now)? {
                    RetryDecision::Scheduled { .. } => report.retries_scheduled += 1,
                    RetryDecision::Exhausted => report.exhausted += 1,
                    RetryDecision::AlreadyHandled => {}
                }
            }
            ReasonClass::Hard => {
                report.returned_hard += 1;
                self.invoices
                    .transition(&attempt.invoice, InvoiceStatus::Failed)?;
                if let Some(consequence) = mandate_consequence(code) {
                    // The mandate may already be past this state
                    if let Err(e) = self.mandates.transition(&attempt.mandate, consequence) {
                        tracing::warn!(
                            "Could not move mandate {} to {} after {}: {}",
                            attempt.mandate,
                            consequence,
                            code,
                            e
                        );
                    }
                }
                self.events.emit(CollectionEvent::InvoiceFailed {
                    invoice: attempt.invoice.clone(),
                    reason_code: reason_code.clone(),
                });
            }
            ReasonClass::Unknown => {
                // Default to manual review rather than guessing
                report.manual_review += 1;
                self.invoices
                    .transition(&attempt.invoice, InvoiceStatus::Failed)?;
                let details =
                    format!("Unknown return reason code '{}', manual review required", code);
                tracing::warn!("Return for {}: {}", attempt.end_to_end_id, details);
                self.metrics.reconciliation_anomalies.inc();
                self.events.emit(CollectionEvent::ReconciliationAnomaly {
                    reference: attempt.end_to_end_id.clone(),
                    details,
                });
                self.events.emit(CollectionEvent::InvoiceFailed {
                    invoice: attempt.invoice.clone(),
                    reason_code,
                });
            }
        }
        Ok(())
    }

    fn anomaly(&self, report: &mut IngestReport, reference: &str, details: &str) {
        tracing::warn!("Reconciliation anomaly for {}: {}", reference, details);
        self.metrics.reconciliation_anomalies.inc();
        self.events.emit(CollectionEvent::ReconciliationAnomaly {
            reference: reference.to_string(),
            details: details.to_string(),
        });
        report.anomalies += 1;
    }
}

// ISO 20022 pain.002.001.03 structures (fields the processor reads)

#[derive(Debug, Deserialize)]
#[serde(rename = "Document")]
struct Pain002Document {
    #[serde(rename = "CstmrPmtStsRpt")]
    cstmr_pmt_sts_rpt: CstmrPmtStsRpt,
}

#[derive(Debug, Deserialize)]
struct CstmrPmtStsRpt {
    #[serde(rename = "GrpHdr")]
    grp_hdr: GroupHeader,

    #[serde(rename = "OrgnlPmtInfAndSts", default)]
    orgnl_pmt_inf_and_sts: Vec<OriginalPaymentInfo>,
}

#[derive(Debug, Deserialize)]
struct GroupHeader {
    #[serde(rename = "MsgId")]
    msg_id: String,
}

#[derive(Debug, Deserialize)]
struct OriginalPaymentInfo {
    #[serde(rename = "TxInfAndSts", default)]
    tx_inf_and_sts: Vec<TransactionStatus>,
}

#[derive(Debug, Deserialize)]
struct TransactionStatus {
    #[serde(rename = "OrgnlEndToEndId")]
    orgnl_end_to_end_id: String,

    #[serde(rename = "TxSts")]
    tx_sts: String,

    #[serde(rename = "StsRsnInf")]
    sts_rsn_inf: Option<StatusReason>,
}

impl TransactionStatus {
    fn reason_code(&self) -> Option<String> {
        self.sts_rsn_inf
            .as_ref()
            .and_then(|s| s.rsn.as_ref())
            .and_then(|r| r.cd.clone())
    }
}

#[derive(Debug, Deserialize)]
struct StatusReason {
    #[serde(rename = "Rsn")]
    rsn: Option<Reason>,
}

#[derive(Debug, Deserialize)]
struct Reason {
    #[serde(rename = "Cd")]
    cd: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchEntry, BatchStatus};
    use crate::notify::{RecordingNotifier, ThresholdApprovalAuthority};
    use crate::transport::MockBankTransport;
    use chrono::NaiveDate;
    use dues_core::{
        Bic, CollectionConfig, Currency, Iban, InvoiceId, MandateId, MemberId, NewMandate,
        RecordingSink, RiskClass, SequenceState, SequenceType,
    };
    use rust_decimal::Decimal;

    struct Fixture {
        invoices: Arc<InvoiceStore>,
        mandates: Arc<MandateStore>,
        lifecycle: Arc<BatchLifecycleManager>,
        notifier: Arc<RecordingNotifier>,
        events: Arc<RecordingSink>,
        processor: ReturnProcessor,
    }

    fn fixture() -> Fixture {
        let invoices = Arc::new(InvoiceStore::new());
        let mandates = Arc::new(MandateStore::new());
        let attempts = Arc::new(AttemptStore::new());
        let events = Arc::new(RecordingSink::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let metrics = Metrics::new().unwrap();
        let config = CollectionConfig::default();
        let lifecycle = Arc::new(BatchLifecycleManager::new(
            invoices.clone(),
            mandates.clone(),
            attempts.clone(),
            Arc::new(MockBankTransport::new()),
            Arc::new(ThresholdApprovalAuthority::new(
                Decimal::new(100_000, 0),
                vec![],
            )),
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
            config,
        ));
        let processor = ReturnProcessor::new(
            invoices.clone(),
            mandates.clone(),
            attempts,
            lifecycle.clone(),
            retry,
            events.clone(),
            metrics,
        );
        Fixture {
            invoices,
            mandates,
            lifecycle,
            notifier,
            events,
            processor,
        }
    }

    /// Register, approve and submit a 3-entry batch; returns its
    /// end-to-end references in entry order
    async fn submitted_batch(fx: &Fixture) -> (uuid::Uuid, Vec<String>) {
        let mut entries = Vec::new();
        for n in 0..3 {
            let member = MemberId::new(format!("MEM-{}", n));
            let invoice_id = InvoiceId::new(format!("INV-{}", n));
            let mandate_id = MandateId::parse(format!("M-{:03}", n)).unwrap();
            fx.invoices
                .insert(
                    invoice_id.clone(),
                    member.clone(),
                    Decimal::new(25, 0),
                    Currency::EUR,
                    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                )
                .unwrap();
            fx.invoices.claim(&invoice_id).unwrap();
            fx.mandates
                .create(
                    NewMandate {
                        id: mandate_id.clone(),
                        member: member.clone(),
                        iban: Iban::parse("NL91ABNA0417164300").unwrap(),
                        bic: Bic::parse("ABNANL2A").unwrap(),
                        signed_at: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                    },
                    false,
                )
                .unwrap();
            entries.push(BatchEntry {
                invoice: invoice_id,
                mandate: mandate_id,
                member,
                debtor_name: format!("Member {}", n),
                iban: Iban::parse("NL91ABNA0417164300").unwrap(),
                bic: Bic::parse("ABNANL2A").unwrap(),
                amount: Decimal::new(25, 0),
                sequence_type: SequenceType::Frst,
                risk: RiskClass::Low,
                mandate_signed_at: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                attempt_id: None,
                end_to_end_id: None,
                outcome: None,
                reason_code: None,
            });
        }
        let batch = Batch::new(1, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(), entries);
        let id = fx.lifecycle.register(batch).unwrap();
        fx.lifecycle.approve(id, "anyone").await.unwrap();
        fx.lifecycle.submit(id).await.unwrap();
        let refs = fx
            .lifecycle
            .get(id)
            .unwrap()
            .entries
            .iter()
            .map(|e| e.end_to_end_id.clone().unwrap())
            .collect();
        (id, refs)
    }

    fn return_file(records: &[(&str, &str, Option<&str>)]) -> String {
        let mut txs = String::new();
        for (reference, status, reason) in records {
            let reason_block = reason
                .map(|code| format!("<StsRsnInf><Rsn><Cd>{}</Cd></Rsn></StsRsnInf>", code))
                .unwrap_or_default();
            txs.push_str(&format!(
                "<TxInfAndSts><OrgnlEndToEndId>{}</OrgnlEndToEndId><TxSts>{}</TxSts>{}</TxInfAndSts>",
                reference, status, reason_block
            ));
        }
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Document xmlns=\"urn:iso:std:iso:20022:tech:xsd:pain.002.001.03\">\
             <CstmrPmtStsRpt>\
             <GrpHdr><MsgId>BANK-STS-1</MsgId><CreDtTm>2025-01-08T10:00:00Z</CreDtTm></GrpHdr>\
             <OrgnlPmtInfAndSts><OrgnlPmtInfId>COL-1</OrgnlPmtInfId>{}</OrgnlPmtInfAndSts>\
             </CstmrPmtStsRpt></Document>",
            txs
        )
    }

    #[test]
    fn test_reason_classification() {
        assert_eq!(classify_reason("AM04"), ReasonClass::Soft);
        assert_eq!(classify_reason("MS03"), ReasonClass::Soft);
        assert_eq!(classify_reason("AC04"), ReasonClass::Hard);
        assert_eq!(classify_reason("MD07"), ReasonClass::Hard);
        assert_eq!(classify_reason("XX99"), ReasonClass::Unknown);
    }

    #[tokio::test]
    async fn test_success_collects_and_advances_mandate() {
        let fx = fixture();
        let (_, refs) = submitted_batch(&fx).await;
        let xml = return_file(&[(&refs[0], "ACSC", None)]);

        let report = fx.processor.ingest(&xml, Utc::now()).unwrap();
        assert_eq!(report.collected, 1);

        let invoice = fx.invoices.get(&InvoiceId::new("INV-0")).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Collected);
        // First successful collection flips the mandate to recurring
        let mandate = fx.mandates.get(&MandateId::parse("M-000").unwrap()).unwrap();
        assert_eq!(mandate.sequence_state, SequenceState::Recurring);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let fx = fixture();
        let (id, refs) = submitted_batch(&fx).await;
        // One hard fail among successes
        let xml = return_file(&[
            (&refs[0], "ACSC", None),
            (&refs[1], "RJCT", Some("AC04")),
            (&refs[2], "ACSC", None),
        ]);

        let report = fx.processor.ingest(&xml, Utc::now()).unwrap();
        assert_eq!(report.collected, 2);
        assert_eq!(report.returned_hard, 1);

        assert_eq!(fx.lifecycle.status(id).unwrap(), BatchStatus::PartiallyFailed);
        assert_eq!(
            fx.invoices.get(&InvoiceId::new("INV-0")).unwrap().status,
            InvoiceStatus::Collected
        );
        assert_eq!(
            fx.invoices.get(&InvoiceId::new("INV-1")).unwrap().status,
            InvoiceStatus::Failed
        );
        // Account closed cancels the mandate
        assert_eq!(
            fx.mandates.get(&MandateId::parse("M-001").unwrap()).unwrap().status,
            dues_core::MandateStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_soft_fail_goes_to_retry() {
        let fx = fixture();
        let (_, refs) = submitted_batch(&fx).await;
        let xml = return_file(&[(&refs[0], "RJCT", Some("AM04"))]);

        let report = fx.processor.ingest(&xml, Utc::now()).unwrap();
        assert_eq!(report.returned_soft, 1);
        assert_eq!(report.retries_scheduled, 1);

        let invoice = fx.invoices.get(&InvoiceId::new("INV-0")).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Uncollected);
        assert!(invoice.eligible_after.is_some());
        // Soft fail never escalates
        assert!(fx.notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_record_is_an_anomaly() {
        let fx = fixture();
        let _ = submitted_batch(&fx).await;
        let xml = return_file(&[("E2E-GHOST-1", "ACSC", None)]);

        let report = fx.processor.ingest(&xml, Utc::now()).unwrap();
        assert_eq!(report.anomalies, 1);
        assert!(fx
            .events
            .events()
            .iter()
            .any(|e| matches!(e, CollectionEvent::ReconciliationAnomaly { .. })));
    }

    #[tokio::test]
    async fn test_unknown_reason_code_routes_to_manual_review() {
        let fx = fixture();
        let (_, refs) = submitted_batch(&fx).await;
        let xml = return_file(&[(&refs[0], "RJCT", Some("ZZ42"))]);

        let report = fx.processor.ingest(&xml, Utc::now()).unwrap();
        assert_eq!(report.manual_review, 1);
        assert_eq!(report.anomalies, 0);
        assert_eq!(
            fx.invoices.get(&InvoiceId::new("INV-0")).unwrap().status,
            InvoiceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_replayed_file_applies_once() {
        let fx = fixture();
        let (_, refs) = submitted_batch(&fx).await;
        let xml = return_file(&[(&refs[0], "ACSC", None)]);

        fx.processor.ingest(&xml, Utc::now()).unwrap();
        let replay = fx.processor.ingest(&xml, Utc::now()).unwrap();
        assert_eq!(replay.collected, 0);
        assert_eq!(replay.replayed, 1);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.processor.ingest("not xml at all", Utc::now()),
            Err(Error::ReturnFile(_))
        ));
    }
}
