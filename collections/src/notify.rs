//! External collaborator interfaces
//!
//! Approval, escalation and member-directory concerns live outside the
//! collection core. They are consumed through the traits here; the
//! bundled implementations cover tests and single-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use dues_core::{MemberId, RiskClass};

use crate::error::Result;

/// Escalation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational, no action required
    Info,
    /// Needs operator attention
    Warning,
    /// Requires immediate manual intervention
    Critical,
}

/// Escalation channel for exhausted retries and batch failures
pub trait Notifier: Send + Sync {
    /// Deliver one escalation
    fn notify(&self, severity: Severity, reference: &str, details: &str);
}

/// Notifier that logs through `tracing`
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, reference: &str, details: &str) {
        match severity {
            Severity::Info => tracing::info!("[{}] {}", reference, details),
            Severity::Warning => tracing::warn!("[{}] {}", reference, details),
            Severity::Critical => tracing::error!("[{}] {}", reference, details),
        }
    }
}

/// Notifier that records calls, for assertions in tests
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(Severity, String, String)>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded notifications
    pub fn calls(&self) -> Vec<(Severity, String, String)> {
        self.calls.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, severity: Severity, reference: &str, details: &str) {
        self.calls
            .lock()
            .push((severity, reference.to_string(), details.to_string()));
    }
}

/// Verdict from the approval authority
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    /// Whether the approver may approve this batch
    pub allowed: bool,

    /// Human-readable reason, set when denied
    pub reason: String,
}

/// External service answering whether a principal may approve a batch
/// of the given risk and amount
#[async_trait]
pub trait ApprovalAuthority: Send + Sync {
    /// Check approval authority for one batch
    async fn can_approve(
        &self,
        approver: &str,
        highest_risk: RiskClass,
        total_amount: Decimal,
    ) -> Result<ApprovalDecision>;
}

/// Authority that approves everything below an amount threshold
///
/// Batches at or above the threshold, or containing high-risk entries,
/// are denied unless the approver is a supervisor.
pub struct ThresholdApprovalAuthority {
    amount_threshold: Decimal,
    supervisors: Vec<String>,
}

impl ThresholdApprovalAuthority {
    /// Create an authority with the given escalation threshold
    pub fn new(amount_threshold: Decimal, supervisors: Vec<String>) -> Self {
        Self {
            amount_threshold,
            supervisors,
        }
    }
}

#[async_trait]
impl ApprovalAuthority for ThresholdApprovalAuthority {
    async fn can_approve(
        &self,
        approver: &str,
        highest_risk: RiskClass,
        total_amount: Decimal,
    ) -> Result<ApprovalDecision> {
        let needs_supervisor =
            total_amount >= self.amount_threshold || highest_risk == RiskClass::High;
        if needs_supervisor && !self.supervisors.iter().any(|s| s == approver) {
            return Ok(ApprovalDecision {
                allowed: false,
                reason: format!(
                    "Batch of {} at risk {:?} requires supervisor approval",
                    total_amount, highest_risk
                ),
            });
        }
        Ok(ApprovalDecision {
            allowed: true,
            reason: String::new(),
        })
    }
}

/// Bank account details resolved from the member directory
#[derive(Debug, Clone)]
pub struct MemberAccount {
    /// Account holder name as held by the directory
    pub name: String,

    /// Member account IBAN
    pub iban: String,

    /// Member bank BIC
    pub bic: String,
}

/// Read-only member/account directory
pub trait MemberDirectory: Send + Sync {
    /// Resolve a member to their registered account, if any
    fn resolve(&self, member: &MemberId) -> Option<MemberAccount>;
}

/// In-memory directory backed by a concurrent map
#[derive(Debug, Default)]
pub struct StaticMemberDirectory {
    accounts: DashMap<MemberId, MemberAccount>,
}

impl StaticMemberDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a member's account details
    pub fn register(&self, member: MemberId, account: MemberAccount) {
        self.accounts.insert(member, account);
    }
}

impl MemberDirectory for StaticMemberDirectory {
    fn resolve(&self, member: &MemberId) -> Option<MemberAccount> {
        self.accounts.get(member).map(|a| a.value().clone())
    }
}
