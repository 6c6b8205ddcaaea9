//! Mandate store
//!
//! Holds standing authorizations and owns their lifecycle: supersede on
//! duplicate capture, first-use/recurring sequence tracking, and the
//! inactivity expiry sweep. Mandates are never deleted, only
//! status-transitioned.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

use crate::config::MandateConfig;
use crate::error::{Error, Result};
use crate::types::{
    Bic, Iban, Mandate, MandateId, MandateStatus, MemberId, SequenceState,
};

/// Request to capture a new mandate
#[derive(Debug, Clone)]
pub struct NewMandate {
    /// Mandate id (pattern-validated by `MandateId::parse`)
    pub id: MandateId,

    /// Owning member
    pub member: MemberId,

    /// Debtor account
    pub iban: Iban,

    /// Debtor agent
    pub bic: Bic,

    /// Signature date
    pub signed_at: NaiveDate,
}

/// Outcome of an inactivity sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Mandates expired during this sweep
    pub expired: Vec<MandateId>,

    /// Active mandates inside the pre-expiry notice window
    pub expiring_soon: Vec<(MandateId, DateTime<Utc>)>,
}

/// In-memory mandate store with versioned compare-and-set transitions
///
/// `DashMap` serializes writers per key; the version counter makes stale
/// writes detectable for callers that read, decide, then write.
pub struct MandateStore {
    mandates: DashMap<MandateId, Mandate>,

    /// Active mandate per (member, account); superseded on re-capture
    active_index: DashMap<(MemberId, Iban), MandateId>,
}

impl MandateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            mandates: DashMap::new(),
            active_index: DashMap::new(),
        }
    }

    /// Capture a new mandate and activate it
    ///
    /// Fails with `DuplicateMandate` if an `Active` mandate already exists
    /// for the same (member, account) unless `supersede` is set, in which
    /// case the prior mandate transitions to `Cancelled` first.
    pub fn create(&self, new: NewMandate, supersede: bool) -> Result<Mandate> {
        if self.mandates.contains_key(&new.id) {
            return Err(Error::DuplicateMandate(format!(
                "Mandate id {} already exists",
                new.id
            )));
        }

        let key = (new.member.clone(), new.iban.clone());
        if let Some(existing_id) = self.active_index.get(&key).map(|r| r.value().clone()) {
            let existing_active = self
                .mandates
                .get(&existing_id)
                .map(|m| m.status == MandateStatus::Active)
                .unwrap_or(false);

            if existing_active {
                if !supersede {
                    return Err(Error::DuplicateMandate(format!(
                        "Active mandate {} already covers {} / {}",
                        existing_id, new.member, new.iban
                    )));
                }
                self.transition(&existing_id, MandateStatus::Cancelled)?;
                tracing::info!("Superseded mandate {} for member {}", existing_id, new.member);
            }
        }

        let mandate = Mandate {
            id: new.id.clone(),
            member: new.member,
            iban: new.iban,
            bic: new.bic,
            sequence_state: SequenceState::FirstUsePending,
            status: MandateStatus::Active,
            signed_at: new.signed_at,
            last_used_at: None,
            created_at: Utc::now(),
            version: 0,
            applied_attempts: HashSet::new(),
        };

        self.active_index.insert(key, new.id);
        self.mandates.insert(mandate.id.clone(), mandate.clone());
        Ok(mandate)
    }

    /// Look up a mandate
    pub fn get(&self, id: &MandateId) -> Result<Mandate> {
        self.mandates
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| Error::NotFound(format!("Mandate {}", id)))
    }

    /// Current status of a mandate
    pub fn validate(&self, id: &MandateId) -> Result<MandateStatus> {
        Ok(self.get(id)?.status)
    }

    /// Transition a mandate's status, enforcing the state machine
    ///
    /// The per-key write lock makes this a single-writer compare-and-set:
    /// the transition is checked against the live status, not a stale
    /// snapshot.
    pub fn transition(&self, id: &MandateId, next: MandateStatus) -> Result<MandateStatus> {
        let mut entry = self
            .mandates
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Mandate {}", id)))?;

        if !entry.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: format!("mandate {}", id),
                from: entry.status.to_string(),
                to: next.to_string(),
            });
        }

        entry.status = next;
        entry.version += 1;
        Ok(next)
    }

    /// Record the outcome of a collection attempt against this mandate
    ///
    /// On first success the sequence state flips `FirstUsePending ->
    /// Recurring`. Idempotent per attempt id: replaying the same return
    /// record is a no-op.
    pub fn mark_used(&self, id: &MandateId, attempt_id: Uuid, success: bool) -> Result<()> {
        let mut entry = self
            .mandates
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Mandate {}", id)))?;

        if entry.applied_attempts.contains(&attempt_id) {
            tracing::debug!("mark_used replay for mandate {} attempt {}", id, attempt_id);
            return Ok(());
        }

        entry.applied_attempts.insert(attempt_id);
        entry.last_used_at = Some(Utc::now());
        if success && entry.sequence_state == SequenceState::FirstUsePending {
            entry.sequence_state = SequenceState::Recurring;
            tracing::info!("Mandate {} is now recurring", id);
        }
        entry.version += 1;
        Ok(())
    }

    /// Expire mandates unused for the configured inactivity window and
    /// report mandates inside the pre-expiry notice window
    pub fn sweep(&self, as_of: DateTime<Utc>, config: &MandateConfig) -> SweepReport {
        let expiry_window = Duration::days(config.inactivity_expiry_months as i64 * 30);
        let notice_window =
            expiry_window - Duration::days(config.pre_expiry_notice_months as i64 * 30);

        let mut report = SweepReport::default();

        let candidates: Vec<MandateId> = self
            .mandates
            .iter()
            .filter(|m| m.status == MandateStatus::Active)
            .map(|m| m.id.clone())
            .collect();

        for id in candidates {
            let Some(entry) = self.mandates.get(&id) else { continue };
            let reference = entry
                .last_used_at
                .unwrap_or_else(|| {
                    DateTime::from_naive_utc_and_offset(
                        entry.signed_at.and_hms_opt(0, 0, 0).unwrap_or_default(),
                        Utc,
                    )
                });
            let idle = as_of - reference;
            drop(entry);

            if idle >= expiry_window {
                if self.transition(&id, MandateStatus::Expired).is_ok() {
                    tracing::info!("Mandate {} expired after inactivity", id);
                    report.expired.push(id);
                }
            } else if idle >= notice_window {
                let expires_at = as_of + (expiry_window - idle);
                report.expiring_soon.push((id, expires_at));
            }
        }

        report
    }

    /// Active mandate for a member/account pair, if any
    pub fn active_for(&self, member: &MemberId, iban: &Iban) -> Option<Mandate> {
        let id = self
            .active_index
            .get(&(member.clone(), iban.clone()))
            .map(|r| r.value().clone())?;
        self.mandates
            .get(&id)
            .filter(|m| m.status == MandateStatus::Active)
            .map(|m| m.clone())
    }

    /// Active mandate for a member (one account per member in practice)
    pub fn active_for_member(&self, member: &MemberId) -> Option<Mandate> {
        self.mandates
            .iter()
            .find(|m| &m.member == member && m.status == MandateStatus::Active)
            .map(|m| m.clone())
    }

    /// Number of mandates held (all statuses)
    pub fn len(&self) -> usize {
        self.mandates.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.mandates.is_empty()
    }
}

impl Default for MandateStore {
    fn default() -> Self {
        Self::new()
    }
}
