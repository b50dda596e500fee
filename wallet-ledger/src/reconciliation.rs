//! Idempotency guard for externally-triggered credits
//!
//! Webhooks and the chain monitor may deliver the same event more than once,
//! concurrently. The external reference is claimed with a pending entry before
//! the inbound leg is confirmed, so exactly one delivery confirms and credits;
//! every other delivery returns the recorded outcome. A credit whose leg is
//! still unconfirmed surfaces as `ExternalUnconfirmed` on every delivery.
//!
//! ```text
//! replayed? ──yes──▶ recorded outcome
//!    │no
//! limits ok? ──no──▶ failed entry (memo = reason)
//!    │yes
//! claim (pending) ──lost race──▶ winner's outcome
//!    │
//! InboundLeg::confirm (no locks held)
//!    ├─ confirmed ─▶ pending → completed, balance credited
//!    ├─ failed ────▶ pending → failed
//!    └─ unknown ───▶ stays pending, ExternalUnconfirmed
//! ```

use crate::config::LimitsConfig;
use crate::integration::{InboundCredit, InboundLeg, LegOutcome};
use crate::ledger::{AuditReport, Ledger};
use crate::referral::ReferralService;
use crate::types::{normalize_amount, EntryKind, EntryStatus, LedgerEntry, UserId};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Recorded outcome of an external credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditOutcome {
    Credited,
    Rejected { reason: String },
}

/// Result of processing an external credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub entry: LedgerEntry,
    pub outcome: CreditOutcome,
    /// The reference had already been processed
    pub replayed: bool,
}

impl CreditReceipt {
    /// Receipt for a settled entry; a pending one is still unconfirmed
    fn from_entry(entry: LedgerEntry, replayed: bool) -> Result<Self> {
        let outcome = match entry.status {
            EntryStatus::Completed => CreditOutcome::Credited,
            EntryStatus::Failed => CreditOutcome::Rejected {
                reason: entry.memo.clone().unwrap_or_else(|| "rejected".to_string()),
            },
            EntryStatus::Pending => {
                return Err(Error::ExternalUnconfirmed(format!(
                    "credit {} is awaiting confirmation",
                    entry.external_reference.as_deref().unwrap_or_default()
                )))
            }
        };
        Ok(Self {
            entry,
            outcome,
            replayed,
        })
    }
}

pub struct CreditGuard {
    ledger: Arc<Ledger>,
    inbound: Arc<dyn InboundLeg>,
    limits: LimitsConfig,
    referrals: Option<Arc<ReferralService>>,
}

impl CreditGuard {
    pub fn new(ledger: Arc<Ledger>, inbound: Arc<dyn InboundLeg>, limits: LimitsConfig) -> Self {
        Self {
            ledger,
            inbound,
            limits,
            referrals: None,
        }
    }

    /// Pay pending referral rewards when a credit qualifies
    pub fn with_referrals(mut self, referrals: Arc<ReferralService>) -> Self {
        self.referrals = Some(referrals);
        self
    }

    /// Apply an externally-triggered credit exactly once
    pub async fn process_external_credit(&self, credit: InboundCredit) -> Result<CreditReceipt> {
        let amount = normalize_amount(credit.amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("credit amount must be positive".to_string()));
        }
        let reference = credit.external_reference.trim().to_string();
        if reference.is_empty() {
            return Err(Error::InvalidRequest("external reference is required".to_string()));
        }
        let user = credit.user_id;

        if let Some(existing) = self.ledger.find_by_reference(&reference).await? {
            return self.replay(existing, user, amount);
        }

        if let Some(reason) = self.limit_violation(user, amount).await? {
            warn!("Rejecting credit {} of {} for user {}: {}", reference, amount, user, reason);
            return match self
                .ledger
                .record_failed(user, amount, EntryKind::Deposit, &reference, &reason)
                .await
            {
                Ok(entry) => CreditReceipt::from_entry(entry, false),
                Err(Error::DuplicateReference(_)) => {
                    self.replay_winner(&reference, user, amount).await
                }
                Err(e) => Err(e),
            };
        }

        match self
            .ledger
            .claim_pending(user, amount, EntryKind::Deposit, &reference)
            .await
        {
            Ok(_) => {}
            Err(Error::DuplicateReference(_)) => {
                return self.replay_winner(&reference, user, amount).await
            }
            Err(e) => return Err(e),
        }

        // the claim is committed: no lock is held while the leg is confirmed
        let outcome = match self.inbound.confirm(&credit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Inbound confirmation for {} errored: {}", reference, e);
                LegOutcome::Unknown
            }
        };

        self.finalize(&reference, outcome).await
    }

    /// Settle a pending claim once reconciliation learns the leg's outcome
    ///
    /// `Unknown` leaves the claim pending and reports `ExternalUnconfirmed`.
    pub async fn resolve_pending_credit(
        &self,
        reference: &str,
        outcome: LegOutcome,
    ) -> Result<CreditReceipt> {
        self.finalize(reference, outcome).await
    }

    async fn finalize(&self, reference: &str, outcome: LegOutcome) -> Result<CreditReceipt> {
        let entry = match outcome {
            LegOutcome::Confirmed { external_id } => {
                let entry = self
                    .ledger
                    .settle_pending(reference, EntryStatus::Completed, None)
                    .await?;
                info!(
                    "Credited {} to user {} for {} ({})",
                    entry.amount, entry.user_id, reference, external_id
                );
                self.after_credit(&entry).await;
                entry
            }
            LegOutcome::Failed { reason } => {
                self.ledger
                    .settle_pending(reference, EntryStatus::Failed, Some(&reason))
                    .await?
            }
            LegOutcome::Unknown => self
                .ledger
                .find_by_reference(reference)
                .await?
                .ok_or_else(|| Error::NotFound(format!("entry with reference {}", reference)))?,
        };
        CreditReceipt::from_entry(entry, false)
    }

    async fn after_credit(&self, entry: &LedgerEntry) {
        if let Some(referrals) = &self.referrals {
            if let Err(e) = referrals.on_deposit(entry.user_id, entry.amount).await {
                warn!("Referral payout after credit {} failed: {}", entry.id, e);
            }
        }
    }

    fn replay(&self, existing: LedgerEntry, user: UserId, amount: Decimal) -> Result<CreditReceipt> {
        let reference = existing.external_reference.clone().unwrap_or_default();
        if !existing.matches(user, amount, EntryKind::Deposit) {
            warn!(
                "Reference {} reused: recorded {} for user {}, delivered {} for user {}",
                reference, existing.amount, existing.user_id, amount, user
            );
            return Err(Error::DuplicateReference(reference));
        }
        self.ledger.metrics().record_replay();
        info!(
            "Reference {} already processed ({})",
            reference,
            existing.status.as_str()
        );
        CreditReceipt::from_entry(existing, true)
    }

    async fn replay_winner(
        &self,
        reference: &str,
        user: UserId,
        amount: Decimal,
    ) -> Result<CreditReceipt> {
        let winner = self
            .ledger
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| Error::Internal(format!("reference {} vanished", reference)))?;
        self.replay(winner, user, amount)
    }

    /// Reason the credit breaks a limit, if it does
    ///
    /// The cumulative check reads committed deposits without a lock; two
    /// concurrent credits can together overshoot the per-user limit.
    async fn limit_violation(&self, user: UserId, amount: Decimal) -> Result<Option<String>> {
        if amount > self.limits.max_per_transaction {
            return Ok(Some(format!(
                "exceeds per-transaction limit of {}",
                self.limits.max_per_transaction
            )));
        }
        let deposited = self
            .ledger
            .store()
            .completed_sum(user, Some(EntryKind::Deposit))
            .await?;
        if deposited + amount > self.limits.max_per_user {
            return Ok(Some(format!(
                "exceeds per-user limit of {} (deposited {})",
                self.limits.max_per_user, deposited
            )));
        }
        Ok(None)
    }

    /// Balance vs. ledger for one user
    pub async fn audit_user(&self, user: UserId) -> Result<AuditReport> {
        self.ledger.audit(user).await
    }

    /// Users among `users` whose balance disagrees with their ledger
    pub async fn audit_users(&self, users: &[UserId]) -> Result<Vec<AuditReport>> {
        let mut drifted = Vec::new();
        for user in users {
            let report = self.ledger.audit(*user).await?;
            if !report.is_consistent() {
                drifted.push(report);
            }
        }
        Ok(drifted)
    }

    /// Audit every user holding a balance
    pub async fn audit_all(&self) -> Result<Vec<AuditReport>> {
        self.ledger.audit_all().await
    }
}
