//! Mutation engine
//!
//! Every change to a balance goes through this module. A mutation lock-reads
//! the balance, validates the delta, writes the new balance and appends the
//! matching ledger entry inside one unit of work. Stores only accept balance
//! and entry writes accompanied by a [`WriteGrant`], and the grant can only be
//! constructed here.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_decimal::Decimal;
//! use wallet_ledger::{Ledger, MemoryStore, Metrics, SystemClock, Config};
//! use wallet_ledger::types::{EntryKind, UserId};
//!
//! #[tokio::main]
//! async fn main() -> wallet_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(SystemClock),
//!         Metrics::new()?,
//!         &config.ledger,
//!     );
//!
//!     let user = UserId::generate();
//!     ledger.open_account(user).await?;
//!     ledger
//!         .apply_delta(user, Decimal::from(100), EntryKind::Deposit, Some("TX1"))
//!         .await?;
//!     Ok(())
//! }
//! ```

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::metrics::Metrics;
use crate::store::{Store, UnitOfWork};
use crate::types::{normalize_amount, Balance, EntryKind, EntryStatus, LedgerEntry, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capability required by the store's balance and entry writes
///
/// Only the mutation engine can construct one.
#[derive(Debug)]
pub struct WriteGrant {
    _sealed: (),
}

impl WriteGrant {
    fn new() -> Self {
        Self { _sealed: () }
    }
}

#[cfg(test)]
pub(crate) fn test_grant() -> &'static WriteGrant {
    static GRANT: WriteGrant = WriteGrant { _sealed: () };
    &GRANT
}

/// Balance vs. ledger comparison for one user
#[derive(Debug, Clone, PartialEq)]
pub struct AuditReport {
    /// Audited user
    pub user_id: UserId,
    /// Stored balance
    pub balance: Decimal,
    /// Sum of completed entries
    pub ledger_sum: Decimal,
}

impl AuditReport {
    /// Balance minus ledger sum
    pub fn discrepancy(&self) -> Decimal {
        self.balance - self.ledger_sum
    }

    /// Whether the balance matches the ledger
    pub fn is_consistent(&self) -> bool {
        self.discrepancy().is_zero()
    }
}

/// Main ledger interface
pub struct Ledger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    busy_retries: u32,
    busy_retry_delay: Duration,
}

impl Ledger {
    /// Build a ledger over a store
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            busy_retries: config.busy_retries,
            busy_retry_delay: Duration::from_millis(config.busy_retry_delay_ms),
        }
    }

    /// Underlying store, for committed reads
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Current time from the injected clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Create a zero balance for a user (idempotent)
    pub async fn open_account(&self, user: UserId) -> Result<Balance> {
        let balance = self.store.create_balance(user, self.now()).await?;
        debug!("Opened balance for user {}", user);
        Ok(balance)
    }

    /// Committed balance of a user
    pub async fn get_balance(&self, user: UserId) -> Result<Decimal> {
        self.store
            .get_balance(user)
            .await?
            .map(|b| b.amount)
            .ok_or_else(|| Error::NotFound(format!("balance for user {}", user)))
    }

    /// Open a unit of work for a multi-step mutation
    pub async fn begin(&self) -> Result<LedgerTx> {
        let uow = self.store.begin().await?;
        Ok(LedgerTx {
            uow,
            grant: WriteGrant::new(),
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            started: Instant::now(),
            mutations: 0,
        })
    }

    /// Entry recorded under an external reference
    pub async fn find_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>> {
        self.store.find_entry_by_reference(reference).await
    }

    /// Most recent entries of a user
    pub async fn history(&self, user: UserId, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.store.entries_for_user(user, limit).await
    }

    /// Compare a user's balance with the sum of their completed entries
    pub async fn audit(&self, user: UserId) -> Result<AuditReport> {
        let balance = self.get_balance(user).await?;
        let ledger_sum = self.store.completed_sum(user, None).await?;
        let report = AuditReport {
            user_id: user,
            balance,
            ledger_sum,
        };
        if !report.is_consistent() {
            warn!(
                "Balance drift for user {}: balance {} vs ledger {}",
                user, balance, ledger_sum
            );
        }
        Ok(report)
    }

    /// Audit every user holding a balance; returns the drifted ones
    pub async fn audit_all(&self) -> Result<Vec<AuditReport>> {
        let users = self.store.user_ids().await?;
        let mut drifted = Vec::new();
        for user in &users {
            let report = self.audit(*user).await?;
            if !report.is_consistent() {
                drifted.push(report);
            }
        }
        info!("Audited {} users, {} with drift", users.len(), drifted.len());
        Ok(drifted)
    }

    /// Run a unit of work, retrying it when a row lock times out
    pub async fn with_busy_retry<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(Error::Busy(reason)) => {
                    self.metrics.record_busy();
                    if attempt >= self.busy_retries {
                        warn!("{} still busy after {} retries: {}", operation_name, attempt, reason);
                        return Err(Error::Busy(reason));
                    }
                    attempt += 1;
                    let delay = self.retry_delay();
                    warn!(
                        "Retry attempt {}/{} for {} after {:?}",
                        attempt, self.busy_retries, operation_name, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        // +/-10% jitter
        let base = self.busy_retry_delay.as_millis() as f64;
        let jitter = (rand::random::<f64>() - 0.5) * base * 0.2;
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }

    /// Apply a signed delta to a user's balance in its own unit of work
    ///
    /// With an external reference the call is idempotent: a completed entry
    /// already recorded under the reference for the same user, amount and
    /// kind is returned unchanged. Any other recorded entry fails with
    /// `DuplicateReference`.
    pub async fn apply_delta(
        &self,
        user: UserId,
        delta: Decimal,
        kind: EntryKind,
        reference: Option<&str>,
    ) -> Result<LedgerEntry> {
        if normalize_amount(delta).is_zero() {
            return Err(Error::InvalidAmount("delta must be non-zero".to_string()));
        }

        if let Some(reference) = reference {
            if let Some(existing) = self.store.find_entry_by_reference(reference).await? {
                return self.replay(existing, user, delta, kind);
            }
        }

        let result = self
            .with_busy_retry("apply_delta", move || async move {
                let mut tx = self.begin().await?;
                let entry = tx.apply_delta(user, delta, kind, reference, None).await?;
                tx.commit().await?;
                Ok(entry)
            })
            .await;

        match (result, reference) {
            (Err(Error::DuplicateReference(_)), Some(reference)) => {
                // Lost a race on the same reference: the winner's entry is the outcome
                let winner = self
                    .store
                    .find_entry_by_reference(reference)
                    .await?
                    .ok_or_else(|| Error::Internal(format!("reference {} vanished", reference)))?;
                self.replay(winner, user, delta, kind)
            }
            (other, _) => other,
        }
    }

    fn replay(
        &self,
        existing: LedgerEntry,
        user: UserId,
        delta: Decimal,
        kind: EntryKind,
    ) -> Result<LedgerEntry> {
        let reference = existing.external_reference.clone().unwrap_or_default();
        if !existing.matches(user, delta, kind) {
            warn!(
                "Reference {} reused: recorded {} {} for user {}, requested {} {} for user {}",
                reference, existing.kind, existing.amount, existing.user_id, kind, delta, user
            );
            return Err(Error::DuplicateReference(reference));
        }
        if existing.is_completed() {
            self.metrics.record_replay();
            info!("Replayed reference {} for user {}", reference, existing.user_id);
            Ok(existing)
        } else {
            Err(Error::DuplicateReference(reference))
        }
    }

    /// Claim an external reference with a pending entry; the balance is untouched
    pub async fn claim_pending(
        &self,
        user: UserId,
        amount: Decimal,
        kind: EntryKind,
        reference: &str,
    ) -> Result<LedgerEntry> {
        self.insert_unapplied(user, amount, kind, reference, EntryStatus::Pending, None)
            .await
    }

    /// Record a rejected external event for audit; the balance is untouched
    pub async fn record_failed(
        &self,
        user: UserId,
        amount: Decimal,
        kind: EntryKind,
        reference: &str,
        memo: &str,
    ) -> Result<LedgerEntry> {
        self.insert_unapplied(user, amount, kind, reference, EntryStatus::Failed, Some(memo))
            .await
    }

    async fn insert_unapplied(
        &self,
        user: UserId,
        amount: Decimal,
        kind: EntryKind,
        reference: &str,
        status: EntryStatus,
        memo: Option<&str>,
    ) -> Result<LedgerEntry> {
        let amount = normalize_amount(amount);
        if amount.is_zero() {
            return Err(Error::InvalidAmount("amount must be non-zero".to_string()));
        }
        if self.store.get_balance(user).await?.is_none() {
            return Err(Error::NotFound(format!("balance for user {}", user)));
        }

        let grant = WriteGrant::new();
        let mut entry = LedgerEntry::new(user, kind, amount, status, self.now())
            .with_reference(Some(reference));
        if let Some(memo) = memo {
            entry = entry.with_memo(memo);
        }

        let mut uow = self.store.begin().await?;
        uow.insert_entry(&grant, &entry).await?;
        uow.commit().await?;

        info!(
            "Recorded {} {} entry {} for user {} under reference {}",
            status.as_str(),
            kind,
            entry.id,
            user,
            reference
        );
        Ok(entry)
    }

    /// Finalize a pending entry as completed (crediting the balance) or failed
    ///
    /// An entry that is no longer pending is returned unchanged.
    pub async fn settle_pending(
        &self,
        reference: &str,
        status: EntryStatus,
        memo: Option<&str>,
    ) -> Result<LedgerEntry> {
        if status == EntryStatus::Pending {
            return Err(Error::InvalidRequest("pending is not a final status".to_string()));
        }

        let owner = self
            .store
            .find_entry_by_reference(reference)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry with reference {}", reference)))?
            .user_id;

        self.with_busy_retry("settle_pending", move || async move {
            let mut tx = self.begin().await?;
            // balance row before entry row, same order as every other mutation
            tx.lock_and_get_balance(owner).await?;
            let entry = tx
                .rows()
                .lock_entry_by_reference(reference)
                .await?
                .ok_or_else(|| Error::NotFound(format!("entry with reference {}", reference)))?;

            if entry.status != EntryStatus::Pending {
                tx.rollback().await?;
                return Ok(entry);
            }

            let settled = tx.finalize_pending(&entry, status, memo).await?;
            tx.commit().await?;
            info!(
                "Settled reference {} as {} for user {}",
                reference,
                status.as_str(),
                settled.user_id
            );
            Ok(settled)
        })
        .await
    }
}

/// Unit of work handed to feature modules
///
/// Dropping it without [`commit`](LedgerTx::commit) rolls everything back.
pub struct LedgerTx {
    uow: Box<dyn UnitOfWork>,
    grant: WriteGrant,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    started: Instant,
    mutations: u32,
}

impl LedgerTx {
    /// Lock a user's balance row and read it
    pub async fn lock_and_get_balance(&mut self, user: UserId) -> Result<Decimal> {
        Ok(self.uow.lock_balance(user).await?.amount)
    }

    /// Apply a delta without committing
    pub async fn apply_delta(
        &mut self,
        user: UserId,
        delta: Decimal,
        kind: EntryKind,
        reference: Option<&str>,
        account_id: Option<Uuid>,
    ) -> Result<LedgerEntry> {
        let delta = normalize_amount(delta);
        if delta.is_zero() {
            return Err(Error::InvalidAmount("delta must be non-zero".to_string()));
        }

        let balance = self.uow.lock_balance(user).await?;
        let new_amount = balance.amount + delta;
        if new_amount < Decimal::ZERO {
            self.metrics.record_insufficient_funds();
            debug!(
                "Rejected {} of {} for user {}: balance {}",
                kind, delta, user, balance.amount
            );
            return Err(Error::InsufficientFunds {
                required: -delta,
                available: balance.amount,
            });
        }

        let now = self.clock.now();
        let entry = LedgerEntry::new(user, kind, delta, EntryStatus::Completed, now)
            .with_reference(reference)
            .with_account(account_id);

        self.uow.write_balance(&self.grant, user, new_amount, now).await?;
        self.uow.insert_entry(&self.grant, &entry).await?;
        self.mutations += 1;

        debug!(
            "Applied {} {} to user {}: {} -> {}",
            kind, delta, user, balance.amount, new_amount
        );
        Ok(entry)
    }

    /// Finalize a locked pending entry, crediting its amount when completed
    async fn finalize_pending(
        &mut self,
        entry: &LedgerEntry,
        status: EntryStatus,
        memo: Option<&str>,
    ) -> Result<LedgerEntry> {
        if status == EntryStatus::Completed {
            let balance = self.uow.lock_balance(entry.user_id).await?;
            let new_amount = balance.amount + entry.amount;
            if new_amount < Decimal::ZERO {
                self.metrics.record_insufficient_funds();
                return Err(Error::InsufficientFunds {
                    required: -entry.amount,
                    available: balance.amount,
                });
            }
            self.uow
                .write_balance(&self.grant, entry.user_id, new_amount, self.clock.now())
                .await?;
            self.mutations += 1;
        }

        self.uow
            .finalize_entry(&self.grant, entry.id, status, memo)
            .await?;

        let mut settled = entry.clone();
        settled.status = status;
        if let Some(memo) = memo {
            settled.memo = Some(memo.to_string());
        }
        Ok(settled)
    }

    /// Feature rows of this unit of work
    pub fn rows(&mut self) -> &mut dyn UnitOfWork {
        self.uow.as_mut()
    }

    /// Current time from the ledger clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Commit every write made through this unit
    pub async fn commit(self) -> Result<()> {
        let mutations = self.mutations;
        let elapsed = self.started.elapsed().as_secs_f64();
        let metrics = self.metrics.clone();
        self.uow.commit().await?;
        if mutations > 0 {
            metrics.record_mutation(mutations, elapsed);
        }
        Ok(())
    }

    /// Discard every write made through this unit
    pub async fn rollback(self) -> Result<()> {
        self.uow.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{funded_user, test_ledger};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_apply_delta_updates_balance_and_log() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(100)).await;

        let entry = ledger
            .apply_delta(user, dec!(-40), EntryKind::Withdrawal, None)
            .await
            .unwrap();

        assert_eq!(entry.amount, dec!(-40));
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(60));
        assert!(ledger.audit(user).await.unwrap().is_consistent());
        assert_eq!(ledger.metrics().mutations_total.get(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balance_unchanged() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(10)).await;

        let err = ledger
            .apply_delta(user, dec!(-10.01), EntryKind::Withdrawal, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(10));
        assert_eq!(ledger.history(user, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_delta_rejected() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(10)).await;

        let err = ledger
            .apply_delta(user, Decimal::ZERO, EntryKind::Deposit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_unknown_user_not_found() {
        let (ledger, _clock) = test_ledger();
        let err = ledger
            .apply_delta(UserId::generate(), dec!(5), EntryKind::Deposit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(matches!(
            ledger.get_balance(UserId::generate()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_same_reference_credits_once() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(0)).await;

        let first = ledger
            .apply_delta(user, dec!(25), EntryKind::Deposit, Some("TX-1"))
            .await
            .unwrap();
        let second = ledger
            .apply_delta(user, dec!(25), EntryKind::Deposit, Some("TX-1"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(25));
        assert_eq!(ledger.metrics().replays_total.get(), 1);
    }

    #[tokio::test]
    async fn test_reused_reference_for_other_request_rejected() {
        let (ledger, _clock) = test_ledger();
        let a = funded_user(&ledger, dec!(0)).await;
        let b = funded_user(&ledger, dec!(0)).await;

        ledger
            .apply_delta(a, dec!(100), EntryKind::Deposit, Some("TX-X"))
            .await
            .unwrap();

        let other_user = ledger
            .apply_delta(b, dec!(999), EntryKind::Deposit, Some("TX-X"))
            .await
            .unwrap_err();
        let other_amount = ledger
            .apply_delta(a, dec!(99), EntryKind::Deposit, Some("TX-X"))
            .await
            .unwrap_err();
        let other_kind = ledger
            .apply_delta(a, dec!(100), EntryKind::Reversal, Some("TX-X"))
            .await
            .unwrap_err();

        assert!(matches!(other_user, Error::DuplicateReference(_)));
        assert!(matches!(other_amount, Error::DuplicateReference(_)));
        assert!(matches!(other_kind, Error::DuplicateReference(_)));
        assert_eq!(ledger.get_balance(a).await.unwrap(), dec!(100));
        assert_eq!(ledger.get_balance(b).await.unwrap(), Decimal::ZERO);
        assert_eq!(ledger.metrics().replays_total.get(), 0);
    }

    #[tokio::test]
    async fn test_multi_step_commit_observed_once() {
        let (ledger, _clock) = test_ledger();
        let a = funded_user(&ledger, dec!(10)).await;
        let b = funded_user(&ledger, dec!(0)).await;
        let before = ledger.metrics().mutation_duration.get_sample_count();

        let mut tx = ledger.begin().await.unwrap();
        tx.apply_delta(a, dec!(-4), EntryKind::P2pSent, None, None)
            .await
            .unwrap();
        tx.apply_delta(b, dec!(4), EntryKind::P2pReceived, None, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(ledger.metrics().mutation_duration.get_sample_count(), before + 1);
        assert_eq!(ledger.metrics().mutations_total.get(), 3);
    }

    #[tokio::test]
    async fn test_pending_reference_is_duplicate() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(0)).await;

        ledger
            .claim_pending(user, dec!(5), EntryKind::Deposit, "TX-P")
            .await
            .unwrap();
        let err = ledger
            .apply_delta(user, dec!(5), EntryKind::Deposit, Some("TX-P"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReference(_)));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_settle_pending_credits_once() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(0)).await;

        ledger
            .claim_pending(user, dec!(12.5), EntryKind::Deposit, "TX-S")
            .await
            .unwrap();
        let settled = ledger
            .settle_pending("TX-S", EntryStatus::Completed, None)
            .await
            .unwrap();
        let again = ledger
            .settle_pending("TX-S", EntryStatus::Failed, Some("late failure"))
            .await
            .unwrap();

        assert_eq!(settled.status, EntryStatus::Completed);
        assert_eq!(again.status, EntryStatus::Completed);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(12.5));
        assert!(ledger.audit(user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_failed_entry_keeps_balance() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(3)).await;

        let entry = ledger
            .record_failed(user, dec!(900000), EntryKind::Deposit, "TX-F", "limit exceeded")
            .await
            .unwrap();

        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.memo.as_deref(), Some("limit exceeded"));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(3));
        assert!(ledger.audit(user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_dropped_tx_rolls_back() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(50)).await;

        {
            let mut tx = ledger.begin().await.unwrap();
            tx.apply_delta(user, dec!(-20), EntryKind::TradeBuy, None, None)
                .await
                .unwrap();
            assert_eq!(tx.lock_and_get_balance(user).await.unwrap(), dec!(30));
        }

        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(50));
        assert_eq!(ledger.history(user, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_debits_exactly_one_wins() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(30)).await;

        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .apply_delta(user, dec!(-30), EntryKind::Withdrawal, None)
                    .await
            })
        };
        let b = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .apply_delta(user, dec!(-30), EntryKind::Withdrawal, None)
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(Error::InsufficientFunds { .. })))
            .count();

        assert_eq!(ok, 1);
        assert_eq!(insufficient, 1);
        assert_eq!(ledger.get_balance(user).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_busy_retry_gives_up_after_budget() {
        let (ledger, _clock) = test_ledger();
        let mut calls = 0;

        let result: Result<()> = ledger
            .with_busy_retry("always_busy", || {
                calls += 1;
                async { Err(Error::Busy("row".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Busy(_))));
        assert_eq!(calls, 2);
        assert_eq!(ledger.metrics().busy_total.get(), 2);
    }
}
