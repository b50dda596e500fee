//! Time-locked deposits
//!
//! Principal is debited at creation and returned with interest once the lock
//! matures. Interest is simple interest over the whole calendar term:
//! `principal × apy/100 × days/365`, with `days` the whole days between start
//! and maturity, rounded to the asset scale.

use super::{AccountState, FeatureAccount};
use crate::config::{LockTier, LockedConfig};
use crate::integration::{Notification, NotificationKind, Notifier};
use crate::ledger::{Ledger, LedgerTx};
use crate::types::{normalize_amount, EntryKind, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const DAYS_PER_YEAR: i64 = 365;

/// Simple interest earned between `start` and `end`, counting whole days
pub fn lock_interest(
    principal: Decimal,
    apy: Decimal,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Decimal {
    let days = (end - start).num_days().max(0);
    normalize_amount(
        principal * apy / Decimal::ONE_HUNDRED * Decimal::from(days) / Decimal::from(DAYS_PER_YEAR),
    )
}

/// Locked deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedDeposit {
    pub id: Uuid,
    pub user_id: UserId,
    pub principal: Decimal,
    /// Percent
    pub apy: Decimal,
    pub duration_days: u32,
    pub start_at: DateTime<Utc>,
    pub maturity_at: DateTime<Utc>,
    pub auto_renew: bool,
    /// Interest paid out at withdrawal
    pub interest_earned: Decimal,
    pub state: AccountState,
    /// Lock this one was rolled over from
    pub renewed_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockedDeposit {
    pub fn is_matured(&self, now: DateTime<Utc>) -> bool {
        now >= self.maturity_at
    }

    /// Interest for the full term
    pub fn interest_at_maturity(&self) -> Decimal {
        lock_interest(self.principal, self.apy, self.start_at, self.maturity_at)
    }

    /// Copy with the state reported as of `now`
    pub fn as_of(&self, now: DateTime<Utc>) -> Self {
        let mut view = self.clone();
        view.state = self.state(now);
        view
    }
}

impl FeatureAccount for LockedDeposit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn owner(&self) -> UserId {
        self.user_id
    }

    fn principal(&self) -> Decimal {
        if self.state == AccountState::Withdrawn {
            Decimal::ZERO
        } else {
            self.principal
        }
    }

    fn accrued(&self, now: DateTime<Utc>) -> Decimal {
        if self.state == AccountState::Withdrawn {
            return self.interest_earned;
        }
        let end = now.min(self.maturity_at);
        lock_interest(self.principal, self.apy, self.start_at, end)
    }

    fn state(&self, now: DateTime<Utc>) -> AccountState {
        match self.state {
            AccountState::Active if self.is_matured(now) => AccountState::Completed,
            state => state,
        }
    }
}

/// Outcome of one maturity sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaturityReport {
    pub completed: usize,
    pub renewed: usize,
    pub failed: usize,
}

/// Locked deposit operations
pub struct LockedService {
    ledger: Arc<Ledger>,
    notifier: Arc<dyn Notifier>,
    config: LockedConfig,
}

impl LockedService {
    pub fn new(ledger: Arc<Ledger>, notifier: Arc<dyn Notifier>, config: LockedConfig) -> Self {
        Self {
            ledger,
            notifier,
            config,
        }
    }

    /// Offered durations and APYs
    pub fn tiers(&self) -> Vec<LockTier> {
        self.config.tiers.clone()
    }

    /// Lock part of the balance for one of the offered durations
    pub async fn create_lock(
        &self,
        user: UserId,
        amount: Decimal,
        days: u32,
        auto_renew: bool,
    ) -> Result<LockedDeposit> {
        let amount = normalize_amount(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("lock amount must be positive".to_string()));
        }
        let tier = self.config.tier(days).ok_or_else(|| {
            let offered: Vec<String> = self.config.tiers.iter().map(|t| t.days.to_string()).collect();
            Error::InvalidRequest(format!(
                "lock duration must be one of {} days",
                offered.join("/")
            ))
        })?;

        let lock = self
            .ledger
            .with_busy_retry("create_lock", move || async move {
                let mut tx = self.ledger.begin().await?;
                let lock = open_lock(&mut tx, user, amount, tier, auto_renew, None).await?;
                tx.commit().await?;
                Ok(lock)
            })
            .await?;

        info!(
            "Locked {} for user {} for {} days at {}% (lock {}, matures {})",
            amount, user, days, tier.apy, lock.id, lock.maturity_at
        );
        Ok(lock)
    }

    /// Locks of a user, with states reported as of now
    pub async fn locks(&self, user: UserId) -> Result<Vec<LockedDeposit>> {
        let now = self.ledger.now();
        Ok(self
            .ledger
            .store()
            .locked_deposits_for_user(user)
            .await?
            .into_iter()
            .map(|lock| lock.as_of(now))
            .collect())
    }

    /// One lock of a user, state reported as of now
    pub async fn lock(&self, user: UserId, lock_id: Uuid) -> Result<LockedDeposit> {
        match self.ledger.store().get_locked_deposit(lock_id).await? {
            Some(lock) if lock.user_id == user => Ok(lock.as_of(self.ledger.now())),
            _ => Err(Error::NotFound(format!("locked deposit {}", lock_id))),
        }
    }

    /// Return a matured lock's principal plus interest to the balance
    pub async fn withdraw(&self, user: UserId, lock_id: Uuid) -> Result<LockedDeposit> {
        self.lock(user, lock_id).await?;

        let lock = self
            .ledger
            .with_busy_retry("withdraw_lock", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(user).await?;
                let mut lock = tx.rows().lock_locked_deposit(lock_id).await?;
                if lock.user_id != user {
                    return Err(Error::NotFound(format!("locked deposit {}", lock_id)));
                }
                close_lock(&mut tx, &mut lock).await?;
                tx.commit().await?;
                Ok(lock)
            })
            .await?;

        info!(
            "Withdrew lock {} for user {}: principal {} + interest {}",
            lock.id, user, lock.principal, lock.interest_earned
        );
        Ok(lock)
    }

    /// Mark matured locks completed and roll over the auto-renewing ones
    ///
    /// A rollover pays the interest to the balance and re-locks the principal
    /// for the same term in one unit of work.
    pub async fn process_matured(&self) -> Result<MaturityReport> {
        let now = self.ledger.now();
        let mut report = MaturityReport::default();

        for lock in self.ledger.store().matured_locked_deposits(now).await? {
            let outcome = if lock.auto_renew {
                self.renew(&lock).await.map(|_| true)
            } else {
                self.complete(&lock).await.map(|_| false)
            };

            match outcome {
                Ok(renewed) => {
                    if renewed {
                        report.renewed += 1;
                    } else {
                        report.completed += 1;
                    }
                    self.notify_matured(&lock, renewed).await;
                }
                Err(e) => {
                    warn!("Processing matured lock {} failed: {}", lock.id, e);
                    report.failed += 1;
                }
            }
        }

        if report != MaturityReport::default() {
            info!(
                "Maturity sweep: {} completed, {} renewed, {} failed",
                report.completed, report.renewed, report.failed
            );
        }
        Ok(report)
    }

    async fn complete(&self, matured: &LockedDeposit) -> Result<()> {
        let lock_id = matured.id;
        self.ledger
            .with_busy_retry("complete_lock", move || async move {
                let mut tx = self.ledger.begin().await?;
                let mut lock = tx.rows().lock_locked_deposit(lock_id).await?;
                if lock.state != AccountState::Active {
                    return tx.rollback().await;
                }
                lock.state = AccountState::Completed;
                lock.updated_at = tx.now();
                tx.rows().save_locked_deposit(&lock).await?;
                tx.commit().await
            })
            .await
    }

    async fn renew(&self, matured: &LockedDeposit) -> Result<LockedDeposit> {
        let (user, lock_id) = (matured.user_id, matured.id);
        let tier = LockTier {
            days: matured.duration_days,
            apy: matured.apy,
        };

        let renewed = self
            .ledger
            .with_busy_retry("renew_lock", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(user).await?;
                let mut lock = tx.rows().lock_locked_deposit(lock_id).await?;
                if lock.state == AccountState::Withdrawn {
                    return Err(Error::InvalidState(format!("lock {} already withdrawn", lock_id)));
                }
                close_lock(&mut tx, &mut lock).await?;
                // the current tier keeps its APY if it is still offered
                let tier = self.config.tier(tier.days).unwrap_or(tier);
                let renewed =
                    open_lock(&mut tx, user, lock.principal, tier, true, Some(lock.id)).await?;
                tx.commit().await?;
                Ok(renewed)
            })
            .await?;

        info!(
            "Renewed lock {} as {} for user {} ({} days)",
            lock_id, renewed.id, user, renewed.duration_days
        );
        Ok(renewed)
    }

    async fn notify_matured(&self, lock: &LockedDeposit, renewed: bool) {
        let message = if renewed {
            format!(
                "Your {} USDC lock matured; interest was paid and the principal re-locked for {} days",
                lock.principal, lock.duration_days
            )
        } else {
            format!("Your {} USDC lock has matured and can be withdrawn", lock.principal)
        };
        let notification = Notification::new(NotificationKind::LockMatured, "Lock matured", message);
        if let Err(e) = self.notifier.notify(lock.user_id, notification).await {
            warn!("Maturity notification for lock {} failed: {}", lock.id, e);
        }
    }
}

/// Debit the balance and create an active lock
async fn open_lock(
    tx: &mut LedgerTx,
    user: UserId,
    amount: Decimal,
    tier: LockTier,
    auto_renew: bool,
    renewed_from: Option<Uuid>,
) -> Result<LockedDeposit> {
    let now = tx.now();
    let lock = LockedDeposit {
        id: Uuid::now_v7(),
        user_id: user,
        principal: amount,
        apy: tier.apy,
        duration_days: tier.days,
        start_at: now,
        maturity_at: now + Duration::days(i64::from(tier.days)),
        auto_renew,
        interest_earned: Decimal::ZERO,
        state: AccountState::Active,
        renewed_from,
        created_at: now,
        updated_at: now,
    };
    tx.apply_delta(user, -amount, EntryKind::LockedDeposit, None, Some(lock.id))
        .await?;
    tx.rows().save_locked_deposit(&lock).await?;
    Ok(lock)
}

/// Credit principal plus full-term interest and mark the lock withdrawn
async fn close_lock(tx: &mut LedgerTx, lock: &mut LockedDeposit) -> Result<()> {
    let now = tx.now();
    if lock.state == AccountState::Withdrawn {
        return Err(Error::InvalidState(format!("lock {} already withdrawn", lock.id)));
    }
    if !lock.is_matured(now) {
        return Err(Error::NotMatured {
            lock_id: lock.id,
            maturity: lock.maturity_at,
        });
    }

    let interest = lock.interest_at_maturity();
    tx.apply_delta(
        lock.user_id,
        lock.principal + interest,
        EntryKind::LockedWithdrawal,
        None,
        Some(lock.id),
    )
    .await?;

    lock.interest_earned = interest;
    lock.state = AccountState::Withdrawn;
    lock.updated_at = now;
    tx.rows().save_locked_deposit(lock).await
}
