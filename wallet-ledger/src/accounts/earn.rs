//! Yield positions
//!
//! One position per user. Earnings accrue continuously on the supplied
//! principal and are computed lazily; the accrual is snapshotted into
//! `accrued` whenever the principal changes. Earnings are paid out when the
//! principal is fully withdrawn.

use super::{AccountState, FeatureAccount};
use crate::config::EarnConfig;
use crate::ledger::Ledger;
use crate::types::{normalize_amount, EntryKind, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const SECONDS_PER_DAY: i64 = 86_400;

/// Yield position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldPosition {
    pub id: Uuid,
    pub user_id: UserId,
    pub supplied: Decimal,
    /// Earnings snapshotted at `last_accrual_at`
    pub accrued: Decimal,
    /// Percent
    pub apy: Decimal,
    pub last_accrual_at: DateTime<Utc>,
    pub state: AccountState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl YieldPosition {
    /// Earnings since the last snapshot, over fractional days
    pub fn pending_earnings(&self, now: DateTime<Utc>) -> Decimal {
        let seconds = (now - self.last_accrual_at).num_seconds().max(0);
        let days = Decimal::from(seconds) / Decimal::from(SECONDS_PER_DAY);
        self.supplied * self.apy / Decimal::ONE_HUNDRED * days / Decimal::from(365)
    }

    /// Fold pending earnings into `accrued`
    fn snapshot(&mut self, now: DateTime<Utc>, apy: Decimal) {
        self.accrued = normalize_amount(self.accrued + self.pending_earnings(now));
        self.last_accrual_at = now;
        self.apy = apy;
        self.updated_at = now;
    }
}

impl FeatureAccount for YieldPosition {
    fn id(&self) -> Uuid {
        self.id
    }

    fn owner(&self) -> UserId {
        self.user_id
    }

    fn principal(&self) -> Decimal {
        self.supplied
    }

    fn accrued(&self, now: DateTime<Utc>) -> Decimal {
        normalize_amount(self.accrued + self.pending_earnings(now))
    }

    fn state(&self, _now: DateTime<Utc>) -> AccountState {
        self.state
    }
}

/// Read model of a user's yield position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsSummary {
    pub supplied: Decimal,
    pub earned: Decimal,
    pub apy: Decimal,
    pub total_value: Decimal,
    pub is_earning: bool,
}

/// Yield position operations
pub struct EarnService {
    ledger: Arc<Ledger>,
    config: EarnConfig,
}

impl EarnService {
    pub fn new(ledger: Arc<Ledger>, config: EarnConfig) -> Self {
        Self { ledger, config }
    }

    /// Current APY, in percent
    pub fn current_apy(&self) -> Decimal {
        self.config.apy
    }

    /// Supply part of the balance to the yield position
    pub async fn enable(&self, user: UserId, amount: Decimal) -> Result<YieldPosition> {
        let amount = normalize_amount(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("amount must be positive".to_string()));
        }
        let apy = self.config.apy;

        let position = self
            .ledger
            .with_busy_retry("enable_yield", move || async move {
                let mut tx = self.ledger.begin().await?;
                let now = tx.now();
                tx.lock_and_get_balance(user).await?;
                let mut position = match tx.rows().lock_yield_position(user).await? {
                    Some(mut position) => {
                        position.snapshot(now, apy);
                        position.state = AccountState::Active;
                        position
                    }
                    None => YieldPosition {
                        id: Uuid::now_v7(),
                        user_id: user,
                        supplied: Decimal::ZERO,
                        accrued: Decimal::ZERO,
                        apy,
                        last_accrual_at: now,
                        state: AccountState::Active,
                        created_at: now,
                        updated_at: now,
                    },
                };

                tx.apply_delta(user, -amount, EntryKind::YieldDeposit, None, Some(position.id))
                    .await?;
                position.supplied += amount;
                tx.rows().save_yield_position(&position).await?;
                tx.commit().await?;
                Ok(position)
            })
            .await?;

        info!(
            "User {} supplied {} to yield at {}% (now {})",
            user, amount, apy, position.supplied
        );
        Ok(position)
    }

    /// Return supplied principal to the balance
    ///
    /// Withdrawing the whole principal also pays out the accrued earnings in
    /// the same entry and marks the position withdrawn.
    pub async fn disable(&self, user: UserId, amount: Decimal) -> Result<YieldPosition> {
        let amount = normalize_amount(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("amount must be positive".to_string()));
        }
        let apy = self.config.apy;

        let position = self
            .ledger
            .with_busy_retry("disable_yield", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(user).await?;
                let mut position = tx
                    .rows()
                    .lock_yield_position(user)
                    .await?
                    .filter(|p| p.state == AccountState::Active)
                    .ok_or_else(|| Error::NotFound(format!("yield position for user {}", user)))?;
                if amount > position.supplied {
                    return Err(Error::InsufficientFunds {
                        required: amount,
                        available: position.supplied,
                    });
                }

                let now = tx.now();
                position.snapshot(now, apy);
                position.supplied -= amount;

                let mut credit = amount;
                if position.supplied.is_zero() {
                    credit += position.accrued;
                    position.accrued = Decimal::ZERO;
                    position.state = AccountState::Withdrawn;
                }

                tx.apply_delta(user, credit, EntryKind::YieldWithdrawal, None, Some(position.id))
                    .await?;
                tx.rows().save_yield_position(&position).await?;
                tx.commit().await?;
                Ok(position)
            })
            .await?;

        info!(
            "User {} withdrew {} from yield (remaining {}, state {})",
            user,
            amount,
            position.supplied,
            position.state.as_str()
        );
        Ok(position)
    }

    /// Supplied principal and earnings as of now
    pub async fn earnings(&self, user: UserId) -> Result<EarningsSummary> {
        let now = self.ledger.now();
        let summary = match self.ledger.store().get_yield_position(user).await? {
            Some(position) if position.state == AccountState::Active => {
                let earned = position.accrued(now);
                EarningsSummary {
                    supplied: position.supplied,
                    earned,
                    apy: position.apy,
                    total_value: position.supplied + earned,
                    is_earning: position.supplied > Decimal::ZERO,
                }
            }
            _ => EarningsSummary {
                supplied: Decimal::ZERO,
                earned: Decimal::ZERO,
                apy: self.config.apy,
                total_value: Decimal::ZERO,
                is_earning: false,
            },
        };
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{funded_user, test_ledger};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn service(ledger: Arc<Ledger>) -> EarnService {
        EarnService::new(ledger, EarnConfig { apy: dec!(10) })
    }

    #[tokio::test]
    async fn test_earnings_accrue_lazily() {
        let (ledger, clock) = test_ledger();
        let user = funded_user(&ledger, dec!(365)).await;
        let earn = service(ledger.clone());

        earn.enable(user, dec!(365)).await.unwrap();
        assert_eq!(ledger.get_balance(user).await.unwrap(), Decimal::ZERO);

        clock.advance(Duration::hours(36));
        let summary = earn.earnings(user).await.unwrap();
        // 365 × 10% × 1.5 / 365
        assert_eq!(summary.earned, dec!(0.15));
        assert!(summary.is_earning);
    }

    #[tokio::test]
    async fn test_snapshot_on_principal_change() {
        let (ledger, clock) = test_ledger();
        let user = funded_user(&ledger, dec!(1000)).await;
        let earn = service(ledger.clone());

        earn.enable(user, dec!(365)).await.unwrap();
        clock.advance(Duration::days(10));
        let position = earn.enable(user, dec!(365)).await.unwrap();
        assert_eq!(position.accrued, dec!(1));
        assert_eq!(position.supplied, dec!(730));

        clock.advance(Duration::days(10));
        assert_eq!(earn.earnings(user).await.unwrap().earned, dec!(3));
    }

    #[tokio::test]
    async fn test_full_withdrawal_pays_earnings() {
        let (ledger, clock) = test_ledger();
        let user = funded_user(&ledger, dec!(365)).await;
        let earn = service(ledger.clone());

        earn.enable(user, dec!(365)).await.unwrap();
        clock.advance(Duration::days(5));

        let partial = earn.disable(user, dec!(100)).await.unwrap();
        assert_eq!(partial.state, AccountState::Active);
        assert_eq!(partial.accrued, dec!(0.5));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(100));

        let err = earn.disable(user, dec!(266)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let closed = earn.disable(user, dec!(265)).await.unwrap();
        assert_eq!(closed.state, AccountState::Withdrawn);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(365.5));
        assert!(!earn.earnings(user).await.unwrap().is_earning);
        assert!(ledger.audit(user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_disable_without_position() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(10)).await;
        let earn = service(ledger);

        let err = earn.disable(user, dec!(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
