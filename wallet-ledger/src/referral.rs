//! Referral rewards
//!
//! A referral is registered when a referred user signs up and paid to the
//! referrer once, when the referred user's deposit meets the qualifying
//! minimum. The reward entry carries the reference `REF-<referral id>`, so a
//! second payment attempt can never credit twice.
//!
//! Per-referrer totals back the stats view and the leaderboard, ranked by
//! referrals brought in, then by rewards earned.

use crate::config::ReferralConfig;
use crate::integration::{Notification, NotificationKind, Notifier};
use crate::ledger::Ledger;
use crate::types::{EntryKind, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Paid,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReferralStatus::Pending),
            "paid" => Some(ReferralStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub reward_amount: Decimal,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Referral {
    /// Idempotency key of the reward entry
    pub fn reward_reference(&self) -> String {
        format!("REF-{}", self.id)
    }
}

/// Referral totals of one referrer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferrerTotals {
    pub referrer_id: UserId,
    pub total_referred: u64,
    /// Referrals whose reward is not paid yet
    pub pending: u64,
    /// Sum of paid rewards
    pub total_earned: Decimal,
}

impl ReferrerTotals {
    pub fn empty(referrer_id: UserId) -> Self {
        Self {
            referrer_id,
            total_referred: 0,
            pending: 0,
            total_earned: Decimal::ZERO,
        }
    }

    /// Fold one referral of this referrer into the totals
    pub fn add(&mut self, referral: &Referral) {
        self.total_referred += 1;
        match referral.status {
            ReferralStatus::Pending => self.pending += 1,
            ReferralStatus::Paid => self.total_earned += referral.reward_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub totals: ReferrerTotals,
    /// Most recent referrals, newest first
    pub recent: Vec<Referral>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based
    pub rank: usize,
    pub totals: ReferrerTotals,
}

const RECENT_REFERRALS: usize = 20;

pub struct ReferralService {
    ledger: Arc<Ledger>,
    notifier: Arc<dyn Notifier>,
    config: ReferralConfig,
}

impl ReferralService {
    pub fn new(ledger: Arc<Ledger>, notifier: Arc<dyn Notifier>, config: ReferralConfig) -> Self {
        Self {
            ledger,
            notifier,
            config,
        }
    }

    /// Record that `referrer` brought in `referred`
    pub async fn register(&self, referrer: UserId, referred: UserId) -> Result<Referral> {
        if referrer == referred {
            return Err(Error::InvalidRequest("users cannot refer themselves".to_string()));
        }
        self.ledger.get_balance(referrer).await?;
        self.ledger.get_balance(referred).await?;

        let referral = Referral {
            id: Uuid::now_v7(),
            referrer_id: referrer,
            referred_id: referred,
            reward_amount: self.config.reward_amount,
            status: ReferralStatus::Pending,
            created_at: self.ledger.now(),
            paid_at: None,
        };

        let mut tx = self.ledger.begin().await?;
        match tx.rows().save_referral(&referral).await {
            Ok(()) => {}
            Err(Error::DuplicateReference(_)) => {
                return Err(Error::InvalidState(format!("user {} was already referred", referred)));
            }
            Err(e) => return Err(e),
        }
        tx.commit().await?;

        info!("Registered referral {}: {} referred {}", referral.id, referrer, referred);
        Ok(referral)
    }

    pub async fn referral(&self, id: Uuid) -> Result<Referral> {
        self.ledger
            .store()
            .get_referral(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("referral {}", id)))
    }

    /// Credit the referrer; a paid referral is returned unchanged
    pub async fn pay_reward(&self, referral_id: Uuid) -> Result<Referral> {
        let existing = self.referral(referral_id).await?;
        if existing.status == ReferralStatus::Paid {
            return Ok(existing);
        }
        let referrer = existing.referrer_id;

        let (referral, paid_now) = self
            .ledger
            .with_busy_retry("pay_referral_reward", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(referrer).await?;
                let mut referral = tx.rows().lock_referral(referral_id).await?;
                if referral.status == ReferralStatus::Paid {
                    tx.rollback().await?;
                    return Ok((referral, false));
                }

                let reference = referral.reward_reference();
                tx.apply_delta(
                    referrer,
                    referral.reward_amount,
                    EntryKind::ReferralReward,
                    Some(reference.as_str()),
                    Some(referral.id),
                )
                .await?;
                referral.status = ReferralStatus::Paid;
                referral.paid_at = Some(tx.now());
                tx.rows().save_referral(&referral).await?;
                tx.commit().await?;
                Ok((referral, true))
            })
            .await?;

        if paid_now {
            info!(
                "Paid referral reward {} to {} for referral {}",
                referral.reward_amount, referrer, referral.id
            );
            let notification = Notification::new(
                NotificationKind::ReferralReward,
                "Referral reward",
                format!("You earned {} USDC for a referral", referral.reward_amount),
            );
            if let Err(e) = self.notifier.notify(referrer, notification).await {
                warn!("Referral notification for {} failed: {}", referral.id, e);
            }
        }
        Ok(referral)
    }

    /// Referral totals of `user` and their latest referrals
    pub async fn stats(&self, user: UserId) -> Result<ReferralStats> {
        self.ledger.get_balance(user).await?;
        let store = self.ledger.store();
        let totals = store.referrer_totals(user).await?;
        let recent = store.referrals_by_referrer(user, RECENT_REFERRALS).await?;
        Ok(ReferralStats { totals, recent })
    }

    /// Top referrers by referrals brought in, then rewards earned
    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let top = self.ledger.store().top_referrers(limit).await?;
        Ok(top
            .into_iter()
            .enumerate()
            .map(|(i, totals)| LeaderboardEntry { rank: i + 1, totals })
            .collect())
    }

    /// Pay the pending referral of `user` when the deposit qualifies
    pub async fn on_deposit(&self, user: UserId, amount: Decimal) -> Result<Option<Referral>> {
        let referral = match self.ledger.store().referral_for_referred(user).await? {
            Some(r) if r.status == ReferralStatus::Pending => r,
            _ => return Ok(None),
        };
        if amount < self.config.min_qualifying_deposit {
            debug!(
                "Deposit {} by {} below referral minimum {}",
                amount, user, self.config.min_qualifying_deposit
            );
            return Ok(None);
        }
        self.pay_reward(referral.id).await.map(Some)
    }
}
