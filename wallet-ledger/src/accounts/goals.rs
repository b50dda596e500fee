//! Savings goals
//!
//! A goal holds contributions towards a target. Crossing 25/50/75/100% of the
//! target notifies the user once per threshold; the highest milestone reached
//! is persisted on the goal so a threshold never fires twice, even after a
//! withdrawal and a refill.

use super::{AccountState, FeatureAccount};
use crate::integration::{Notification, NotificationKind, Notifier};
use crate::ledger::Ledger;
use crate::types::{normalize_amount, EntryKind, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress thresholds, in percent of target
pub const MILESTONES: [u8; 4] = [25, 50, 75, 100];

/// Auto-save cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSaveFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl AutoSaveFrequency {
    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoSaveFrequency::Daily => "daily",
            AutoSaveFrequency::Weekly => "weekly",
            AutoSaveFrequency::Monthly => "monthly",
        }
    }

    /// Parse from storage code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(AutoSaveFrequency::Daily),
            "weekly" => Some(AutoSaveFrequency::Weekly),
            "monthly" => Some(AutoSaveFrequency::Monthly),
            _ => None,
        }
    }

    /// When the next run is due after a run at `last`
    pub fn next_due(&self, last: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            AutoSaveFrequency::Daily => last + Duration::days(1),
            AutoSaveFrequency::Weekly => last + Duration::weeks(1),
            AutoSaveFrequency::Monthly => last
                .checked_add_months(Months::new(1))
                .unwrap_or(last + Duration::days(30)),
        }
    }
}

/// Recurring contribution rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoSave {
    pub amount: Decimal,
    pub frequency: AutoSaveFrequency,
}

/// Origin of a contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributionSource {
    Manual,
    AutoSave,
}

/// Savings goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub target_amount: Decimal,
    pub current_amount: Decimal,
    pub deadline: Option<DateTime<Utc>>,
    pub auto_save: Option<AutoSave>,
    pub last_auto_save_at: Option<DateTime<Utc>>,
    /// Highest milestone already notified (0 when none)
    pub milestone: u8,
    pub state: AccountState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// Progress towards the target, in percent
    pub fn progress_percent(&self) -> Decimal {
        if self.target_amount.is_zero() {
            return Decimal::ZERO;
        }
        self.current_amount / self.target_amount * Decimal::ONE_HUNDRED
    }

    /// Milestones reached by the current amount but not yet notified
    fn new_milestones(&self) -> Vec<u8> {
        let progress = self.progress_percent();
        MILESTONES
            .iter()
            .copied()
            .filter(|pct| *pct > self.milestone && progress >= Decimal::from(*pct))
            .collect()
    }

    /// Whether the auto-save rule should run at `now`
    pub fn auto_save_due(&self, now: DateTime<Utc>) -> bool {
        match (&self.auto_save, self.state) {
            (Some(rule), AccountState::Active) => match self.last_auto_save_at {
                Some(last) => now >= rule.frequency.next_due(last),
                None => true,
            },
            _ => false,
        }
    }
}

impl FeatureAccount for Goal {
    fn id(&self) -> Uuid {
        self.id
    }

    fn owner(&self) -> UserId {
        self.user_id
    }

    fn principal(&self) -> Decimal {
        self.current_amount
    }

    fn accrued(&self, _now: DateTime<Utc>) -> Decimal {
        Decimal::ZERO
    }

    fn state(&self, _now: DateTime<Utc>) -> AccountState {
        self.state
    }
}

/// Outcome of one auto-save sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoSaveReport {
    pub contributed: usize,
    pub failed: usize,
}

/// Goal operations
pub struct GoalService {
    ledger: Arc<Ledger>,
    notifier: Arc<dyn Notifier>,
}

impl GoalService {
    pub fn new(ledger: Arc<Ledger>, notifier: Arc<dyn Notifier>) -> Self {
        Self { ledger, notifier }
    }

    /// Create a goal; no value moves
    pub async fn create_goal(
        &self,
        user: UserId,
        name: &str,
        target: Decimal,
        deadline: Option<DateTime<Utc>>,
        auto_save: Option<AutoSave>,
    ) -> Result<Goal> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("goal name is required".to_string()));
        }
        let target = normalize_amount(target);
        if target <= Decimal::ZERO {
            return Err(Error::InvalidAmount("target must be positive".to_string()));
        }
        let now = self.ledger.now();
        if matches!(deadline, Some(d) if d <= now) {
            return Err(Error::InvalidRequest("deadline must be in the future".to_string()));
        }
        if matches!(auto_save, Some(rule) if rule.amount <= Decimal::ZERO) {
            return Err(Error::InvalidAmount("auto-save amount must be positive".to_string()));
        }
        self.ledger.get_balance(user).await?;

        let goal = Goal {
            id: Uuid::now_v7(),
            user_id: user,
            name: name.to_string(),
            target_amount: target,
            current_amount: Decimal::ZERO,
            deadline,
            auto_save,
            last_auto_save_at: None,
            milestone: 0,
            state: AccountState::Active,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.ledger.begin().await?;
        tx.rows().save_goal(&goal).await?;
        tx.commit().await?;

        info!("Created goal {} '{}' for user {} (target {})", goal.id, goal.name, user, target);
        Ok(goal)
    }

    /// Goals of a user
    pub async fn goals(&self, user: UserId) -> Result<Vec<Goal>> {
        self.ledger.store().goals_for_user(user).await
    }

    /// One goal of a user
    pub async fn goal(&self, user: UserId, goal_id: Uuid) -> Result<Goal> {
        match self.ledger.store().get_goal(goal_id).await? {
            Some(goal) if goal.user_id == user => Ok(goal),
            _ => Err(Error::NotFound(format!("goal {}", goal_id))),
        }
    }

    /// Move balance into an active goal
    pub async fn contribute(
        &self,
        user: UserId,
        goal_id: Uuid,
        amount: Decimal,
        source: ContributionSource,
    ) -> Result<Goal> {
        let amount = normalize_amount(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("contribution must be positive".to_string()));
        }
        let existing = self.goal(user, goal_id).await?;
        if existing.state != AccountState::Active {
            return Err(Error::InvalidState(format!("goal {} is not active", goal_id)));
        }

        let (goal, milestones) = self
            .ledger
            .with_busy_retry("goal_contribute", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.apply_delta(user, -amount, EntryKind::GoalContribution, None, Some(goal_id))
                    .await?;

                let mut goal = tx.rows().lock_goal(goal_id).await?;
                if goal.user_id != user {
                    return Err(Error::NotFound(format!("goal {}", goal_id)));
                }
                if goal.state != AccountState::Active {
                    return Err(Error::InvalidState(format!("goal {} is not active", goal_id)));
                }

                let now = tx.now();
                goal.current_amount += amount;
                goal.updated_at = now;
                if source == ContributionSource::AutoSave {
                    goal.last_auto_save_at = Some(now);
                }
                let milestones = goal.new_milestones();
                if let Some(highest) = milestones.last() {
                    goal.milestone = *highest;
                }
                if goal.current_amount >= goal.target_amount {
                    goal.state = AccountState::Completed;
                }

                tx.rows().save_goal(&goal).await?;
                tx.commit().await?;
                Ok((goal, milestones))
            })
            .await?;

        info!(
            "Contributed {} to goal {} for user {} ({:?}), now {}/{}",
            amount, goal_id, user, source, goal.current_amount, goal.target_amount
        );

        for pct in milestones {
            self.notify_milestone(&goal, pct).await;
        }
        Ok(goal)
    }

    async fn notify_milestone(&self, goal: &Goal, pct: u8) {
        let notification = if pct >= 100 {
            Notification::new(
                NotificationKind::GoalCompleted,
                "Goal reached!",
                format!("You reached your '{}' goal of {} USDC", goal.name, goal.target_amount),
            )
        } else {
            Notification::new(
                NotificationKind::GoalMilestone,
                format!("{}% of your goal", pct),
                format!("'{}' is {}% funded", goal.name, pct),
            )
        };
        if let Err(e) = self.notifier.notify(goal.user_id, notification).await {
            warn!("Milestone notification for goal {} failed: {}", goal.id, e);
        }
    }

    /// Return part of a goal's funds to the balance
    ///
    /// A completed goal that drops below its target becomes active again;
    /// milestones already notified stay notified.
    pub async fn withdraw(&self, user: UserId, goal_id: Uuid, amount: Decimal) -> Result<Goal> {
        let amount = normalize_amount(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("withdrawal must be positive".to_string()));
        }
        self.goal(user, goal_id).await?;

        let goal = self
            .ledger
            .with_busy_retry("goal_withdraw", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(user).await?;
                let mut goal = tx.rows().lock_goal(goal_id).await?;
                if goal.user_id != user {
                    return Err(Error::NotFound(format!("goal {}", goal_id)));
                }
                if goal.state == AccountState::Withdrawn {
                    return Err(Error::InvalidState(format!("goal {} is closed", goal_id)));
                }
                if amount > goal.current_amount {
                    return Err(Error::InsufficientFunds {
                        required: amount,
                        available: goal.current_amount,
                    });
                }

                tx.apply_delta(user, amount, EntryKind::GoalWithdrawal, None, Some(goal_id))
                    .await?;
                goal.current_amount -= amount;
                goal.updated_at = tx.now();
                if goal.state == AccountState::Completed && goal.current_amount < goal.target_amount {
                    goal.state = AccountState::Active;
                }
                tx.rows().save_goal(&goal).await?;
                tx.commit().await?;
                Ok(goal)
            })
            .await?;

        info!("Withdrew {} from goal {} for user {}", amount, goal_id, user);
        Ok(goal)
    }

    /// Return everything in a goal to the balance and freeze it
    pub async fn close(&self, user: UserId, goal_id: Uuid) -> Result<Goal> {
        self.goal(user, goal_id).await?;

        let goal = self
            .ledger
            .with_busy_retry("goal_close", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(user).await?;
                let mut goal = tx.rows().lock_goal(goal_id).await?;
                if goal.user_id != user {
                    return Err(Error::NotFound(format!("goal {}", goal_id)));
                }
                if goal.state == AccountState::Withdrawn {
                    return Err(Error::InvalidState(format!("goal {} is already closed", goal_id)));
                }

                if goal.current_amount > Decimal::ZERO {
                    tx.apply_delta(
                        user,
                        goal.current_amount,
                        EntryKind::GoalWithdrawal,
                        None,
                        Some(goal_id),
                    )
                    .await?;
                }
                goal.current_amount = Decimal::ZERO;
                goal.state = AccountState::Withdrawn;
                goal.updated_at = tx.now();
                tx.rows().save_goal(&goal).await?;
                tx.commit().await?;
                Ok(goal)
            })
            .await?;

        info!("Closed goal {} for user {}", goal_id, user);
        Ok(goal)
    }

    /// Contribute to every goal whose auto-save rule is due
    ///
    /// A failing goal is logged and skipped; the sweep carries on.
    pub async fn run_auto_save(&self) -> Result<AutoSaveReport> {
        let now = self.ledger.now();
        let mut report = AutoSaveReport::default();

        for goal in self.ledger.store().auto_save_goals().await? {
            if !goal.auto_save_due(now) {
                continue;
            }
            let Some(rule) = goal.auto_save else { continue };

            match self
                .contribute(goal.user_id, goal.id, rule.amount, ContributionSource::AutoSave)
                .await
            {
                Ok(_) => report.contributed += 1,
                Err(e) => {
                    warn!("Auto-save failed for goal {}: {}", goal.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.contributed + report.failed > 0 {
            info!(
                "Auto-save sweep: {} contributed, {} failed",
                report.contributed, report.failed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::mock::MemoryNotifier;
    use crate::test_support::{funded_user, test_ledger};
    use rust_decimal_macros::dec;

    fn service(ledger: Arc<Ledger>) -> (GoalService, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        (GoalService::new(ledger, notifier.clone()), notifier)
    }

    #[tokio::test]
    async fn test_create_goal_validates_input() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(0)).await;
        let (goals, _) = service(ledger);

        assert!(matches!(
            goals.create_goal(user, "  ", dec!(100), None, None).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            goals.create_goal(user, "Car", dec!(0), None, None).await,
            Err(Error::InvalidAmount(_))
        ));

        let goal = goals.create_goal(user, "Car", dec!(100), None, None).await.unwrap();
        assert_eq!(goal.state, AccountState::Active);
        assert_eq!(goals.goals(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_milestones_fire_once_each() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(200)).await;
        let (goals, notifier) = service(ledger.clone());
        let goal = goals.create_goal(user, "Laptop", dec!(100), None, None).await.unwrap();

        goals.contribute(user, goal.id, dec!(30), ContributionSource::Manual).await.unwrap();
        assert_eq!(notifier.sent_to(user).len(), 1);

        // withdraw below 25% and refill: 25% must not fire again
        goals.withdraw(user, goal.id, dec!(10)).await.unwrap();
        goals.contribute(user, goal.id, dec!(10), ContributionSource::Manual).await.unwrap();
        assert_eq!(notifier.sent_to(user).len(), 1);

        let goal = goals
            .contribute(user, goal.id, dec!(50), ContributionSource::Manual)
            .await
            .unwrap();
        let kinds: Vec<_> = notifier.sent_to(user).iter().map(|n| n.kind).collect();
        assert_eq!(goal.milestone, 75);
        assert_eq!(kinds.len(), 3);
        assert_eq!(goal.current_amount, dec!(80));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(120));
    }

    #[tokio::test]
    async fn test_reaching_target_completes_goal() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(150)).await;
        let (goals, notifier) = service(ledger.clone());
        let goal = goals.create_goal(user, "Rent", dec!(100), None, None).await.unwrap();

        let goal = goals
            .contribute(user, goal.id, dec!(120), ContributionSource::Manual)
            .await
            .unwrap();

        assert_eq!(goal.state, AccountState::Completed);
        assert_eq!(notifier.sent_to(user).len(), 4);
        assert_eq!(
            notifier.sent_to(user).last().map(|n| n.kind),
            Some(NotificationKind::GoalCompleted)
        );

        let err = goals
            .contribute(user, goal.id, dec!(1), ContributionSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_goal_untouched() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(5)).await;
        let (goals, _) = service(ledger.clone());
        let goal = goals.create_goal(user, "Trip", dec!(100), None, None).await.unwrap();

        let err = goals
            .contribute(user, goal.id, dec!(6), ContributionSource::Manual)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(goals.goal(user, goal.id).await.unwrap().current_amount, Decimal::ZERO);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(5));
    }

    #[tokio::test]
    async fn test_withdraw_more_than_goal_holds() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(50)).await;
        let (goals, _) = service(ledger.clone());
        let goal = goals.create_goal(user, "Phone", dec!(100), None, None).await.unwrap();
        goals.contribute(user, goal.id, dec!(20), ContributionSource::Manual).await.unwrap();

        let err = goals.withdraw(user, goal.id, dec!(21)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(30));
    }

    #[tokio::test]
    async fn test_close_returns_funds_and_freezes() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(100)).await;
        let (goals, _) = service(ledger.clone());
        let goal = goals.create_goal(user, "Gift", dec!(40), None, None).await.unwrap();
        goals.contribute(user, goal.id, dec!(40), ContributionSource::Manual).await.unwrap();

        let closed = goals.close(user, goal.id).await.unwrap();
        assert_eq!(closed.state, AccountState::Withdrawn);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(100));
        assert!(matches!(
            goals.withdraw(user, goal.id, dec!(1)).await,
            Err(Error::InvalidState(_))
        ));
        assert!(ledger.audit(user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_other_users_goal_is_not_found() {
        let (ledger, _clock) = test_ledger();
        let owner = funded_user(&ledger, dec!(10)).await;
        let stranger = funded_user(&ledger, dec!(10)).await;
        let (goals, _) = service(ledger);
        let goal = goals.create_goal(owner, "Mine", dec!(10), None, None).await.unwrap();

        let err = goals
            .contribute(stranger, goal.id, dec!(1), ContributionSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_auto_save_runs_on_schedule() {
        let (ledger, clock) = test_ledger();
        let user = funded_user(&ledger, dec!(25)).await;
        let (goals, _) = service(ledger.clone());
        let rule = AutoSave {
            amount: dec!(10),
            frequency: AutoSaveFrequency::Weekly,
        };
        let goal = goals
            .create_goal(user, "House", dec!(1000), None, Some(rule))
            .await
            .unwrap();

        let report = goals.run_auto_save().await.unwrap();
        assert_eq!(report.contributed, 1);

        // not due again until a week later
        clock.advance(Duration::days(3));
        assert_eq!(goals.run_auto_save().await.unwrap().contributed, 0);

        clock.advance(Duration::days(4));
        assert_eq!(goals.run_auto_save().await.unwrap().contributed, 1);

        // third run has only 5 left: logged and counted as failed
        clock.advance(Duration::weeks(1));
        let report = goals.run_auto_save().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(goals.goal(user, goal.id).await.unwrap().current_amount, dec!(20));
    }

    #[test]
    fn test_monthly_next_due_uses_calendar_months() {
        let last = DateTime::parse_from_rfc3339("2024-01-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = AutoSaveFrequency::Monthly.next_due(last);
        assert_eq!(next.to_rfc3339(), "2024-02-29T00:00:00+00:00");
    }
}
