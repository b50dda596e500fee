//! Feature accounts: savings goals, locked deposits and yield positions
//!
//! Each account holds principal moved out of the liquid balance. Value only
//! crosses between the balance and an account through the mutation engine,
//! inside the same unit of work that updates the account row.

pub mod earn;
pub mod goals;
pub mod locked;

use crate::ledger::Ledger;
use crate::types::{normalize_amount, UserId};
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use earn::{EarnService, YieldPosition};
pub use goals::{AutoSave, AutoSaveFrequency, ContributionSource, Goal, GoalService};
pub use locked::{LockedDeposit, LockedService};

/// Lifecycle of a feature account: active → completed → withdrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Accepting value / accruing
    Active,
    /// Target reached or matured
    Completed,
    /// Value returned; frozen
    Withdrawn,
}

impl AccountState {
    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Active => "active",
            AccountState::Completed => "completed",
            AccountState::Withdrawn => "withdrawn",
        }
    }

    /// Parse from storage code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountState::Active),
            "completed" => Some(AccountState::Completed),
            "withdrawn" => Some(AccountState::Withdrawn),
            _ => None,
        }
    }
}

/// Common view over goals, locks and yield positions
pub trait FeatureAccount {
    /// Account ID
    fn id(&self) -> Uuid;

    /// Owner
    fn owner(&self) -> UserId;

    /// Value moved in from the balance and not yet returned
    fn principal(&self) -> Decimal;

    /// Earnings accrued as of `now`
    fn accrued(&self, now: DateTime<Utc>) -> Decimal;

    /// State as of `now`
    fn state(&self, now: DateTime<Utc>) -> AccountState;
}

/// Value a user holds outside the liquid balance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Holdings {
    /// Principal in accounts not yet withdrawn
    pub principal: Decimal,
    /// Earnings accrued on those accounts
    pub accrued: Decimal,
    /// Accounts not yet withdrawn
    pub open_accounts: usize,
}

impl Holdings {
    /// Totals over the accounts that still hold value
    pub fn collect<'a>(
        accounts: impl IntoIterator<Item = &'a dyn FeatureAccount>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut holdings = Holdings::default();
        for account in accounts {
            if account.state(now) == AccountState::Withdrawn {
                continue;
            }
            holdings.principal += account.principal();
            holdings.accrued += account.accrued(now);
            holdings.open_accounts += 1;
        }
        holdings.accrued = normalize_amount(holdings.accrued);
        holdings
    }
}

/// Goals, locked deposits and yield position of a user, summed
pub async fn holdings(ledger: &Ledger, user: UserId) -> Result<Holdings> {
    let store = ledger.store();
    let goals = store.goals_for_user(user).await?;
    let locks = store.locked_deposits_for_user(user).await?;
    let position = store.get_yield_position(user).await?;

    let accounts = goals
        .iter()
        .map(|g| g as &dyn FeatureAccount)
        .chain(locks.iter().map(|l| l as &dyn FeatureAccount))
        .chain(position.iter().map(|p| p as &dyn FeatureAccount));
    Ok(Holdings::collect(accounts, ledger.now()))
}
