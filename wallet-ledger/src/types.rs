//! Core types for the ledger
//!
//! All amounts are USDC held as exact decimals (`rust_decimal`) and
//! normalized to the asset's 7 decimal places.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Decimal places carried by the USDC asset
pub const USDC_SCALE: u32 = 7;

/// Round an amount to the asset scale, half away from zero
pub fn normalize_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(USDC_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh random ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// External value credited in
    Deposit,
    /// Bank or chain withdrawal
    Withdrawal,
    /// P2P debit on the sender
    P2pSent,
    /// P2P credit on the receiver
    P2pReceived,
    /// Balance moved into a savings goal
    GoalContribution,
    /// Savings goal funds returned to balance
    GoalWithdrawal,
    /// Balance moved into a locked deposit
    LockedDeposit,
    /// Matured lock principal plus interest returned
    LockedWithdrawal,
    /// Balance supplied to the yield position
    YieldDeposit,
    /// Yield principal (and earnings) returned
    YieldWithdrawal,
    /// Bill payment debit
    BillPayment,
    /// Referral reward credit
    ReferralReward,
    /// Stock purchase debit
    TradeBuy,
    /// Compensating credit for a confirmed external failure
    Reversal,
}

impl EntryKind {
    /// All kinds, in declaration order
    pub const ALL: [EntryKind; 14] = [
        EntryKind::Deposit,
        EntryKind::Withdrawal,
        EntryKind::P2pSent,
        EntryKind::P2pReceived,
        EntryKind::GoalContribution,
        EntryKind::GoalWithdrawal,
        EntryKind::LockedDeposit,
        EntryKind::LockedWithdrawal,
        EntryKind::YieldDeposit,
        EntryKind::YieldWithdrawal,
        EntryKind::BillPayment,
        EntryKind::ReferralReward,
        EntryKind::TradeBuy,
        EntryKind::Reversal,
    ];

    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::P2pSent => "p2p_sent",
            EntryKind::P2pReceived => "p2p_received",
            EntryKind::GoalContribution => "goal_contribution",
            EntryKind::GoalWithdrawal => "goal_withdrawal",
            EntryKind::LockedDeposit => "locked_deposit",
            EntryKind::LockedWithdrawal => "locked_withdrawal",
            EntryKind::YieldDeposit => "yield_deposit",
            EntryKind::YieldWithdrawal => "yield_withdrawal",
            EntryKind::BillPayment => "bill_payment",
            EntryKind::ReferralReward => "referral_reward",
            EntryKind::TradeBuy => "trade_buy",
            EntryKind::Reversal => "reversal",
        }
    }

    /// Parse from storage code
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Externally-claimed, balance not yet touched
    Pending,
    /// Applied to the balance
    Completed,
    /// Recorded for audit, balance untouched
    Failed,
}

impl EntryStatus {
    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }

    /// Parse from storage code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "completed" => Some(EntryStatus::Completed),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable record of one balance-affecting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Owner of the balance
    pub user_id: UserId,

    /// Event kind
    pub kind: EntryKind,

    /// Signed delta applied to the balance
    pub amount: Decimal,

    /// Idempotency key for externally-triggered entries
    pub external_reference: Option<String>,

    /// Feature account, transfer or payout this entry belongs to
    pub account_id: Option<Uuid>,

    /// Status
    pub status: EntryStatus,

    /// Free-text audit note (failure reason etc.)
    pub memo: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build a new entry with a fresh time-ordered ID
    pub fn new(
        user_id: UserId,
        kind: EntryKind,
        amount: Decimal,
        status: EntryStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind,
            amount,
            external_reference: None,
            account_id: None,
            status,
            memo: None,
            created_at,
        }
    }

    /// Attach an external reference
    pub fn with_reference(mut self, reference: Option<&str>) -> Self {
        self.external_reference = reference.map(str::to_string);
        self
    }

    /// Attach the owning account
    pub fn with_account(mut self, account_id: Option<Uuid>) -> Self {
        self.account_id = account_id;
        self
    }

    /// Attach an audit memo
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Whether the entry contributes to the balance
    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }

    /// Whether the entry records this user, signed amount and kind
    pub fn matches(&self, user: UserId, amount: Decimal, kind: EntryKind) -> bool {
        self.user_id == user && self.kind == kind && self.amount == normalize_amount(amount)
    }
}

/// Liquid balance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Owner
    pub user_id: UserId,
    /// Spendable amount (never negative)
    pub amount: Decimal,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_kind_round_trips_storage_code() {
        for kind in EntryKind::ALL {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::parse("staking"), None);
    }

    #[test]
    fn test_entry_status_parse() {
        assert_eq!(EntryStatus::parse("completed"), Some(EntryStatus::Completed));
        assert_eq!(EntryStatus::parse("COMPLETED"), None);
    }

    #[test]
    fn test_normalize_amount_rounds_to_asset_scale() {
        assert_eq!(normalize_amount(dec!(0.32876712328)), dec!(0.3287671));
        assert_eq!(normalize_amount(dec!(0.00000005)), dec!(0.0000001));
    }

    #[test]
    fn test_entry_builders() {
        let user = UserId::generate();
        let account = Uuid::new_v4();
        let entry = LedgerEntry::new(
            user,
            EntryKind::Deposit,
            dec!(5000),
            EntryStatus::Completed,
            Utc::now(),
        )
        .with_reference(Some("TX123"))
        .with_account(Some(account))
        .with_memo("webhook");

        assert_eq!(entry.external_reference.as_deref(), Some("TX123"));
        assert_eq!(entry.account_id, Some(account));
        assert!(entry.is_completed());
    }

    #[test]
    fn test_entry_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EntryKind::P2pSent).unwrap();
        assert_eq!(json, "\"p2p_sent\"");
    }
}
