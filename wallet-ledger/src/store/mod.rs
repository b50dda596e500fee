//! Durable storage behind the ledger
//!
//! A [`Store`] serves committed reads and opens [`UnitOfWork`]s. A unit of
//! work holds exclusive row locks until it commits or rolls back; dropping it
//! without committing discards every buffered write.
//!
//! Balance and ledger-entry writes take a [`WriteGrant`], which only the
//! mutation engine in [`crate::ledger`] can construct.
//!
//! Two backends implement the traits with identical locking semantics:
//! [`PgStore`] for production and [`MemoryStore`] for tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::accounts::earn::YieldPosition;
use crate::accounts::goals::Goal;
use crate::accounts::locked::LockedDeposit;
use crate::error::Result;
use crate::ledger::WriteGrant;
use crate::p2p::P2pTransfer;
use crate::payouts::{Payout, PayoutStatus};
use crate::referral::{Referral, ReferrerTotals};
use crate::types::{Balance, EntryKind, EntryStatus, LedgerEntry, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Committed reads and unit-of-work factory
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a unit of work
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Create a zero balance for a user; returns the existing one if present
    async fn create_balance(&self, user: UserId, now: DateTime<Utc>) -> Result<Balance>;

    /// Committed balance
    async fn get_balance(&self, user: UserId) -> Result<Option<Balance>>;

    /// All users holding a balance
    async fn user_ids(&self) -> Result<Vec<UserId>>;

    /// Entry recorded under an external reference
    async fn find_entry_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>>;

    /// Entries of a user, newest first
    async fn entries_for_user(&self, user: UserId, limit: usize) -> Result<Vec<LedgerEntry>>;

    /// Sum of completed entry amounts, optionally for one kind
    async fn completed_sum(&self, user: UserId, kind: Option<EntryKind>) -> Result<Decimal>;

    /// Goal by ID
    async fn get_goal(&self, id: Uuid) -> Result<Option<Goal>>;

    /// Goals of a user, oldest first
    async fn goals_for_user(&self, user: UserId) -> Result<Vec<Goal>>;

    /// Active goals carrying an auto-save rule
    async fn auto_save_goals(&self) -> Result<Vec<Goal>>;

    /// Locked deposit by ID
    async fn get_locked_deposit(&self, id: Uuid) -> Result<Option<LockedDeposit>>;

    /// Locked deposits of a user, oldest first
    async fn locked_deposits_for_user(&self, user: UserId) -> Result<Vec<LockedDeposit>>;

    /// Active locks whose maturity is at or before `now`
    async fn matured_locked_deposits(&self, now: DateTime<Utc>) -> Result<Vec<LockedDeposit>>;

    /// Yield position of a user
    async fn get_yield_position(&self, user: UserId) -> Result<Option<YieldPosition>>;

    /// Transfers sent or received by a user, newest first
    async fn transfers_for_user(&self, user: UserId, limit: usize) -> Result<Vec<P2pTransfer>>;

    /// Referral by ID
    async fn get_referral(&self, id: Uuid) -> Result<Option<Referral>>;

    /// Referral that brought in a user
    async fn referral_for_referred(&self, referred: UserId) -> Result<Option<Referral>>;

    /// Referrals made by a user, newest first
    async fn referrals_by_referrer(&self, referrer: UserId, limit: usize) -> Result<Vec<Referral>>;

    /// Referral totals of one referrer; zeroed when they referred nobody
    async fn referrer_totals(&self, referrer: UserId) -> Result<ReferrerTotals>;

    /// Referrers ranked by referral count, then paid rewards
    async fn top_referrers(&self, limit: usize) -> Result<Vec<ReferrerTotals>>;

    /// Payout by ID
    async fn get_payout(&self, id: Uuid) -> Result<Option<Payout>>;

    /// Payout by idempotency reference
    async fn payout_by_reference(&self, reference: &str) -> Result<Option<Payout>>;

    /// Payouts in any of the given statuses, oldest first
    async fn payouts_with_status(&self, statuses: &[PayoutStatus]) -> Result<Vec<Payout>>;
}

/// One atomic unit of work
///
/// `lock_*` methods take an exclusive row lock held until commit or rollback.
/// Re-locking a row already held by the same unit returns immediately. A lock
/// not granted within the store's lock timeout fails with `Error::Busy`.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock a balance row; `NotFound` for an unknown user
    async fn lock_balance(&mut self, user: UserId) -> Result<Balance>;

    /// Overwrite a locked balance
    async fn write_balance(
        &mut self,
        grant: &WriteGrant,
        user: UserId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Append an entry; `DuplicateReference` if its reference is taken
    async fn insert_entry(&mut self, grant: &WriteGrant, entry: &LedgerEntry) -> Result<()>;

    /// Lock the entry recorded under an external reference
    async fn lock_entry_by_reference(&mut self, reference: &str) -> Result<Option<LedgerEntry>>;

    /// Move a locked pending entry to completed or failed
    async fn finalize_entry(
        &mut self,
        grant: &WriteGrant,
        entry_id: Uuid,
        status: EntryStatus,
        memo: Option<&str>,
    ) -> Result<()>;

    /// Lock a goal
    async fn lock_goal(&mut self, id: Uuid) -> Result<Goal>;

    /// Insert or update a goal
    async fn save_goal(&mut self, goal: &Goal) -> Result<()>;

    /// Lock a locked deposit
    async fn lock_locked_deposit(&mut self, id: Uuid) -> Result<LockedDeposit>;

    /// Insert or update a locked deposit
    async fn save_locked_deposit(&mut self, lock: &LockedDeposit) -> Result<()>;

    /// Lock a user's yield position, if one exists
    async fn lock_yield_position(&mut self, user: UserId) -> Result<Option<YieldPosition>>;

    /// Insert or update a yield position
    async fn save_yield_position(&mut self, position: &YieldPosition) -> Result<()>;

    /// Record a P2P transfer
    async fn insert_transfer(&mut self, transfer: &P2pTransfer) -> Result<()>;

    /// Lock a referral
    async fn lock_referral(&mut self, id: Uuid) -> Result<Referral>;

    /// Insert or update a referral; `DuplicateReference` if the referred user
    /// already has one
    async fn save_referral(&mut self, referral: &Referral) -> Result<()>;

    /// Lock a payout
    async fn lock_payout(&mut self, id: Uuid) -> Result<Payout>;

    /// Insert or update a payout; `DuplicateReference` if its reference is taken
    async fn save_payout(&mut self, payout: &Payout) -> Result<()>;

    /// Make every buffered write visible and release the locks
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every buffered write and release the locks
    async fn rollback(self: Box<Self>) -> Result<()>;
}
