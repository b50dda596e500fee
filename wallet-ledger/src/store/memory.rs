//! In-process store
//!
//! Committed rows live behind one `RwLock`. Row locks are per-key tokio
//! mutexes kept in a `DashMap`; a unit of work keeps the guards it acquired
//! until it commits or is dropped, and buffers its writes in an overlay that
//! is applied atomically on commit. Unique keys (entry reference, payout
//! reference, referred user, yield owner) are guarded by their own row lock,
//! so a second inserter waits for the first to finish and then sees its row.

use super::{Store, UnitOfWork};
use crate::accounts::earn::YieldPosition;
use crate::accounts::goals::Goal;
use crate::accounts::locked::LockedDeposit;
use crate::accounts::AccountState;
use crate::error::{Error, Result};
use crate::ledger::WriteGrant;
use crate::p2p::P2pTransfer;
use crate::payouts::{Payout, PayoutStatus};
use crate::referral::{Referral, ReferrerTotals};
use crate::types::{Balance, EntryKind, EntryStatus, LedgerEntry, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Balance(UserId),
    Reference(String),
    Goal(Uuid),
    Lock(Uuid),
    Yield(UserId),
    Referral(Uuid),
    Referred(UserId),
    Payout(Uuid),
    PayoutReference(String),
}

#[derive(Default)]
struct MemoryState {
    balances: HashMap<UserId, Balance>,
    entries: Vec<LedgerEntry>,
    entry_index: HashMap<Uuid, usize>,
    references: HashMap<String, usize>,
    goals: HashMap<Uuid, Goal>,
    locked: HashMap<Uuid, LockedDeposit>,
    yields: HashMap<UserId, YieldPosition>,
    transfers: Vec<P2pTransfer>,
    referrals: HashMap<Uuid, Referral>,
    payouts: HashMap<Uuid, Payout>,
}

impl MemoryState {
    fn entry_by_reference(&self, reference: &str) -> Option<&LedgerEntry> {
        self.references.get(reference).map(|i| &self.entries[*i])
    }

    fn push_entry(&mut self, entry: LedgerEntry) -> Result<()> {
        if let Some(reference) = &entry.external_reference {
            if self.references.contains_key(reference) {
                return Err(Error::DuplicateReference(reference.clone()));
            }
            self.references.insert(reference.clone(), self.entries.len());
        }
        self.entry_index.insert(entry.id, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}

struct Shared {
    state: RwLock<MemoryState>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

/// Store keeping every row in memory
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Store whose row locks give up after `lock_timeout`
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(MemoryState::default()),
                row_locks: DashMap::new(),
                lock_timeout,
            }),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&MemoryState) -> R) -> R {
        f(&self.shared.state.read())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnit {
            shared: self.shared.clone(),
            held: HeldLocks {
                shared: self.shared.clone(),
                guards: HashMap::new(),
            },
            overlay: Overlay::default(),
        }))
    }

    async fn create_balance(&self, user: UserId, now: DateTime<Utc>) -> Result<Balance> {
        let mut state = self.shared.state.write();
        let balance = state.balances.entry(user).or_insert_with(|| Balance {
            user_id: user,
            amount: Decimal::ZERO,
            updated_at: now,
        });
        Ok(balance.clone())
    }

    async fn get_balance(&self, user: UserId) -> Result<Option<Balance>> {
        Ok(self.read(|s| s.balances.get(&user).cloned()))
    }

    async fn user_ids(&self) -> Result<Vec<UserId>> {
        let mut users = self.read(|s| s.balances.keys().copied().collect::<Vec<_>>());
        users.sort();
        Ok(users)
    }

    async fn find_entry_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.read(|s| s.entry_by_reference(reference).cloned()))
    }

    async fn entries_for_user(&self, user: UserId, limit: usize) -> Result<Vec<LedgerEntry>> {
        Ok(self.read(|s| {
            s.entries
                .iter()
                .rev()
                .filter(|e| e.user_id == user)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn completed_sum(&self, user: UserId, kind: Option<EntryKind>) -> Result<Decimal> {
        Ok(self.read(|s| {
            s.entries
                .iter()
                .filter(|e| e.user_id == user && e.is_completed())
                .filter(|e| kind.map_or(true, |k| e.kind == k))
                .map(|e| e.amount)
                .sum()
        }))
    }

    async fn get_goal(&self, id: Uuid) -> Result<Option<Goal>> {
        Ok(self.read(|s| s.goals.get(&id).cloned()))
    }

    async fn goals_for_user(&self, user: UserId) -> Result<Vec<Goal>> {
        let mut goals: Vec<Goal> =
            self.read(|s| s.goals.values().filter(|g| g.user_id == user).cloned().collect());
        goals.sort_by_key(|g| (g.created_at, g.id));
        Ok(goals)
    }

    async fn auto_save_goals(&self) -> Result<Vec<Goal>> {
        let mut goals: Vec<Goal> = self.read(|s| {
            s.goals
                .values()
                .filter(|g| g.state == AccountState::Active && g.auto_save.is_some())
                .cloned()
                .collect()
        });
        goals.sort_by_key(|g| (g.created_at, g.id));
        Ok(goals)
    }

    async fn get_locked_deposit(&self, id: Uuid) -> Result<Option<LockedDeposit>> {
        Ok(self.read(|s| s.locked.get(&id).cloned()))
    }

    async fn locked_deposits_for_user(&self, user: UserId) -> Result<Vec<LockedDeposit>> {
        let mut locks: Vec<LockedDeposit> =
            self.read(|s| s.locked.values().filter(|l| l.user_id == user).cloned().collect());
        locks.sort_by_key(|l| (l.created_at, l.id));
        Ok(locks)
    }

    async fn matured_locked_deposits(&self, now: DateTime<Utc>) -> Result<Vec<LockedDeposit>> {
        let mut locks: Vec<LockedDeposit> = self.read(|s| {
            s.locked
                .values()
                .filter(|l| l.state == AccountState::Active && l.maturity_at <= now)
                .cloned()
                .collect()
        });
        locks.sort_by_key(|l| (l.maturity_at, l.id));
        Ok(locks)
    }

    async fn get_yield_position(&self, user: UserId) -> Result<Option<YieldPosition>> {
        Ok(self.read(|s| s.yields.get(&user).cloned()))
    }

    async fn transfers_for_user(&self, user: UserId, limit: usize) -> Result<Vec<P2pTransfer>> {
        Ok(self.read(|s| {
            s.transfers
                .iter()
                .rev()
                .filter(|t| t.sender_id == user || t.receiver_id == user)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn get_referral(&self, id: Uuid) -> Result<Option<Referral>> {
        Ok(self.read(|s| s.referrals.get(&id).cloned()))
    }

    async fn referral_for_referred(&self, referred: UserId) -> Result<Option<Referral>> {
        Ok(self.read(|s| {
            s.referrals
                .values()
                .find(|r| r.referred_id == referred)
                .cloned()
        }))
    }

    async fn referrals_by_referrer(&self, referrer: UserId, limit: usize) -> Result<Vec<Referral>> {
        let mut referrals: Vec<Referral> = self.read(|s| {
            s.referrals
                .values()
                .filter(|r| r.referrer_id == referrer)
                .cloned()
                .collect()
        });
        referrals.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        referrals.truncate(limit);
        Ok(referrals)
    }

    async fn referrer_totals(&self, referrer: UserId) -> Result<ReferrerTotals> {
        Ok(self.read(|s| {
            let mut totals = ReferrerTotals::empty(referrer);
            for referral in s.referrals.values().filter(|r| r.referrer_id == referrer) {
                totals.add(referral);
            }
            totals
        }))
    }

    async fn top_referrers(&self, limit: usize) -> Result<Vec<ReferrerTotals>> {
        let mut ranked: Vec<ReferrerTotals> = self.read(|s| {
            let mut by_referrer: HashMap<UserId, ReferrerTotals> = HashMap::new();
            for referral in s.referrals.values() {
                by_referrer
                    .entry(referral.referrer_id)
                    .or_insert_with(|| ReferrerTotals::empty(referral.referrer_id))
                    .add(referral);
            }
            by_referrer.into_values().collect()
        });
        ranked.sort_by(|a, b| {
            b.total_referred
                .cmp(&a.total_referred)
                .then(b.total_earned.cmp(&a.total_earned))
                .then(a.referrer_id.cmp(&b.referrer_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn get_payout(&self, id: Uuid) -> Result<Option<Payout>> {
        Ok(self.read(|s| s.payouts.get(&id).cloned()))
    }

    async fn payout_by_reference(&self, reference: &str) -> Result<Option<Payout>> {
        Ok(self.read(|s| {
            s.payouts
                .values()
                .find(|p| p.reference == reference)
                .cloned()
        }))
    }

    async fn payouts_with_status(&self, statuses: &[PayoutStatus]) -> Result<Vec<Payout>> {
        let mut payouts: Vec<Payout> = self.read(|s| {
            s.payouts
                .values()
                .filter(|p| statuses.contains(&p.status))
                .cloned()
                .collect()
        });
        payouts.sort_by_key(|p| (p.created_at, p.id));
        Ok(payouts)
    }
}

/// Writes buffered by a unit of work
#[derive(Default)]
struct Overlay {
    balances: HashMap<UserId, Balance>,
    entries: Vec<LedgerEntry>,
    finalized: HashMap<Uuid, (EntryStatus, Option<String>)>,
    goals: HashMap<Uuid, Goal>,
    locked: HashMap<Uuid, LockedDeposit>,
    yields: HashMap<UserId, YieldPosition>,
    transfers: Vec<P2pTransfer>,
    referrals: HashMap<Uuid, Referral>,
    payouts: HashMap<Uuid, Payout>,
}

/// Row locks held by one unit of work
///
/// Released together on drop; a lock-table entry nobody else references is
/// removed at the same time.
struct HeldLocks {
    shared: Arc<Shared>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        for (key, guard) in self.guards.drain() {
            drop(guard);
            self.shared.prune(&key);
        }
    }
}

impl Shared {
    /// Remove an idle lock-table entry
    fn prune(&self, key: &RowKey) {
        self.row_locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

struct MemoryUnit {
    shared: Arc<Shared>,
    held: HeldLocks,
    overlay: Overlay,
}

impl MemoryUnit {
    async fn acquire(&mut self, key: RowKey) -> Result<()> {
        if self.held.guards.contains_key(&key) {
            return Ok(());
        }
        let mutex = self
            .shared
            .row_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        match tokio::time::timeout(self.shared.lock_timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                self.held.guards.insert(key, guard);
                Ok(())
            }
            Err(_) => {
                self.shared.prune(&key);
                debug!("Row lock timed out on {:?}", key);
                Err(Error::Busy(format!("lock timeout on {:?}", key)))
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&MemoryState) -> R) -> R {
        f(&self.shared.state.read())
    }

    fn visible_balance(&self, user: UserId) -> Option<Balance> {
        self.overlay
            .balances
            .get(&user)
            .cloned()
            .or_else(|| self.read(|s| s.balances.get(&user).cloned()))
    }

    /// Entry as seen by this unit, buffered finalization applied
    fn visible_entry(&self, find: impl Fn(&LedgerEntry) -> bool) -> Option<LedgerEntry> {
        let mut entry = self
            .overlay
            .entries
            .iter()
            .find(|e| find(e))
            .cloned()
            .or_else(|| self.read(|s| s.entries.iter().find(|e| find(e)).cloned()))?;
        if let Some((status, memo)) = self.overlay.finalized.get(&entry.id) {
            entry.status = *status;
            if memo.is_some() {
                entry.memo = memo.clone();
            }
        }
        Some(entry)
    }

    fn apply(self) -> Result<()> {
        let MemoryUnit {
            shared,
            held,
            overlay,
        } = self;
        let mut state = shared.state.write();

        // unique keys are lock-guarded, so these checks only fail on misuse
        for entry in &overlay.entries {
            if let Some(reference) = &entry.external_reference {
                if state.references.contains_key(reference) {
                    return Err(Error::DuplicateReference(reference.clone()));
                }
            }
        }

        for (user, balance) in overlay.balances {
            state.balances.insert(user, balance);
        }
        for entry in overlay.entries {
            state.push_entry(entry)?;
        }
        for (id, (status, memo)) in overlay.finalized {
            if let Some(index) = state.entry_index.get(&id).copied() {
                let entry = &mut state.entries[index];
                entry.status = status;
                if memo.is_some() {
                    entry.memo = memo;
                }
            }
        }
        state.goals.extend(overlay.goals);
        state.locked.extend(overlay.locked);
        state.yields.extend(overlay.yields);
        state.transfers.extend(overlay.transfers);
        state.referrals.extend(overlay.referrals);
        state.payouts.extend(overlay.payouts);

        drop(state);
        drop(held);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn lock_balance(&mut self, user: UserId) -> Result<Balance> {
        self.acquire(RowKey::Balance(user)).await?;
        self.visible_balance(user)
            .ok_or_else(|| Error::NotFound(format!("balance for user {}", user)))
    }

    async fn write_balance(
        &mut self,
        _grant: &WriteGrant,
        user: UserId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut balance = self.lock_balance(user).await?;
        balance.amount = amount;
        balance.updated_at = now;
        self.overlay.balances.insert(user, balance);
        Ok(())
    }

    async fn insert_entry(&mut self, _grant: &WriteGrant, entry: &LedgerEntry) -> Result<()> {
        if let Some(reference) = &entry.external_reference {
            self.acquire(RowKey::Reference(reference.clone())).await?;
            let taken = self.overlay.entries.iter().any(|e| {
                e.external_reference.as_deref() == Some(reference.as_str())
            }) || self.read(|s| s.references.contains_key(reference));
            if taken {
                return Err(Error::DuplicateReference(reference.clone()));
            }
        }
        self.overlay.entries.push(entry.clone());
        Ok(())
    }

    async fn lock_entry_by_reference(&mut self, reference: &str) -> Result<Option<LedgerEntry>> {
        self.acquire(RowKey::Reference(reference.to_string())).await?;
        Ok(self.visible_entry(|e| e.external_reference.as_deref() == Some(reference)))
    }

    async fn finalize_entry(
        &mut self,
        _grant: &WriteGrant,
        entry_id: Uuid,
        status: EntryStatus,
        memo: Option<&str>,
    ) -> Result<()> {
        let entry = self
            .visible_entry(|e| e.id == entry_id)
            .ok_or_else(|| Error::NotFound(format!("ledger entry {}", entry_id)))?;
        if entry.status != EntryStatus::Pending {
            return Err(Error::InvalidState(format!(
                "entry {} is already {}",
                entry_id,
                entry.status.as_str()
            )));
        }
        self.overlay
            .finalized
            .insert(entry_id, (status, memo.map(str::to_string)));
        Ok(())
    }

    async fn lock_goal(&mut self, id: Uuid) -> Result<Goal> {
        self.acquire(RowKey::Goal(id)).await?;
        self.overlay
            .goals
            .get(&id)
            .cloned()
            .or_else(|| self.read(|s| s.goals.get(&id).cloned()))
            .ok_or_else(|| Error::NotFound(format!("goal {}", id)))
    }

    async fn save_goal(&mut self, goal: &Goal) -> Result<()> {
        self.acquire(RowKey::Goal(goal.id)).await?;
        self.overlay.goals.insert(goal.id, goal.clone());
        Ok(())
    }

    async fn lock_locked_deposit(&mut self, id: Uuid) -> Result<LockedDeposit> {
        self.acquire(RowKey::Lock(id)).await?;
        self.overlay
            .locked
            .get(&id)
            .cloned()
            .or_else(|| self.read(|s| s.locked.get(&id).cloned()))
            .ok_or_else(|| Error::NotFound(format!("locked deposit {}", id)))
    }

    async fn save_locked_deposit(&mut self, lock: &LockedDeposit) -> Result<()> {
        self.acquire(RowKey::Lock(lock.id)).await?;
        self.overlay.locked.insert(lock.id, lock.clone());
        Ok(())
    }

    async fn lock_yield_position(&mut self, user: UserId) -> Result<Option<YieldPosition>> {
        self.acquire(RowKey::Yield(user)).await?;
        Ok(self
            .overlay
            .yields
            .get(&user)
            .cloned()
            .or_else(|| self.read(|s| s.yields.get(&user).cloned())))
    }

    async fn save_yield_position(&mut self, position: &YieldPosition) -> Result<()> {
        let user = position.user_id;
        self.acquire(RowKey::Yield(user)).await?;
        let conflict = self.read(|s| s.yields.get(&user).map_or(false, |p| p.id != position.id));
        if conflict {
            return Err(Error::DuplicateReference(format!("yield position for user {}", user)));
        }
        self.overlay.yields.insert(user, position.clone());
        Ok(())
    }

    async fn insert_transfer(&mut self, transfer: &P2pTransfer) -> Result<()> {
        self.overlay.transfers.push(transfer.clone());
        Ok(())
    }

    async fn lock_referral(&mut self, id: Uuid) -> Result<Referral> {
        self.acquire(RowKey::Referral(id)).await?;
        self.overlay
            .referrals
            .get(&id)
            .cloned()
            .or_else(|| self.read(|s| s.referrals.get(&id).cloned()))
            .ok_or_else(|| Error::NotFound(format!("referral {}", id)))
    }

    async fn save_referral(&mut self, referral: &Referral) -> Result<()> {
        self.acquire(RowKey::Referral(referral.id)).await?;
        self.acquire(RowKey::Referred(referral.referred_id)).await?;
        let conflict = self.read(|s| {
            s.referrals
                .values()
                .any(|r| r.referred_id == referral.referred_id && r.id != referral.id)
        });
        if conflict {
            return Err(Error::DuplicateReference(format!(
                "referral of user {}",
                referral.referred_id
            )));
        }
        self.overlay.referrals.insert(referral.id, referral.clone());
        Ok(())
    }

    async fn lock_payout(&mut self, id: Uuid) -> Result<Payout> {
        self.acquire(RowKey::Payout(id)).await?;
        self.overlay
            .payouts
            .get(&id)
            .cloned()
            .or_else(|| self.read(|s| s.payouts.get(&id).cloned()))
            .ok_or_else(|| Error::NotFound(format!("payout {}", id)))
    }

    async fn save_payout(&mut self, payout: &Payout) -> Result<()> {
        self.acquire(RowKey::Payout(payout.id)).await?;
        self.acquire(RowKey::PayoutReference(payout.reference.clone()))
            .await?;
        let conflict = self.read(|s| {
            s.payouts
                .values()
                .any(|p| p.reference == payout.reference && p.id != payout.id)
        });
        if conflict {
            return Err(Error::DuplicateReference(payout.reference.clone()));
        }
        self.overlay.payouts.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        (*self).apply()
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}
