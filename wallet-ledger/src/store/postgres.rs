//! PostgreSQL store
//!
//! Every unit of work is one database transaction. Row locks are
//! `SELECT ... FOR UPDATE`, bounded by a transaction-local `lock_timeout`;
//! unique indexes on entry reference, payout reference, referred user and
//! yield owner turn concurrent duplicates into `DuplicateReference`.

use super::{Store, UnitOfWork};
use crate::accounts::earn::YieldPosition;
use crate::accounts::goals::{AutoSave, AutoSaveFrequency, Goal};
use crate::accounts::locked::LockedDeposit;
use crate::accounts::AccountState;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::ledger::WriteGrant;
use crate::p2p::P2pTransfer;
use crate::payouts::{Payout, PayoutKind, PayoutStatus};
use crate::referral::{Referral, ReferralStatus, ReferrerTotals};
use crate::types::{Balance, EntryKind, EntryStatus, LedgerEntry, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const ENTRY_COLUMNS: &str =
    "id, user_id, kind, amount, external_reference, account_id, status, memo, created_at";
const GOAL_COLUMNS: &str = "id, user_id, name, target_amount, current_amount, deadline, \
     auto_save_amount, auto_save_frequency, last_auto_save_at, milestone, state, created_at, updated_at";
const LOCK_COLUMNS: &str = "id, user_id, principal, apy, duration_days, start_at, maturity_at, \
     auto_renew, interest_earned, state, renewed_from, created_at, updated_at";
const YIELD_COLUMNS: &str =
    "id, user_id, supplied, accrued, apy, last_accrual_at, state, created_at, updated_at";
const TRANSFER_COLUMNS: &str = "id, sender_id, receiver_id, amount, fee, note, created_at";
const REFERRAL_COLUMNS: &str =
    "id, referrer_id, referred_id, reward_amount, status, created_at, paid_at";
const REFERRER_TOTALS: &str = "COUNT(*) AS total_referred, \
     COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
     COALESCE(SUM(reward_amount) FILTER (WHERE status = 'paid'), 0) AS total_earned";
const PAYOUT_COLUMNS: &str = "id, user_id, kind, destination, amount, reference, status, \
     external_id, failure_reason, created_at, resolved_at";

/// Store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgStore {
    /// Connect a pool sized from the database config
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            "Connected to database (max {} connections)",
            config.max_connections
        );
        Ok(Self::from_pool(pool, config.lock_timeout_ms))
    }

    pub fn from_pool(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn parse_column<T>(value: &str, column: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    parse(value).ok_or_else(|| Error::Internal(format!("unexpected {} value '{}'", column, value)))
}

fn user(row: &PgRow, column: &str) -> Result<UserId> {
    Ok(UserId::new(row.try_get::<Uuid, _>(column)?))
}

fn balance_from_row(row: &PgRow) -> Result<Balance> {
    Ok(Balance {
        user_id: user(row, "user_id")?,
        amount: row.try_get("amount")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: user(row, "user_id")?,
        kind: parse_column(&kind, "kind", EntryKind::parse)?,
        amount: row.try_get("amount")?,
        external_reference: row.try_get("external_reference")?,
        account_id: row.try_get("account_id")?,
        status: parse_column(&status, "status", EntryStatus::parse)?,
        memo: row.try_get("memo")?,
        created_at: row.try_get("created_at")?,
    })
}

fn goal_from_row(row: &PgRow) -> Result<Goal> {
    let state: String = row.try_get("state")?;
    let auto_amount: Option<Decimal> = row.try_get("auto_save_amount")?;
    let auto_frequency: Option<String> = row.try_get("auto_save_frequency")?;
    let auto_save = match (auto_amount, auto_frequency) {
        (Some(amount), Some(frequency)) => Some(AutoSave {
            amount,
            frequency: parse_column(&frequency, "auto_save_frequency", AutoSaveFrequency::parse)?,
        }),
        _ => None,
    };
    let milestone: i16 = row.try_get("milestone")?;
    Ok(Goal {
        id: row.try_get("id")?,
        user_id: user(row, "user_id")?,
        name: row.try_get("name")?,
        target_amount: row.try_get("target_amount")?,
        current_amount: row.try_get("current_amount")?,
        deadline: row.try_get("deadline")?,
        auto_save,
        last_auto_save_at: row.try_get("last_auto_save_at")?,
        milestone: u8::try_from(milestone)
            .map_err(|_| Error::Internal(format!("goal milestone {} out of range", milestone)))?,
        state: parse_column(&state, "state", AccountState::parse)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn lock_from_row(row: &PgRow) -> Result<LockedDeposit> {
    let state: String = row.try_get("state")?;
    let days: i32 = row.try_get("duration_days")?;
    Ok(LockedDeposit {
        id: row.try_get("id")?,
        user_id: user(row, "user_id")?,
        principal: row.try_get("principal")?,
        apy: row.try_get("apy")?,
        duration_days: u32::try_from(days)
            .map_err(|_| Error::Internal(format!("lock duration {} out of range", days)))?,
        start_at: row.try_get("start_at")?,
        maturity_at: row.try_get("maturity_at")?,
        auto_renew: row.try_get("auto_renew")?,
        interest_earned: row.try_get("interest_earned")?,
        state: parse_column(&state, "state", AccountState::parse)?,
        renewed_from: row.try_get("renewed_from")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn yield_from_row(row: &PgRow) -> Result<YieldPosition> {
    let state: String = row.try_get("state")?;
    Ok(YieldPosition {
        id: row.try_get("id")?,
        user_id: user(row, "user_id")?,
        supplied: row.try_get("supplied")?,
        accrued: row.try_get("accrued")?,
        apy: row.try_get("apy")?,
        last_accrual_at: row.try_get("last_accrual_at")?,
        state: parse_column(&state, "state", AccountState::parse)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<P2pTransfer> {
    Ok(P2pTransfer {
        id: row.try_get("id")?,
        sender_id: user(row, "sender_id")?,
        receiver_id: user(row, "receiver_id")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        note: row.try_get("note")?,
        created_at: row.try_get("created_at")?,
    })
}

fn referral_from_row(row: &PgRow) -> Result<Referral> {
    let status: String = row.try_get("status")?;
    Ok(Referral {
        id: row.try_get("id")?,
        referrer_id: user(row, "referrer_id")?,
        referred_id: user(row, "referred_id")?,
        reward_amount: row.try_get("reward_amount")?,
        status: parse_column(&status, "status", ReferralStatus::parse)?,
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
    })
}

fn totals_from_row(row: &PgRow, referrer_id: UserId) -> Result<ReferrerTotals> {
    let total_referred: i64 = row.try_get("total_referred")?;
    let pending: i64 = row.try_get("pending")?;
    Ok(ReferrerTotals {
        referrer_id,
        total_referred: total_referred.max(0) as u64,
        pending: pending.max(0) as u64,
        total_earned: row.try_get("total_earned")?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<Payout> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Payout {
        id: row.try_get("id")?,
        user_id: user(row, "user_id")?,
        kind: parse_column(&kind, "kind", PayoutKind::parse)?,
        destination: row.try_get("destination")?,
        amount: row.try_get("amount")?,
        reference: row.try_get("reference")?,
        status: parse_column(&status, "status", PayoutStatus::parse)?,
        external_id: row.try_get("external_id")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgUnit { tx }))
    }

    async fn create_balance(&self, user: UserId, now: DateTime<Utc>) -> Result<Balance> {
        sqlx::query(
            r#"
            INSERT INTO balances (user_id, amount, updated_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT user_id, amount, updated_at FROM balances WHERE user_id = $1")
            .bind(user.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        balance_from_row(&row)
    }

    async fn get_balance(&self, user: UserId) -> Result<Option<Balance>> {
        let row = sqlx::query("SELECT user_id, amount, updated_at FROM balances WHERE user_id = $1")
            .bind(user.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn user_ids(&self) -> Result<Vec<UserId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT user_id FROM balances ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(UserId::new).collect())
    }

    async fn find_entry_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE external_reference = $1",
            ENTRY_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn entries_for_user(&self, user: UserId, limit: usize) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            ENTRY_COLUMNS
        ))
        .bind(user.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn completed_sum(&self, user: UserId, kind: Option<EntryKind>) -> Result<Decimal> {
        let sum: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM ledger_entries
            WHERE user_id = $1 AND status = 'completed' AND ($2::TEXT IS NULL OR kind = $2)
            "#,
        )
        .bind(user.as_uuid())
        .bind(kind.map(|k| k.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn get_goal(&self, id: Uuid) -> Result<Option<Goal>> {
        let row = sqlx::query(&format!("SELECT {} FROM goals WHERE id = $1", GOAL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(goal_from_row).transpose()
    }

    async fn goals_for_user(&self, user: UserId) -> Result<Vec<Goal>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM goals WHERE user_id = $1 ORDER BY created_at, id",
            GOAL_COLUMNS
        ))
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(goal_from_row).collect()
    }

    async fn auto_save_goals(&self) -> Result<Vec<Goal>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM goals WHERE state = 'active' AND auto_save_amount IS NOT NULL \
             ORDER BY created_at, id",
            GOAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(goal_from_row).collect()
    }

    async fn get_locked_deposit(&self, id: Uuid) -> Result<Option<LockedDeposit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM locked_deposits WHERE id = $1",
            LOCK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn locked_deposits_for_user(&self, user: UserId) -> Result<Vec<LockedDeposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM locked_deposits WHERE user_id = $1 ORDER BY created_at, id",
            LOCK_COLUMNS
        ))
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn matured_locked_deposits(&self, now: DateTime<Utc>) -> Result<Vec<LockedDeposit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM locked_deposits WHERE state = 'active' AND maturity_at <= $1 \
             ORDER BY maturity_at, id",
            LOCK_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn get_yield_position(&self, user: UserId) -> Result<Option<YieldPosition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM yield_positions WHERE user_id = $1",
            YIELD_COLUMNS
        ))
        .bind(user.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(yield_from_row).transpose()
    }

    async fn transfers_for_user(&self, user: UserId, limit: usize) -> Result<Vec<P2pTransfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM p2p_transfers WHERE sender_id = $1 OR receiver_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            TRANSFER_COLUMNS
        ))
        .bind(user.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn get_referral(&self, id: Uuid) -> Result<Option<Referral>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM referrals WHERE id = $1",
            REFERRAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(referral_from_row).transpose()
    }

    async fn referral_for_referred(&self, referred: UserId) -> Result<Option<Referral>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM referrals WHERE referred_id = $1",
            REFERRAL_COLUMNS
        ))
        .bind(referred.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(referral_from_row).transpose()
    }

    async fn referrals_by_referrer(&self, referrer: UserId, limit: usize) -> Result<Vec<Referral>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM referrals WHERE referrer_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            REFERRAL_COLUMNS
        ))
        .bind(referrer.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(referral_from_row).collect()
    }

    async fn referrer_totals(&self, referrer: UserId) -> Result<ReferrerTotals> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM referrals WHERE referrer_id = $1",
            REFERRER_TOTALS
        ))
        .bind(referrer.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        totals_from_row(&row, referrer)
    }

    async fn top_referrers(&self, limit: usize) -> Result<Vec<ReferrerTotals>> {
        let rows = sqlx::query(&format!(
            "SELECT referrer_id, {} FROM referrals GROUP BY referrer_id \
             ORDER BY total_referred DESC, total_earned DESC, referrer_id LIMIT $1",
            REFERRER_TOTALS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| totals_from_row(row, user(row, "referrer_id")?))
            .collect()
    }

    async fn get_payout(&self, id: Uuid) -> Result<Option<Payout>> {
        let row = sqlx::query(&format!("SELECT {} FROM payouts WHERE id = $1", PAYOUT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(payout_from_row).transpose()
    }

    async fn payout_by_reference(&self, reference: &str) -> Result<Option<Payout>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payouts WHERE reference = $1",
            PAYOUT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payout_from_row).transpose()
    }

    async fn payouts_with_status(&self, statuses: &[PayoutStatus]) -> Result<Vec<Payout>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payouts WHERE status = ANY($1) ORDER BY created_at, id",
            PAYOUT_COLUMNS
        ))
        .bind(statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payout_from_row).collect()
    }
}

/// One database transaction; dropping it rolls back
struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn lock_balance(&mut self, user: UserId) -> Result<Balance> {
        let row = sqlx::query(
            "SELECT user_id, amount, updated_at FROM balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("balance for user {}", user)))?;
        balance_from_row(&row)
    }

    async fn write_balance(
        &mut self,
        _grant: &WriteGrant,
        user: UserId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE balances SET amount = $2, updated_at = $3 WHERE user_id = $1")
            .bind(user.as_uuid())
            .bind(amount)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("balance for user {}", user)));
        }
        Ok(())
    }

    async fn insert_entry(&mut self, _grant: &WriteGrant, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO ledger_entries ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            ENTRY_COLUMNS
        ))
        .bind(entry.id)
        .bind(entry.user_id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(&entry.external_reference)
        .bind(entry.account_id)
        .bind(entry.status.as_str())
        .bind(&entry.memo)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_entry_by_reference(&mut self, reference: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE external_reference = $1 FOR UPDATE",
            ENTRY_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn finalize_entry(
        &mut self,
        _grant: &WriteGrant,
        entry_id: Uuid,
        status: EntryStatus,
        memo: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET status = $2, memo = COALESCE($3, memo)
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(entry_id)
        .bind(status.as_str())
        .bind(memo)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(format!("entry {} is not pending", entry_id)));
        }
        Ok(())
    }

    async fn lock_goal(&mut self, id: Uuid) -> Result<Goal> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM goals WHERE id = $1 FOR UPDATE",
            GOAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("goal {}", id)))?;
        goal_from_row(&row)
    }

    async fn save_goal(&mut self, goal: &Goal) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO goals ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                target_amount = EXCLUDED.target_amount,
                current_amount = EXCLUDED.current_amount,
                deadline = EXCLUDED.deadline,
                auto_save_amount = EXCLUDED.auto_save_amount,
                auto_save_frequency = EXCLUDED.auto_save_frequency,
                last_auto_save_at = EXCLUDED.last_auto_save_at,
                milestone = EXCLUDED.milestone,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
            GOAL_COLUMNS
        ))
        .bind(goal.id)
        .bind(goal.user_id.as_uuid())
        .bind(&goal.name)
        .bind(goal.target_amount)
        .bind(goal.current_amount)
        .bind(goal.deadline)
        .bind(goal.auto_save.map(|a| a.amount))
        .bind(goal.auto_save.map(|a| a.frequency.as_str()))
        .bind(goal.last_auto_save_at)
        .bind(i16::from(goal.milestone))
        .bind(goal.state.as_str())
        .bind(goal.created_at)
        .bind(goal.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_locked_deposit(&mut self, id: Uuid) -> Result<LockedDeposit> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM locked_deposits WHERE id = $1 FOR UPDATE",
            LOCK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("locked deposit {}", id)))?;
        lock_from_row(&row)
    }

    async fn save_locked_deposit(&mut self, lock: &LockedDeposit) -> Result<()> {
        let days = i32::try_from(lock.duration_days)
            .map_err(|_| Error::InvalidRequest(format!("lock duration {} too long", lock.duration_days)))?;
        sqlx::query(&format!(
            r#"
            INSERT INTO locked_deposits ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                auto_renew = EXCLUDED.auto_renew,
                interest_earned = EXCLUDED.interest_earned,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
            LOCK_COLUMNS
        ))
        .bind(lock.id)
        .bind(lock.user_id.as_uuid())
        .bind(lock.principal)
        .bind(lock.apy)
        .bind(days)
        .bind(lock.start_at)
        .bind(lock.maturity_at)
        .bind(lock.auto_renew)
        .bind(lock.interest_earned)
        .bind(lock.state.as_str())
        .bind(lock.renewed_from)
        .bind(lock.created_at)
        .bind(lock.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_yield_position(&mut self, user: UserId) -> Result<Option<YieldPosition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM yield_positions WHERE user_id = $1 FOR UPDATE",
            YIELD_COLUMNS
        ))
        .bind(user.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(yield_from_row).transpose()
    }

    async fn save_yield_position(&mut self, position: &YieldPosition) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO yield_positions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                supplied = EXCLUDED.supplied,
                accrued = EXCLUDED.accrued,
                apy = EXCLUDED.apy,
                last_accrual_at = EXCLUDED.last_accrual_at,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
            YIELD_COLUMNS
        ))
        .bind(position.id)
        .bind(position.user_id.as_uuid())
        .bind(position.supplied)
        .bind(position.accrued)
        .bind(position.apy)
        .bind(position.last_accrual_at)
        .bind(position.state.as_str())
        .bind(position.created_at)
        .bind(position.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_transfer(&mut self, transfer: &P2pTransfer) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO p2p_transfers ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            TRANSFER_COLUMNS
        ))
        .bind(transfer.id)
        .bind(transfer.sender_id.as_uuid())
        .bind(transfer.receiver_id.as_uuid())
        .bind(transfer.amount)
        .bind(transfer.fee)
        .bind(&transfer.note)
        .bind(transfer.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_referral(&mut self, id: Uuid) -> Result<Referral> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM referrals WHERE id = $1 FOR UPDATE",
            REFERRAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("referral {}", id)))?;
        referral_from_row(&row)
    }

    async fn save_referral(&mut self, referral: &Referral) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO referrals ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                paid_at = EXCLUDED.paid_at
            "#,
            REFERRAL_COLUMNS
        ))
        .bind(referral.id)
        .bind(referral.referrer_id.as_uuid())
        .bind(referral.referred_id.as_uuid())
        .bind(referral.reward_amount)
        .bind(referral.status.as_str())
        .bind(referral.created_at)
        .bind(referral.paid_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_payout(&mut self, id: Uuid) -> Result<Payout> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payouts WHERE id = $1 FOR UPDATE",
            PAYOUT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("payout {}", id)))?;
        payout_from_row(&row)
    }

    async fn save_payout(&mut self, payout: &Payout) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO payouts ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                external_id = EXCLUDED.external_id,
                failure_reason = EXCLUDED.failure_reason,
                resolved_at = EXCLUDED.resolved_at
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(payout.id)
        .bind(payout.user_id.as_uuid())
        .bind(payout.kind.as_str())
        .bind(&payout.destination)
        .bind(payout.amount)
        .bind(&payout.reference)
        .bind(payout.status.as_str())
        .bind(&payout.external_id)
        .bind(&payout.failure_reason)
        .bind(payout.created_at)
        .bind(payout.resolved_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
