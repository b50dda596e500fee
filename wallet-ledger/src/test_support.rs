//! Shared fixtures for unit tests

use crate::clock::ManualClock;
use crate::config::LedgerConfig;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::store::MemoryStore;
use crate::types::{EntryKind, UserId};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Ledger over a fresh in-memory store, with a clock pinned to 2024-01-01
pub(crate) fn test_ledger() -> (Arc<Ledger>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_lock_timeout(Duration::from_millis(200)));
    let config = LedgerConfig {
        busy_retries: 1,
        busy_retry_delay_ms: 5,
    };
    let ledger = Ledger::new(store, clock.clone(), Metrics::new().unwrap(), &config);
    (Arc::new(ledger), clock)
}

/// Open a balance and deposit `amount` into it
pub(crate) async fn funded_user(ledger: &Ledger, amount: Decimal) -> UserId {
    let user = UserId::generate();
    ledger.open_account(user).await.unwrap();
    if !amount.is_zero() {
        ledger
            .apply_delta(user, amount, EntryKind::Deposit, None)
            .await
            .unwrap();
    }
    user
}
