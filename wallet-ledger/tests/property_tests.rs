//! Property-based tests for balance invariants
//!
//! - A balance is never negative
//! - A balance equals the sum of its completed entries
//! - P2P transfers conserve the total across users
//! - A reference credits at most once

use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use wallet_ledger::config::{LedgerConfig, P2pConfig};
use wallet_ledger::integration::mock::MemoryNotifier;
use wallet_ledger::{EntryKind, Error, Ledger, MemoryStore, Metrics, P2pService, SystemClock, UserId};

/// Signed amounts with up to 7 decimal places
fn delta_strategy() -> impl Strategy<Value = Decimal> {
    (-5_000_0000000i64..10_000_0000000i64)
        .prop_filter("non-zero", |v| *v != 0)
        .prop_map(|units| Decimal::new(units, 7))
}

/// Positive amounts in cents
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..50_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn create_test_ledger() -> Arc<Ledger> {
    let config = LedgerConfig {
        busy_retries: 1,
        busy_retry_delay_ms: 5,
    };
    Arc::new(Ledger::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Metrics::new().unwrap(),
        &config,
    ))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every accepted delta keeps the balance non-negative and in
    /// step with the ledger
    #[test]
    fn prop_balance_matches_ledger(deltas in prop::collection::vec(delta_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let user = UserId::generate();
            ledger.open_account(user).await.unwrap();

            let mut expected = Decimal::ZERO;
            for delta in deltas {
                match ledger.apply_delta(user, delta, EntryKind::Deposit, None).await {
                    Ok(entry) => {
                        prop_assert_eq!(entry.amount, delta);
                        expected += delta;
                    }
                    Err(Error::InsufficientFunds { available, .. }) => {
                        prop_assert!(expected + delta < Decimal::ZERO);
                        prop_assert_eq!(available, expected);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
                let balance = ledger.get_balance(user).await.unwrap();
                prop_assert!(balance >= Decimal::ZERO);
                prop_assert_eq!(balance, expected);
            }

            let report = ledger.audit(user).await.unwrap();
            prop_assert!(report.is_consistent());
            Ok(())
        })?;
    }

    /// Property: transfers between users never create or destroy funds
    #[test]
    fn prop_transfers_conserve_total(
        transfers in prop::collection::vec((0usize..3, 0usize..3, amount_strategy()), 1..30)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let p2p = P2pService::new(
                ledger.clone(),
                Arc::new(MemoryNotifier::new()),
                P2pConfig::default(),
            );

            let mut users = Vec::new();
            for _ in 0..3 {
                let user = UserId::generate();
                ledger.open_account(user).await.unwrap();
                ledger
                    .apply_delta(user, Decimal::from(200), EntryKind::Deposit, None)
                    .await
                    .unwrap();
                users.push(user);
            }

            for (from, to, amount) in transfers {
                if from == to {
                    continue;
                }
                match p2p.transfer(users[from], users[to], amount, None).await {
                    Ok(_) | Err(Error::InsufficientFunds { .. }) => {}
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            }

            let mut total = Decimal::ZERO;
            for user in &users {
                let balance = ledger.get_balance(*user).await.unwrap();
                prop_assert!(balance >= Decimal::ZERO);
                prop_assert!(ledger.audit(*user).await.unwrap().is_consistent());
                total += balance;
            }
            prop_assert_eq!(total, Decimal::from(600));
            Ok(())
        })?;
    }

    /// Property: repeating a referenced credit applies it once
    #[test]
    fn prop_reference_credits_once(amount in amount_strategy(), repeats in 1usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let user = UserId::generate();
            ledger.open_account(user).await.unwrap();

            for _ in 0..repeats {
                ledger
                    .apply_delta(user, amount, EntryKind::Deposit, Some("TX-PROP"))
                    .await
                    .unwrap();
            }

            prop_assert_eq!(ledger.get_balance(user).await.unwrap(), amount);
            prop_assert_eq!(ledger.history(user, 10).await.unwrap().len(), 1);
            Ok(())
        })?;
    }
}
