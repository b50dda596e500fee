//! End-to-end scenarios over the in-memory store
//!
//! Each scenario wires the services the way the worker does, with a manual
//! clock and scripted external legs.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use wallet_ledger::config::{LedgerConfig, LimitsConfig, LockedConfig, P2pConfig};
use wallet_ledger::integration::mock::{MemoryNotifier, MockInboundLeg, MockPayoutRail};
use wallet_ledger::integration::{InboundCredit, LegOutcome};
use wallet_ledger::payouts::{PayoutKind, PayoutOrder, PayoutStatus};
use wallet_ledger::reconciliation::CreditOutcome;
use wallet_ledger::{
    CreditGuard, EntryKind, Error, Ledger, LockedService, ManualClock, MemoryStore, Metrics,
    P2pService, PayoutService, UserId,
};

struct TestEnvironment {
    ledger: Arc<Ledger>,
    clock: Arc<ManualClock>,
    notifier: Arc<MemoryNotifier>,
}

impl TestEnvironment {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single().unwrap(),
        ));
        let config = LedgerConfig {
            busy_retries: 2,
            busy_retry_delay_ms: 5,
        };
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            Metrics::new().unwrap(),
            &config,
        ));
        Self {
            ledger,
            clock,
            notifier: Arc::new(MemoryNotifier::new()),
        }
    }

    async fn user_with(&self, amount: Decimal) -> UserId {
        let user = UserId::generate();
        self.ledger.open_account(user).await.unwrap();
        if !amount.is_zero() {
            self.ledger
                .apply_delta(user, amount, EntryKind::Deposit, None)
                .await
                .unwrap();
        }
        user
    }

    async fn balance(&self, user: UserId) -> Decimal {
        self.ledger.get_balance(user).await.unwrap()
    }
}

#[tokio::test]
async fn test_p2p_transfer_between_two_users() {
    let env = TestEnvironment::new();
    let a = env.user_with(dec!(100)).await;
    let b = env.user_with(Decimal::ZERO).await;
    let p2p = P2pService::new(env.ledger.clone(), env.notifier.clone(), P2pConfig::default());

    p2p.transfer(a, b, dec!(30), Some("rent share")).await.unwrap();

    assert_eq!(env.balance(a).await, dec!(70));
    assert_eq!(env.balance(b).await, dec!(30));
    assert_eq!(env.notifier.sent_to(b).len(), 1);
    assert!(env.ledger.audit_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_locked_deposit_lifecycle() {
    let env = TestEnvironment::new();
    let user = env.user_with(dec!(50)).await;
    let locks = LockedService::new(env.ledger.clone(), env.notifier.clone(), LockedConfig::default());

    let lock = locks.create_lock(user, dec!(50), 30, false).await.unwrap();
    assert_eq!(env.balance(user).await, Decimal::ZERO);

    env.clock.advance(Duration::days(15));
    let err = locks.withdraw(user, lock.id).await.unwrap_err();
    assert!(matches!(err, Error::NotMatured { .. }));
    assert_eq!(env.balance(user).await, Decimal::ZERO);

    env.clock.advance(Duration::days(15));
    let withdrawn = locks.withdraw(user, lock.id).await.unwrap();
    assert_eq!(withdrawn.interest_earned, dec!(0.3287671));
    assert_eq!(env.balance(user).await, dec!(50.3287671));

    let again = locks.withdraw(user, lock.id).await.unwrap_err();
    assert!(matches!(again, Error::InvalidState(_)));
    assert_eq!(env.balance(user).await, dec!(50.3287671));
}

#[tokio::test]
async fn test_concurrent_webhook_credits_once() {
    let env = TestEnvironment::new();
    let user = env.user_with(Decimal::ZERO).await;
    let leg = Arc::new(MockInboundLeg::new().with_latency(std::time::Duration::from_millis(20)));
    let guard = Arc::new(CreditGuard::new(
        env.ledger.clone(),
        leg.clone(),
        LimitsConfig::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let guard = guard.clone();
        handles.push(tokio::spawn(async move {
            guard
                .process_external_credit(InboundCredit::new(user, dec!(5000), "TX123"))
                .await
        }));
    }

    // a loser either replays the credit or sees the winner's claim in flight
    let mut credited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) if !receipt.replayed => {
                assert_eq!(receipt.outcome, CreditOutcome::Credited);
                credited += 1;
            }
            Ok(receipt) => assert_eq!(receipt.outcome, CreditOutcome::Credited),
            Err(Error::ExternalUnconfirmed(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(credited, 1);
    assert_eq!(leg.calls(), 1);
    assert_eq!(env.balance(user).await, dec!(5000));

    // a late redelivery sees the completed credit
    let late = guard
        .process_external_credit(InboundCredit::new(user, dec!(5000), "TX123"))
        .await
        .unwrap();
    assert!(late.replayed);
    assert_eq!(late.outcome, CreditOutcome::Credited);
}

#[tokio::test]
async fn test_concurrent_withdrawals_cannot_overdraw() {
    let env = TestEnvironment::new();
    let user = env.user_with(dec!(30)).await;
    let payouts = Arc::new(PayoutService::new(
        env.ledger.clone(),
        Arc::new(MockPayoutRail::new()),
        env.notifier.clone(),
    ));

    let mut handles = Vec::new();
    for i in 0..2 {
        let payouts = payouts.clone();
        handles.push(tokio::spawn(async move {
            payouts
                .execute(PayoutOrder {
                    user_id: user,
                    kind: PayoutKind::BankWithdrawal,
                    destination: "NG-0123456789".to_string(),
                    amount: dec!(30),
                    reference: format!("WD-{}", i),
                })
                .await
        }));
    }

    let mut ok = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::InsufficientFunds { .. }) => insufficient += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!((ok, insufficient), (1, 1));
    assert_eq!(env.balance(user).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_failed_payout_is_compensated() {
    let env = TestEnvironment::new();
    let user = env.user_with(dec!(80)).await;
    let rail = Arc::new(MockPayoutRail::new());
    let payouts = PayoutService::new(env.ledger.clone(), rail.clone(), env.notifier.clone());
    rail.push_outcome(LegOutcome::Failed {
        reason: "account closed".to_string(),
    });

    let order = PayoutOrder {
        user_id: user,
        kind: PayoutKind::BillPayment,
        destination: "DSTV-12345".to_string(),
        amount: dec!(25),
        reference: "BILL-1".to_string(),
    };
    let err = payouts.execute(order.clone()).await.unwrap_err();
    assert!(matches!(err, Error::ExternalFailed(_)));
    assert_eq!(env.balance(user).await, dec!(80));

    // retrying the same order returns the reversed payout, no second call
    let replay = payouts.execute(order).await.unwrap();
    assert_eq!(replay.status, PayoutStatus::Reversed);
    assert_eq!(rail.calls(), 1);
    assert!(env.ledger.audit(user).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_unknown_payout_waits_for_reconciliation() {
    let env = TestEnvironment::new();
    let user = env.user_with(dec!(40)).await;
    let rail = Arc::new(MockPayoutRail::new());
    let payouts = PayoutService::new(env.ledger.clone(), rail.clone(), env.notifier.clone());
    rail.push_outcome(LegOutcome::Unknown);

    let err = payouts
        .execute(PayoutOrder {
            user_id: user,
            kind: PayoutKind::ChainWithdrawal,
            destination: "GBXEXAMPLE".to_string(),
            amount: dec!(15),
            reference: "CW-1".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExternalUnconfirmed(_)));
    assert_eq!(env.balance(user).await, dec!(25));

    let open = payouts.pending_reconciliation().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, PayoutStatus::Unconfirmed);
    assert_eq!(env.ledger.metrics().unconfirmed_payouts.get(), 1);

    let resolved = payouts
        .resolve(
            open[0].id,
            LegOutcome::Failed {
                reason: "expired".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, PayoutStatus::Reversed);
    assert_eq!(env.balance(user).await, dec!(40));
    assert!(payouts.pending_reconciliation().await.unwrap().is_empty());
    assert_eq!(env.ledger.metrics().unconfirmed_payouts.get(), 0);
}
