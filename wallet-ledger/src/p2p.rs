//! Peer-to-peer transfers between two users' balances

use crate::config::P2pConfig;
use crate::integration::{Notification, NotificationKind, Notifier};
use crate::ledger::Ledger;
use crate::types::{normalize_amount, EntryKind, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Completed transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2pTransfer {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// P2P operations
pub struct P2pService {
    ledger: Arc<Ledger>,
    notifier: Arc<dyn Notifier>,
    config: P2pConfig,
}

impl P2pService {
    pub fn new(ledger: Arc<Ledger>, notifier: Arc<dyn Notifier>, config: P2pConfig) -> Self {
        Self {
            ledger,
            notifier,
            config,
        }
    }

    /// Fee charged on top of a transfer
    pub fn fee(&self) -> Decimal {
        self.config.fee
    }

    /// Move `amount` from sender to receiver; the sender also pays the fee
    pub async fn transfer(
        &self,
        sender: UserId,
        receiver: UserId,
        amount: Decimal,
        note: Option<&str>,
    ) -> Result<P2pTransfer> {
        let amount = normalize_amount(amount);
        if amount < self.config.min_amount {
            return Err(Error::InvalidAmount(format!(
                "minimum transfer is {} USDC",
                self.config.min_amount
            )));
        }
        if sender == receiver {
            return Err(Error::InvalidRequest("cannot transfer to yourself".to_string()));
        }
        let fee = self.config.fee;
        let note = note.map(str::trim).filter(|n| !n.is_empty());

        let transfer = self
            .ledger
            .with_busy_retry("p2p_transfer", move || async move {
                let mut tx = self.ledger.begin().await?;

                // ascending user id, so opposite transfers cannot deadlock
                let (first, second) = if sender < receiver {
                    (sender, receiver)
                } else {
                    (receiver, sender)
                };
                tx.lock_and_get_balance(first).await?;
                tx.lock_and_get_balance(second).await?;

                let transfer = P2pTransfer {
                    id: Uuid::now_v7(),
                    sender_id: sender,
                    receiver_id: receiver,
                    amount,
                    fee,
                    note: note.map(str::to_string),
                    created_at: tx.now(),
                };

                tx.apply_delta(sender, -(amount + fee), EntryKind::P2pSent, None, Some(transfer.id))
                    .await?;
                tx.apply_delta(receiver, amount, EntryKind::P2pReceived, None, Some(transfer.id))
                    .await?;
                tx.rows().insert_transfer(&transfer).await?;
                tx.commit().await?;
                Ok(transfer)
            })
            .await?;

        info!(
            "P2P transfer {}: {} from {} to {} (fee {})",
            transfer.id, amount, sender, receiver, fee
        );

        let notification = Notification::new(
            NotificationKind::P2pReceived,
            "Money received",
            format!("You received {} USDC", amount),
        );
        if let Err(e) = self.notifier.notify(receiver, notification).await {
            warn!("P2P notification for transfer {} failed: {}", transfer.id, e);
        }
        Ok(transfer)
    }

    /// Transfers sent or received by a user, newest first
    pub async fn history(&self, user: UserId, limit: usize) -> Result<Vec<P2pTransfer>> {
        self.ledger.store().transfers_for_user(user, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::mock::MemoryNotifier;
    use crate::test_support::{funded_user, test_ledger};
    use rust_decimal_macros::dec;

    fn service(ledger: Arc<Ledger>, fee: Decimal) -> (P2pService, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let config = P2pConfig {
            min_amount: dec!(0.01),
            fee,
        };
        (P2pService::new(ledger, notifier.clone(), config), notifier)
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_and_notifies() {
        let (ledger, _clock) = test_ledger();
        let alice = funded_user(&ledger, dec!(100)).await;
        let bob = funded_user(&ledger, dec!(0)).await;
        let (p2p, notifier) = service(ledger.clone(), Decimal::ZERO);

        let transfer = p2p.transfer(alice, bob, dec!(30), Some(" lunch ")).await.unwrap();

        assert_eq!(transfer.note.as_deref(), Some("lunch"));
        assert_eq!(ledger.get_balance(alice).await.unwrap(), dec!(70));
        assert_eq!(ledger.get_balance(bob).await.unwrap(), dec!(30));
        assert_eq!(notifier.sent_to(bob).len(), 1);

        let bob_entries = ledger.history(bob, 10).await.unwrap();
        assert_eq!(bob_entries.len(), 1);
        assert_eq!(bob_entries[0].kind, EntryKind::P2pReceived);
        assert_eq!(bob_entries[0].account_id, Some(transfer.id));
        assert_eq!(p2p.history(alice, 10).await.unwrap(), vec![transfer]);
    }

    #[tokio::test]
    async fn test_fee_is_charged_to_sender() {
        let (ledger, _clock) = test_ledger();
        let alice = funded_user(&ledger, dec!(10)).await;
        let bob = funded_user(&ledger, dec!(0)).await;
        let (p2p, _) = service(ledger.clone(), dec!(0.5));

        let err = p2p.transfer(alice, bob, dec!(10), None).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(ledger.get_balance(bob).await.unwrap(), Decimal::ZERO);

        p2p.transfer(alice, bob, dec!(9.5), None).await.unwrap();
        assert_eq!(ledger.get_balance(alice).await.unwrap(), Decimal::ZERO);
        assert_eq!(ledger.get_balance(bob).await.unwrap(), dec!(9.5));
    }

    #[tokio::test]
    async fn test_transfer_rules() {
        let (ledger, _clock) = test_ledger();
        let alice = funded_user(&ledger, dec!(10)).await;
        let (p2p, _) = service(ledger.clone(), Decimal::ZERO);

        assert!(matches!(
            p2p.transfer(alice, alice, dec!(1), None).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            p2p.transfer(alice, UserId::generate(), dec!(0.001), None).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            p2p.transfer(alice, UserId::generate(), dec!(1), None).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(ledger.get_balance(alice).await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn test_opposite_transfers_do_not_deadlock() {
        let (ledger, _clock) = test_ledger();
        let alice = funded_user(&ledger, dec!(100)).await;
        let bob = funded_user(&ledger, dec!(100)).await;
        let (p2p, _) = service(ledger.clone(), Decimal::ZERO);
        let p2p = Arc::new(p2p);

        let mut handles = Vec::new();
        for i in 0..10 {
            let p2p = p2p.clone();
            let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
            handles.push(tokio::spawn(async move {
                p2p.transfer(from, to, dec!(1), None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.get_balance(alice).await.unwrap(), dec!(100));
        assert_eq!(ledger.get_balance(bob).await.unwrap(), dec!(100));
    }
}
