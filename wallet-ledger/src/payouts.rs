//! Outbound payouts: bank and chain withdrawals, bill payments, trade buys
//!
//! The debit is reserved and committed before the external rail is called,
//! so no row lock is held across the network call. A confirmed failure is
//! compensated with a `reversal` credit; an indeterminate outcome leaves the
//! debit standing and parks the payout as `unconfirmed` until [`resolve`]
//! settles it.
//!
//! [`resolve`]: PayoutService::resolve

use crate::integration::{LegOutcome, Notification, NotificationKind, Notifier, PayoutRail, PayoutRequest};
use crate::ledger::Ledger;
use crate::types::{normalize_amount, EntryKind, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    BankWithdrawal,
    ChainWithdrawal,
    BillPayment,
    TradeBuy,
}

impl PayoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutKind::BankWithdrawal => "bank_withdrawal",
            PayoutKind::ChainWithdrawal => "chain_withdrawal",
            PayoutKind::BillPayment => "bill_payment",
            PayoutKind::TradeBuy => "trade_buy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bank_withdrawal" => Some(PayoutKind::BankWithdrawal),
            "chain_withdrawal" => Some(PayoutKind::ChainWithdrawal),
            "bill_payment" => Some(PayoutKind::BillPayment),
            "trade_buy" => Some(PayoutKind::TradeBuy),
            _ => None,
        }
    }

    /// Ledger entry kind of the reserving debit
    pub fn entry_kind(&self) -> EntryKind {
        match self {
            PayoutKind::BankWithdrawal | PayoutKind::ChainWithdrawal => EntryKind::Withdrawal,
            PayoutKind::BillPayment => EntryKind::BillPayment,
            PayoutKind::TradeBuy => EntryKind::TradeBuy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// Debit committed, rail not yet answered
    Reserved,
    Confirmed,
    /// Rail failed; debit compensated
    Reversed,
    /// Rail outcome unknown; debit stands
    Unconfirmed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Reserved => "reserved",
            PayoutStatus::Confirmed => "confirmed",
            PayoutStatus::Reversed => "reversed",
            PayoutStatus::Unconfirmed => "unconfirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(PayoutStatus::Reserved),
            "confirmed" => Some(PayoutStatus::Confirmed),
            "reversed" => Some(PayoutStatus::Reversed),
            "unconfirmed" => Some(PayoutStatus::Unconfirmed),
            _ => None,
        }
    }

    /// Whether reconciliation still has to settle the payout
    pub fn is_open(&self) -> bool {
        matches!(self, PayoutStatus::Reserved | PayoutStatus::Unconfirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: PayoutKind,
    /// Bank account, chain address, biller or ticker
    pub destination: String,
    pub amount: Decimal,
    /// Caller-supplied idempotency key
    pub reference: String,
    pub status: PayoutStatus,
    pub external_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Payout {
    /// Reference of the compensating credit
    pub fn reversal_reference(&self) -> String {
        format!("{}:reversal", self.reference)
    }

    fn request(&self) -> PayoutRequest {
        PayoutRequest {
            payout_id: self.id,
            user_id: self.user_id,
            kind: self.kind,
            destination: self.destination.clone(),
            amount: self.amount,
            reference: self.reference.clone(),
        }
    }
}

/// Payout to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutOrder {
    pub user_id: UserId,
    pub kind: PayoutKind,
    pub destination: String,
    pub amount: Decimal,
    pub reference: String,
}

pub struct PayoutService {
    ledger: Arc<Ledger>,
    rail: Arc<dyn PayoutRail>,
    notifier: Arc<dyn Notifier>,
}

impl PayoutService {
    pub fn new(ledger: Arc<Ledger>, rail: Arc<dyn PayoutRail>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ledger,
            rail,
            notifier,
        }
    }

    /// Reserve the debit, then call the rail
    ///
    /// A payout already recorded under the order's reference is returned
    /// unchanged; one recorded for a different order fails with
    /// `DuplicateReference`. Fails with `ExternalFailed` after compensating a confirmed
    /// rail failure, and with `ExternalUnconfirmed` when the outcome is unknown.
    pub async fn execute(&self, order: PayoutOrder) -> Result<Payout> {
        let amount = normalize_amount(order.amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount("payout amount must be positive".to_string()));
        }
        if order.reference.trim().is_empty() || order.destination.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "payout needs a reference and a destination".to_string(),
            ));
        }

        if let Some(existing) = self.ledger.store().payout_by_reference(&order.reference).await? {
            return self.replay(existing, &order, amount);
        }

        let payout = match self.reserve(&order, amount).await {
            Ok(payout) => payout,
            Err(Error::DuplicateReference(_)) => {
                // concurrent execute with the same reference won the reservation
                let winner = self
                    .ledger
                    .store()
                    .payout_by_reference(&order.reference)
                    .await?
                    .ok_or_else(|| Error::DuplicateReference(order.reference.clone()))?;
                return self.replay(winner, &order, amount);
            }
            Err(e) => return Err(e),
        };

        let outcome = match self.rail.execute_payout(&payout.request()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Rail error for payout {}: {}", payout.reference, e);
                LegOutcome::Unknown
            }
        };

        let settled = self.settle(payout.id, outcome).await?;
        match settled.status {
            PayoutStatus::Confirmed => Ok(settled),
            PayoutStatus::Reversed => Err(Error::ExternalFailed(
                settled
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "payout rejected".to_string()),
            )),
            PayoutStatus::Reserved | PayoutStatus::Unconfirmed => Err(Error::ExternalUnconfirmed(
                format!("payout {} awaits confirmation", settled.reference),
            )),
        }
    }

    fn replay(&self, existing: Payout, order: &PayoutOrder, amount: Decimal) -> Result<Payout> {
        let same_order = existing.user_id == order.user_id
            && existing.kind == order.kind
            && existing.amount == amount
            && existing.destination == order.destination.trim();
        if !same_order {
            warn!(
                "Payout reference {} reused for a different order by user {}",
                order.reference, order.user_id
            );
            return Err(Error::DuplicateReference(order.reference.clone()));
        }
        info!("Payout reference {} already recorded ({})", order.reference, existing.status.as_str());
        self.ledger.metrics().record_replay();
        Ok(existing)
    }

    async fn reserve(&self, order: &PayoutOrder, amount: Decimal) -> Result<Payout> {
        let payout = self
            .ledger
            .with_busy_retry("reserve_payout", move || async move {
                let mut tx = self.ledger.begin().await?;
                let payout = Payout {
                    id: Uuid::now_v7(),
                    user_id: order.user_id,
                    kind: order.kind,
                    destination: order.destination.trim().to_string(),
                    amount,
                    reference: order.reference.clone(),
                    status: PayoutStatus::Reserved,
                    external_id: None,
                    failure_reason: None,
                    created_at: tx.now(),
                    resolved_at: None,
                };
                tx.apply_delta(
                    order.user_id,
                    -amount,
                    order.kind.entry_kind(),
                    Some(order.reference.as_str()),
                    Some(payout.id),
                )
                .await?;
                tx.rows().save_payout(&payout).await?;
                tx.commit().await?;
                Ok(payout)
            })
            .await?;

        info!(
            "Reserved {} payout {} of {} for user {}",
            payout.kind.as_str(),
            payout.reference,
            amount,
            payout.user_id
        );
        Ok(payout)
    }

    /// Settle a reserved or unconfirmed payout with a rail outcome
    ///
    /// Payouts already confirmed or reversed are returned unchanged.
    pub async fn resolve(&self, payout_id: Uuid, outcome: LegOutcome) -> Result<Payout> {
        let payout = self.settle(payout_id, outcome).await?;
        self.refresh_gauge().await;
        Ok(payout)
    }

    async fn settle(&self, payout_id: Uuid, outcome: LegOutcome) -> Result<Payout> {
        let existing = self
            .ledger
            .store()
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payout {}", payout_id)))?;
        if !existing.status.is_open() {
            return Ok(existing);
        }
        let user = existing.user_id;
        let outcome = &outcome;

        let (payout, changed) = self
            .ledger
            .with_busy_retry("settle_payout", move || async move {
                let mut tx = self.ledger.begin().await?;
                tx.lock_and_get_balance(user).await?;
                let mut payout = tx.rows().lock_payout(payout_id).await?;
                if !payout.status.is_open() {
                    tx.rollback().await?;
                    return Ok((payout, false));
                }

                let now = tx.now();
                match outcome {
                    LegOutcome::Confirmed { external_id } => {
                        payout.status = PayoutStatus::Confirmed;
                        payout.external_id = Some(external_id.clone());
                        payout.resolved_at = Some(now);
                    }
                    LegOutcome::Failed { reason } => {
                        let reversal = payout.reversal_reference();
                        tx.apply_delta(
                            user,
                            payout.amount,
                            EntryKind::Reversal,
                            Some(reversal.as_str()),
                            Some(payout.id),
                        )
                        .await?;
                        payout.status = PayoutStatus::Reversed;
                        payout.failure_reason = Some(reason.clone());
                        payout.resolved_at = Some(now);
                    }
                    LegOutcome::Unknown => {
                        if payout.status == PayoutStatus::Unconfirmed {
                            tx.rollback().await?;
                            return Ok((payout, false));
                        }
                        payout.status = PayoutStatus::Unconfirmed;
                    }
                }

                tx.rows().save_payout(&payout).await?;
                tx.commit().await?;
                Ok((payout, true))
            })
            .await?;

        if changed {
            self.ledger.metrics().record_payout(payout.status.as_str());
            match payout.status {
                PayoutStatus::Confirmed => {
                    info!("Payout {} confirmed ({:?})", payout.reference, payout.external_id);
                }
                PayoutStatus::Reversed => {
                    warn!(
                        "Payout {} failed and was reversed: {}",
                        payout.reference,
                        payout.failure_reason.as_deref().unwrap_or("unknown reason")
                    );
                    let notification = Notification::new(
                        NotificationKind::PayoutFailed,
                        "Payment failed",
                        format!("Your payment of {} USDC failed; the funds were returned", payout.amount),
                    );
                    if let Err(e) = self.notifier.notify(payout.user_id, notification).await {
                        warn!("Payout failure notification for {} failed: {}", payout.reference, e);
                    }
                }
                PayoutStatus::Unconfirmed => {
                    error!(
                        "Payout {} outcome unknown; debit of {} stands until reconciled",
                        payout.reference, payout.amount
                    );
                }
                PayoutStatus::Reserved => {}
            }
        }
        Ok(payout)
    }

    /// Payouts that still need reconciliation
    pub async fn pending_reconciliation(&self) -> Result<Vec<Payout>> {
        let open = self
            .ledger
            .store()
            .payouts_with_status(&[PayoutStatus::Reserved, PayoutStatus::Unconfirmed])
            .await?;
        self.ledger.metrics().set_unconfirmed_payouts(open.len());
        Ok(open)
    }

    async fn refresh_gauge(&self) {
        if let Err(e) = self.pending_reconciliation().await {
            warn!("Could not refresh unconfirmed payout gauge: {}", e);
        }
    }

    pub async fn payout(&self, id: Uuid) -> Result<Payout> {
        self.ledger
            .store()
            .get_payout(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payout {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::mock::{MemoryNotifier, MockPayoutRail, MockResponse};
    use crate::test_support::{funded_user, test_ledger};
    use crate::types::EntryStatus;
    use rust_decimal_macros::dec;

    fn service(ledger: Arc<Ledger>) -> (PayoutService, Arc<MockPayoutRail>, Arc<MemoryNotifier>) {
        let rail = Arc::new(MockPayoutRail::new());
        let notifier = Arc::new(MemoryNotifier::new());
        (
            PayoutService::new(ledger, rail.clone(), notifier.clone()),
            rail,
            notifier,
        )
    }

    fn order(user: UserId, amount: Decimal, reference: &str) -> PayoutOrder {
        PayoutOrder {
            user_id: user,
            kind: PayoutKind::BankWithdrawal,
            destination: "0123456789".to_string(),
            amount,
            reference: reference.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reference_reused_for_other_order_rejected() {
        let (ledger, _clock) = test_ledger();
        let a = funded_user(&ledger, dec!(100)).await;
        let b = funded_user(&ledger, dec!(100)).await;
        let (payouts, rail, _) = service(ledger.clone());

        payouts.execute(order(a, dec!(40), "WD-R")).await.unwrap();

        let other_user = payouts.execute(order(b, dec!(40), "WD-R")).await.unwrap_err();
        let other_amount = payouts.execute(order(a, dec!(41), "WD-R")).await.unwrap_err();
        let mut redirected = order(a, dec!(40), "WD-R");
        redirected.destination = "9876543210".to_string();
        let other_destination = payouts.execute(redirected).await.unwrap_err();

        assert!(matches!(other_user, Error::DuplicateReference(_)));
        assert!(matches!(other_amount, Error::DuplicateReference(_)));
        assert!(matches!(other_destination, Error::DuplicateReference(_)));
        assert_eq!(rail.calls(), 1);
        assert_eq!(ledger.get_balance(a).await.unwrap(), dec!(60));
        assert_eq!(ledger.get_balance(b).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_confirmed_payout_keeps_debit() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(100)).await;
        let (payouts, rail, _) = service(ledger.clone());

        let payout = payouts.execute(order(user, dec!(40), "WD-1")).await.unwrap();

        assert_eq!(payout.status, PayoutStatus::Confirmed);
        assert!(payout.external_id.is_some());
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(60));

        // replay returns the recorded payout without calling the rail again
        let again = payouts.execute(order(user, dec!(40), "WD-1")).await.unwrap();
        assert_eq!(again.id, payout.id);
        assert_eq!(rail.calls(), 1);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(60));
    }

    #[tokio::test]
    async fn test_failed_payout_is_compensated() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(100)).await;
        let (payouts, rail, notifier) = service(ledger.clone());
        rail.push_outcome(LegOutcome::Failed {
            reason: "invalid account".to_string(),
        });

        let err = payouts.execute(order(user, dec!(40), "WD-2")).await.unwrap_err();

        assert!(matches!(err, Error::ExternalFailed(_)));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(100));
        let reversal = ledger.find_by_reference("WD-2:reversal").await.unwrap().unwrap();
        assert_eq!(reversal.kind, EntryKind::Reversal);
        assert_eq!(reversal.status, EntryStatus::Completed);
        assert_eq!(notifier.sent_to(user).len(), 1);
        assert!(ledger.audit(user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_unknown_outcome_stays_debited_until_resolved() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(100)).await;
        let (payouts, rail, _) = service(ledger.clone());
        rail.push(MockResponse::TransportError("timeout".to_string()));

        let err = payouts.execute(order(user, dec!(25), "WD-3")).await.unwrap_err();
        assert!(matches!(err, Error::ExternalUnconfirmed(_)));
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(75));

        let open = payouts.pending_reconciliation().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, PayoutStatus::Unconfirmed);
        assert_eq!(ledger.metrics().unconfirmed_payouts.get(), 1);

        let resolved = payouts
            .resolve(
                open[0].id,
                LegOutcome::Failed {
                    reason: "bank returned funds".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, PayoutStatus::Reversed);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(100));
        assert!(payouts.pending_reconciliation().await.unwrap().is_empty());

        // settled payouts ignore later outcomes
        let unchanged = payouts
            .resolve(open[0].id, LegOutcome::Confirmed { external_id: "X".into() })
            .await
            .unwrap();
        assert_eq!(unchanged.status, PayoutStatus::Reversed);
        assert_eq!(ledger.get_balance(user).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_insufficient_balance_never_calls_rail() {
        let (ledger, _clock) = test_ledger();
        let user = funded_user(&ledger, dec!(10)).await;
        let (payouts, rail, _) = service(ledger.clone());

        let mut bill = order(user, dec!(15), "BILL-1");
        bill.kind = PayoutKind::BillPayment;
        let err = payouts.execute(bill).await.unwrap_err();

        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(rail.calls(), 0);
        assert!(ledger.store().payout_by_reference("BILL-1").await.unwrap().is_none());
    }
}
