//! External collaborators: payout rails, inbound legs and notifications
//!
//! The ledger never calls any of these while it holds a row lock.

pub mod mock;

use crate::error::Result;
use crate::payouts::PayoutKind;
use crate::types::UserId;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

/// Result of an external leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegOutcome {
    Confirmed { external_id: String },
    Failed { reason: String },
    /// Timeout or ambiguous response; needs reconciliation
    Unknown,
}

impl fmt::Display for LegOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegOutcome::Confirmed { external_id } => write!(f, "confirmed ({})", external_id),
            LegOutcome::Failed { reason } => write!(f, "failed ({})", reason),
            LegOutcome::Unknown => write!(f, "unknown"),
        }
    }
}

/// Externally-triggered credit (webhook, chain monitor)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundCredit {
    pub user_id: UserId,
    pub amount: Decimal,
    pub external_reference: String,
    pub metadata: serde_json::Value,
}

impl InboundCredit {
    pub fn new(user_id: UserId, amount: Decimal, external_reference: impl Into<String>) -> Self {
        Self {
            user_id,
            amount,
            external_reference: external_reference.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outbound payout handed to a rail after the debit is reserved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub payout_id: Uuid,
    pub user_id: UserId,
    pub kind: PayoutKind,
    pub destination: String,
    pub amount: Decimal,
    pub reference: String,
}

/// Bank transfer, chain send, bill-pay or brokerage client
#[async_trait]
pub trait PayoutRail: Send + Sync {
    async fn execute_payout(&self, request: &PayoutRequest) -> Result<LegOutcome>;
}

/// Confirms an inbound credit with its source before it is applied
#[async_trait]
pub trait InboundLeg: Send + Sync {
    async fn confirm(&self, credit: &InboundCredit) -> Result<LegOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    GoalMilestone,
    GoalCompleted,
    P2pReceived,
    LockMatured,
    ReferralReward,
    PayoutFailed,
}

/// User-facing message emitted after a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Push/email delivery
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: UserId, notification: Notification) -> Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user: UserId, notification: Notification) -> Result<()> {
        info!(
            "Notify user {} [{:?}] {}: {}",
            user, notification.kind, notification.title, notification.message
        );
        Ok(())
    }
}
