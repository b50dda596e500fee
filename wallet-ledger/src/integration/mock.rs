use super::{InboundCredit, InboundLeg, LegOutcome, Notification, Notifier, PayoutRail, PayoutRequest};
use crate::error::{Error, Result};
use crate::types::UserId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Scripted response of a mock leg
#[derive(Debug, Clone)]
pub enum MockResponse {
    Outcome(LegOutcome),
    /// Transport error surfaced as `Err`
    TransportError(String),
}

/// Queue of scripted responses; confirms once the script runs out
#[derive(Debug, Default)]
struct Script {
    responses: Mutex<VecDeque<MockResponse>>,
    calls: AtomicUsize,
}

impl Script {
    fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    fn next(&self) -> Result<LegOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().pop_front() {
            Some(MockResponse::Outcome(outcome)) => Ok(outcome),
            Some(MockResponse::TransportError(msg)) => Err(Error::Internal(msg)),
            None => Ok(LegOutcome::Confirmed {
                external_id: format!("MOCK-{}", Uuid::new_v4()),
            }),
        }
    }
}

/// Payout rail with scripted outcomes
#[derive(Debug, Default)]
pub struct MockPayoutRail {
    script: Script,
    latency: Duration,
}

impl MockPayoutRail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, response: MockResponse) {
        self.script.push(response);
    }

    pub fn push_outcome(&self, outcome: LegOutcome) {
        self.push(MockResponse::Outcome(outcome));
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayoutRail for MockPayoutRail {
    async fn execute_payout(&self, request: &PayoutRequest) -> Result<LegOutcome> {
        info!(
            "Mock rail: {:?} payout {} of {} to {}",
            request.kind, request.reference, request.amount, request.destination
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outcome = self.script.next();
        if let Ok(LegOutcome::Failed { reason }) = &outcome {
            warn!("Mock rail: payout {} failed: {}", request.reference, reason);
        }
        outcome
    }
}

/// Inbound leg with scripted outcomes
#[derive(Debug, Default)]
pub struct MockInboundLeg {
    script: Script,
    latency: Duration,
}

impl MockInboundLeg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, response: MockResponse) {
        self.script.push(response);
    }

    pub fn push_outcome(&self, outcome: LegOutcome) {
        self.push(MockResponse::Outcome(outcome));
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InboundLeg for MockInboundLeg {
    async fn confirm(&self, credit: &InboundCredit) -> Result<LegOutcome> {
        info!(
            "Mock inbound: confirming {} of {} for user {}",
            credit.external_reference, credit.amount, credit.user_id
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.script.next()
    }
}

/// Notifier that records every notification
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(UserId, Notification)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(UserId, Notification)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, user: UserId) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, user: UserId, notification: Notification) -> Result<()> {
        self.sent.lock().push((user, notification));
        Ok(())
    }
}
