//! Background schedulers
//!
//! Each job runs on its own tokio interval. A failing tick is logged and the
//! loop carries on; every sweep is idempotent, so a missed or repeated tick
//! is harmless.

use crate::accounts::{GoalService, LockedService};
use crate::config::JobsConfig;
use crate::ledger::Ledger;
use crate::payouts::PayoutService;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Outcome of one pass over every job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub locks_completed: usize,
    pub locks_renewed: usize,
    pub auto_saves: usize,
    pub unconfirmed_payouts: usize,
    pub drifted_users: usize,
}

pub struct Scheduler {
    ledger: Arc<Ledger>,
    locked: Arc<LockedService>,
    goals: Arc<GoalService>,
    payouts: Option<Arc<PayoutService>>,
    config: JobsConfig,
}

impl Scheduler {
    pub fn new(
        ledger: Arc<Ledger>,
        locked: Arc<LockedService>,
        goals: Arc<GoalService>,
        config: JobsConfig,
    ) -> Self {
        Self {
            ledger,
            locked,
            goals,
            payouts: None,
            config,
        }
    }

    /// Also scan for payouts awaiting reconciliation
    pub fn with_payouts(mut self, payouts: Arc<PayoutService>) -> Self {
        self.payouts = Some(payouts);
        self
    }

    async fn open_payouts(&self) -> Result<usize> {
        match &self.payouts {
            Some(payouts) => Ok(payouts.pending_reconciliation().await?.len()),
            None => Ok(0),
        }
    }

    /// Run every job once, in order
    pub async fn run_once(&self) -> Result<SweepReport> {
        let maturity = self.locked.process_matured().await?;
        let auto_save = self.goals.run_auto_save().await?;
        let unconfirmed_payouts = self.open_payouts().await?;
        let drifted = self.ledger.audit_all().await?;

        Ok(SweepReport {
            locks_completed: maturity.completed,
            locks_renewed: maturity.renewed,
            auto_saves: auto_save.contributed,
            unconfirmed_payouts,
            drifted_users: drifted.len(),
        })
    }

    /// Start the interval loops; abort the handles to stop them
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().maturity_loop()),
            tokio::spawn(self.clone().auto_save_loop()),
            tokio::spawn(self.reconciliation_loop()),
        ]
    }

    async fn maturity_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.maturity_interval_secs));
        info!(
            "Maturity scheduler started (every {}s)",
            self.config.maturity_interval_secs
        );

        loop {
            ticker.tick().await;
            match self.locked.process_matured().await {
                Ok(report) if report.failed > 0 => {
                    warn!("Maturity sweep: {} locks failed", report.failed)
                }
                Ok(_) => {}
                Err(e) => error!("Maturity sweep failed: {}", e),
            }
        }
    }

    async fn auto_save_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.auto_save_interval_secs));
        info!(
            "Auto-save scheduler started (every {}s)",
            self.config.auto_save_interval_secs
        );

        loop {
            ticker.tick().await;
            match self.goals.run_auto_save().await {
                Ok(report) if report.failed > 0 => {
                    warn!("Auto-save sweep: {} contributions failed", report.failed)
                }
                Ok(_) => {}
                Err(e) => error!("Auto-save sweep failed: {}", e),
            }
        }
    }

    async fn reconciliation_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.reconciliation_interval_secs));
        info!(
            "Reconciliation scheduler started (every {}s)",
            self.config.reconciliation_interval_secs
        );

        loop {
            ticker.tick().await;

            match self.open_payouts().await {
                Ok(open) if open > 0 => warn!("{} payouts awaiting reconciliation", open),
                Ok(_) => {}
                Err(e) => error!("Payout reconciliation scan failed: {}", e),
            }

            if let Err(e) = self.ledger.audit_all().await {
                error!("Balance audit failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockedConfig;
    use crate::integration::mock::{MemoryNotifier, MockPayoutRail};
    use crate::integration::LegOutcome;
    use crate::payouts::{PayoutKind, PayoutOrder};
    use crate::test_support::{funded_user, test_ledger};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_run_once_matures_locks() {
        let (ledger, clock) = test_ledger();
        let notifier = Arc::new(MemoryNotifier::new());
        let locked = Arc::new(LockedService::new(
            ledger.clone(),
            notifier.clone(),
            LockedConfig::default(),
        ));
        let rail = Arc::new(MockPayoutRail::new());
        let payouts = Arc::new(PayoutService::new(ledger.clone(), rail.clone(), notifier.clone()));
        let scheduler = Scheduler::new(
            ledger.clone(),
            locked.clone(),
            Arc::new(GoalService::new(ledger.clone(), notifier.clone())),
            JobsConfig::default(),
        )
        .with_payouts(payouts.clone());

        let user = funded_user(&ledger, dec!(100)).await;
        locked.create_lock(user, dec!(50), 30, false).await.unwrap();

        assert_eq!(scheduler.run_once().await.unwrap(), SweepReport::default());

        clock.advance(ChronoDuration::days(30));
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.locks_completed, 1);
        assert_eq!(report.drifted_users, 0);

        rail.push_outcome(LegOutcome::Unknown);
        payouts
            .execute(PayoutOrder {
                user_id: user,
                kind: PayoutKind::BankWithdrawal,
                destination: "GB00TEST".to_string(),
                amount: dec!(10),
                reference: "PO-1".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(scheduler.run_once().await.unwrap().unconfirmed_payouts, 1);
    }
}
