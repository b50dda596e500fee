//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_mutations_total` - Committed balance mutations
//! - `ledger_replays_total` - Idempotent replays of a known external reference
//! - `ledger_insufficient_funds_total` - Deltas rejected for insufficient balance
//! - `ledger_busy_total` - Units of work that hit the lock timeout
//! - `ledger_mutation_duration_seconds` - Histogram of mutation latencies
//! - `ledger_payouts_total` - Outbound payouts by final status
//! - `ledger_unconfirmed_payouts` - Payouts awaiting reconciliation

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
///
/// Every instance owns its registry, so several ledgers (one per test) can
/// coexist in one process.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Committed balance mutations
    pub mutations_total: IntCounter,

    /// Idempotent replays
    pub replays_total: IntCounter,

    /// Insufficient funds rejections
    pub insufficient_funds_total: IntCounter,

    /// Lock timeouts
    pub busy_total: IntCounter,

    /// Mutation latency histogram
    pub mutation_duration: Histogram,

    /// Payouts by status
    pub payouts_total: IntCounterVec,

    /// Payouts awaiting reconciliation
    pub unconfirmed_payouts: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total =
            IntCounter::new("ledger_mutations_total", "Committed balance mutations")?;
        registry.register(Box::new(mutations_total.clone()))?;

        let replays_total = IntCounter::new(
            "ledger_replays_total",
            "Idempotent replays of a known external reference",
        )?;
        registry.register(Box::new(replays_total.clone()))?;

        let insufficient_funds_total = IntCounter::new(
            "ledger_insufficient_funds_total",
            "Deltas rejected for insufficient balance",
        )?;
        registry.register(Box::new(insufficient_funds_total.clone()))?;

        let busy_total =
            IntCounter::new("ledger_busy_total", "Units of work that hit the lock timeout")?;
        registry.register(Box::new(busy_total.clone()))?;

        let mutation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_mutation_duration_seconds",
                "Histogram of mutation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(mutation_duration.clone()))?;

        let payouts_total = IntCounterVec::new(
            Opts::new("ledger_payouts_total", "Outbound payouts by final status"),
            &["status"],
        )?;
        registry.register(Box::new(payouts_total.clone()))?;

        let unconfirmed_payouts =
            IntGauge::new("ledger_unconfirmed_payouts", "Payouts awaiting reconciliation")?;
        registry.register(Box::new(unconfirmed_payouts.clone()))?;

        Ok(Self {
            mutations_total,
            replays_total,
            insufficient_funds_total,
            busy_total,
            mutation_duration,
            payouts_total,
            unconfirmed_payouts,
            registry,
        })
    }

    /// Record a committed unit of work and the mutations it carried
    pub fn record_mutation(&self, mutations: u32, duration_seconds: f64) {
        self.mutations_total.inc_by(u64::from(mutations));
        self.mutation_duration.observe(duration_seconds);
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record an insufficient funds rejection
    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds_total.inc();
    }

    /// Record a lock timeout
    pub fn record_busy(&self) {
        self.busy_total.inc();
    }

    /// Record a payout reaching a status
    pub fn record_payout(&self, status: &str) {
        self.payouts_total.with_label_values(&[status]).inc();
    }

    /// Update the unconfirmed payout gauge
    pub fn set_unconfirmed_payouts(&self, count: usize) {
        self.unconfirmed_payouts.set(count as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
