//! Wallet Ledger
//!
//! Custodial USDC balances and the single mutation path that changes them.
//!
//! # Architecture
//!
//! - **One write path**: balance and entry writes require a grant only the
//!   mutation engine holds
//! - **Row locks**: every mutation lock-reads the balances it touches inside
//!   one unit of work; multi-user work locks in ascending user order
//! - **Idempotent references**: an external reference is applied at most once
//! - **No locks across I/O**: external legs run between committed units
//!
//! # Invariants
//!
//! - A balance is never negative
//! - A balance equals the sum of its user's completed entries
//! - A P2P transfer debits and credits atomically

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod accounts;
pub mod clock;
pub mod config;
pub mod error;
pub mod integration;
pub mod jobs;
pub mod ledger;
pub mod metrics;
pub mod p2p;
pub mod payouts;
pub mod reconciliation;
pub mod referral;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-exports
pub use accounts::{EarnService, GoalService, Holdings, LockedService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use jobs::Scheduler;
pub use ledger::{AuditReport, Ledger, LedgerTx};
pub use metrics::Metrics;
pub use p2p::P2pService;
pub use payouts::PayoutService;
pub use reconciliation::CreditGuard;
pub use referral::ReferralService;
pub use store::{MemoryStore, PgStore, Store, UnitOfWork};
pub use types::{EntryKind, EntryStatus, LedgerEntry, UserId};
