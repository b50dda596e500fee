//! Error types for the wallet ledger

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Postgres SQLSTATE for unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";
/// Postgres SQLSTATE for lock_not_available (lock_timeout expired)
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
/// Postgres SQLSTATE for deadlock_detected
const PG_DEADLOCK_DETECTED: &str = "40P01";

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Delta would drive a balance (or feature account) below zero
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount the operation needed
        required: Decimal,
        /// Amount that was available
        available: Decimal,
    },

    /// Missing user, account or record
    #[error("Not found: {0}")]
    NotFound(String),

    /// External reference already recorded
    #[error("Duplicate external reference: {0}")]
    DuplicateReference(String),

    /// Row lock could not be acquired in time
    #[error("Resource busy: {0}")]
    Busy(String),

    /// External leg outcome is indeterminate
    #[error("External outcome unconfirmed: {0}")]
    ExternalUnconfirmed(String),

    /// External leg failed and the debit was compensated
    #[error("External payment failed: {0}")]
    ExternalFailed(String),

    /// Locked deposit withdrawn before maturity
    #[error("Lock {lock_id} has not matured (matures at {maturity})")]
    NotMatured {
        /// Locked deposit ID
        lock_id: uuid::Uuid,
        /// Maturity timestamp
        maturity: chrono::DateTime<chrono::Utc>,
    },

    /// Amount is zero, negative or below a minimum
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Request is malformed or violates a business rule
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not allowed in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Deposit limit exceeded
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error discriminant used for presentation and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Business-rule rejection, never retried
    InsufficientFunds,
    /// Missing record
    NotFound,
    /// Idempotent replay
    DuplicateReference,
    /// Lock contention, retryable
    Busy,
    /// Indeterminate external outcome
    ExternalUnconfirmed,
    /// Confirmed external failure
    ExternalFailed,
    /// Lock not matured
    NotMatured,
    /// Validation failure
    InvalidRequest,
    /// State machine violation
    InvalidState,
    /// Limit exceeded
    LimitExceeded,
    /// Infrastructure failure
    Infrastructure,
}

impl Error {
    /// Error discriminant
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DuplicateReference(_) => ErrorKind::DuplicateReference,
            Error::Busy(_) => ErrorKind::Busy,
            Error::ExternalUnconfirmed(_) => ErrorKind::ExternalUnconfirmed,
            Error::ExternalFailed(_) => ErrorKind::ExternalFailed,
            Error::NotMatured { .. } => ErrorKind::NotMatured,
            Error::InvalidAmount(_) | Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Error::Database(_)
            | Error::Migration(_)
            | Error::Config(_)
            | Error::Metrics(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the caller may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::Database(_))
    }

    /// User-facing message, derived from the kind only
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InsufficientFunds => "Insufficient balance",
            ErrorKind::NotFound => "The requested account or record was not found",
            ErrorKind::DuplicateReference => "This transaction was already processed",
            ErrorKind::Busy => "Please try again",
            ErrorKind::ExternalUnconfirmed => {
                "Your transaction is being processed and will be confirmed shortly"
            }
            ErrorKind::ExternalFailed => "The payment could not be completed; your funds were returned",
            ErrorKind::NotMatured => "Lock has not matured yet",
            ErrorKind::InvalidRequest => "The request is invalid",
            ErrorKind::InvalidState => "This action is not available for the account's current state",
            ErrorKind::LimitExceeded => "Transaction limit exceeded",
            ErrorKind::Infrastructure => "Something went wrong, please try again",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some(PG_UNIQUE_VIOLATION) => {
                    return Error::DuplicateReference(
                        db_err.constraint().unwrap_or("unique constraint").to_string(),
                    );
                }
                Some(PG_LOCK_NOT_AVAILABLE) | Some(PG_DEADLOCK_DETECTED) => {
                    return Error::Busy(db_err.message().to_string());
                }
                _ => {}
            }
        }
        Error::Database(err)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_drives_user_message() {
        let err = Error::InsufficientFunds {
            required: Decimal::from(10),
            available: Decimal::from(3),
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(err.user_message(), "Insufficient balance");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = Error::Busy("balance row".to_string());
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), "Please try again");
    }

    #[test]
    fn test_infrastructure_errors_share_generic_message() {
        let err = Error::Internal("connection reset".to_string());
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(err.user_message(), "Something went wrong, please try again");
    }

    #[test]
    fn test_invalid_amount_maps_to_invalid_request() {
        assert_eq!(
            Error::InvalidAmount("zero".into()).kind(),
            ErrorKind::InvalidRequest
        );
    }
}
