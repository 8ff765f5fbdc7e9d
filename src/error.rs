use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::stellar::horizon::HorizonError;
use crate::store::models::PaymentStatus;

/// Top-level error type for the submission subsystem
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Distribution account error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Channel account error: {0}")]
    ChannelAccount(#[from] ChannelAccountError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Ledger client and transaction building errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{0}")]
    Horizon(#[from] HorizonError),

    #[error("Failed to build transaction: {0}")]
    Build(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// Signature service errors
#[derive(Error, Debug)]
pub enum SigningError {
    /// The backend has nothing to do for this operation. Not a failure.
    #[error("Operation '{operation}' is not supported by the {backend} signer")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("No signing key for account {0}")]
    UnknownAccount(String),

    #[error("{backend} signer is not configured")]
    MissingSigner { backend: &'static str },

    #[error("Network passphrase mismatch: {signer} uses '{actual}', expected '{expected}'")]
    NetworkMismatch {
        signer: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Custodial signer request failed: {0}")]
    Custodial(String),

    #[error("Key decryption failed for {0}")]
    Decrypt(String),
}

/// Distribution account resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Tenant {0} not found")]
    TenantNotFound(String),

    #[error("Tenant {0} has no active distribution account")]
    NoActiveAccount(String),
}

/// Channel account pool errors
#[derive(Error, Debug)]
pub enum ChannelAccountError {
    #[error("Channel account {0} is currently leased")]
    Leased(String),

    #[error("Cannot reduce pool to {target}: {leased} accounts are leased, {remaining} remain")]
    Shortfall {
        target: usize,
        leased: usize,
        remaining: usize,
    },

    #[error("Requested {requested} accounts exceeds the limit of {limit}")]
    LimitExceeded { requested: usize, limit: usize },

    #[error("Invalid number of channel accounts to create: {0}")]
    InvalidCount(usize),

    #[error("Another pool maintenance command holds the lock")]
    Busy,

    #[error("Channel account {0} does not exist on the ledger")]
    MissingOnLedger(String),
}

/// Payment lifecycle errors
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Payment {0} was modified concurrently")]
    Stale(uuid::Uuid),

    #[error("Invalid payment {id}: {reason}")]
    Invalid { id: uuid::Uuid, reason: String },
}

/// Operator-facing classification of every error the subsystem can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    Transient,
    Permanent,
    Conflict,
    Unsupported,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Unsupported => "unsupported",
            ErrorClass::Internal => "internal",
        }
    }
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Config(_) => ErrorClass::Configuration,
            AppError::Database(_) => ErrorClass::Transient,
            AppError::Ledger(LedgerError::Horizon(e)) => {
                if e.is_terminal() {
                    ErrorClass::Permanent
                } else {
                    ErrorClass::Transient
                }
            }
            AppError::Ledger(_) => ErrorClass::Permanent,
            AppError::Signing(SigningError::Unsupported { .. }) => ErrorClass::Unsupported,
            AppError::Signing(SigningError::MissingSigner { .. })
            | AppError::Signing(SigningError::NetworkMismatch { .. }) => ErrorClass::Configuration,
            AppError::Signing(SigningError::Custodial(_)) => ErrorClass::Transient,
            AppError::Signing(_) => ErrorClass::Internal,
            AppError::Resolver(_) => ErrorClass::Configuration,
            AppError::ChannelAccount(ChannelAccountError::Leased(_))
            | AppError::ChannelAccount(ChannelAccountError::Shortfall { .. })
            | AppError::ChannelAccount(ChannelAccountError::Busy) => ErrorClass::Conflict,
            AppError::ChannelAccount(ChannelAccountError::MissingOnLedger(_)) => ErrorClass::Transient,
            AppError::ChannelAccount(_) => ErrorClass::Configuration,
            AppError::Payment(PaymentError::InvalidTransition { .. })
            | AppError::Payment(PaymentError::Stale(_)) => ErrorClass::Conflict,
            AppError::Payment(PaymentError::Invalid { .. }) => ErrorClass::Permanent,
            AppError::Crypto(_) | AppError::NotFound(_) | AppError::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, AppError::Signing(SigningError::Unsupported { .. }))
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Error response for the admin API
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    class: ErrorClass,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.class() {
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Unsupported => StatusCode::NOT_IMPLEMENTED,
            ErrorClass::Permanent => StatusCode::BAD_REQUEST,
            _ => match self {
                AppError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            class: self.class(),
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(err: MigrateError) -> Self {
        AppError::Config(format!("Migration failed: {}", err))
    }
}

impl From<HorizonError> for AppError {
    fn from(err: HorizonError) -> Self {
        AppError::Ledger(LedgerError::Horizon(err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<stellar_xdr::curr::Error> for AppError {
    fn from(err: stellar_xdr::curr::Error) -> Self {
        AppError::Ledger(LedgerError::Build(err.to_string()))
    }
}

/// Result type alias for the crate
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_is_distinct_class() {
        let err: AppError = SigningError::Unsupported {
            backend: "env",
            operation: "batch_insert",
        }
        .into();
        assert!(err.is_unsupported());
        assert_eq!(err.class(), ErrorClass::Unsupported);
    }

    #[test]
    fn test_leased_delete_is_conflict() {
        let err: AppError = ChannelAccountError::Leased("GABC".into()).into();
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[test]
    fn test_network_mismatch_is_configuration() {
        let err: AppError = SigningError::NetworkMismatch {
            signer: "host",
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_missing_channel_account_does_not_fail_payment() {
        let err: AppError = ChannelAccountError::MissingOnLedger("GABC".into()).into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_resolver_error_is_not_transient() {
        let err: AppError = ResolverError::NoActiveAccount("t1".into()).into();
        assert!(!err.is_transient());
    }
}
