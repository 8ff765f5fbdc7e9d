use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::stellar::transaction::AssetRef;

/// Lease state of a channel account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "channel_account_lease_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Free,
    Leased,
    PendingDeletion,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Free => "free",
            LeaseState::Leased => "leased",
            LeaseState::PendingDeletion => "pending_deletion",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Channel account entity
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ChannelAccount {
    pub public_key: String,
    #[serde(skip_serializing)]
    pub encrypted_private_key: String,
    pub lease_state: LeaseState,
    pub leased_at: Option<DateTime<Utc>>,
    pub locked_until_ledger_number: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelAccount {
    pub fn is_free(&self) -> bool {
        self.lease_state == LeaseState::Free
    }
}

/// Which Signature Service backend governs an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "signer_backend", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignerBackend {
    DbVault,
    EnvSecret,
    Custodial,
}

impl SignerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerBackend::DbVault => "db_vault",
            SignerBackend::EnvSecret => "env_secret",
            SignerBackend::Custodial => "custodial",
        }
    }

    pub fn all() -> [SignerBackend; 3] {
        [
            SignerBackend::DbVault,
            SignerBackend::EnvSecret,
            SignerBackend::Custodial,
        ]
    }
}

impl fmt::Display for SignerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "distribution_account_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DistributionAccountStatus {
    Active,
    PendingFunding,
    Disabled,
}

/// Tenant-scoped funding account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DistributionAccount {
    pub id: Uuid,
    pub tenant_id: String,
    pub address: String,
    pub backend: SignerBackend,
    pub status: DistributionAccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Draft,
    Ready,
    Pending,
    Success,
    Failed,
    Canceled,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Draft => "draft",
            PaymentStatus::Ready => "ready",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

impl PaymentStatus {
    /// Legal successor states. `Pending -> Ready` is the requeue taken after a
    /// transient submission failure; `Failed -> Ready` is an operator retry.
    pub fn allowed_transitions(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Draft => &[PaymentStatus::Ready],
            PaymentStatus::Ready => &[PaymentStatus::Pending, PaymentStatus::Canceled],
            PaymentStatus::Pending => &[
                PaymentStatus::Success,
                PaymentStatus::Failed,
                PaymentStatus::Ready,
                PaymentStatus::Canceled,
            ],
            PaymentStatus::Failed => &[PaymentStatus::Ready],
            PaymentStatus::Success | PaymentStatus::Canceled => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success | PaymentStatus::Failed | PaymentStatus::Canceled
        )
    }

    pub fn validate_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), PaymentError> {
        if from.allowed_transitions().contains(&to) {
            Ok(())
        } else {
            Err(PaymentError::InvalidTransition { from, to })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Disbursement,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusHistoryEntry {
    pub fn new(status: PaymentStatus, message: Option<String>) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Payment entity with its embedded submission record
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: String,
    pub payment_type: PaymentType,
    pub amount: Decimal,
    pub asset_code: String,
    pub asset_issuer: Option<String>,
    pub destination: String,
    pub status: PaymentStatus,
    pub status_history: Json<Vec<StatusHistoryEntry>>,
    pub stellar_transaction_hash: Option<String>,
    pub envelope_xdr: Option<String>,
    pub distribution_account: Option<String>,
    pub channel_account: Option<String>,
    pub attempts_count: i32,
    pub last_error_class: Option<String>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until_ledger_number: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn asset(&self) -> AssetRef {
        AssetRef {
            code: self.asset_code.clone(),
            issuer: self.asset_issuer.clone(),
        }
    }

    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.status_history.0
    }

    /// Whether the recorded history is a legal walk of the status graph
    pub fn history_is_valid_walk(&self) -> bool {
        self.history()
            .windows(2)
            .all(|w| PaymentStatus::validate_transition(w[0].status, w[1].status).is_ok())
    }
}

/// Fields for a new payment row
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tenant_id: String,
    pub payment_type: PaymentType,
    pub amount: Decimal,
    pub asset: AssetRef,
    pub destination: String,
    pub status: PaymentStatus,
}

/// Persisted before the envelope is broadcast
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub transaction_hash: String,
    pub envelope_xdr: String,
    pub distribution_account: String,
    pub channel_account: String,
    pub locked_until_ledger_number: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use PaymentStatus::*;

    #[test]
    fn test_legal_transitions() {
        for (from, to) in [
            (Draft, Ready),
            (Ready, Pending),
            (Pending, Success),
            (Pending, Failed),
            (Pending, Ready),
            (Failed, Ready),
            (Ready, Canceled),
            (Pending, Canceled),
        ] {
            assert!(PaymentStatus::validate_transition(from, to).is_ok(), "{} -> {}", from, to);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        for (from, to) in [
            (Draft, Pending),
            (Ready, Success),
            (Success, Ready),
            (Canceled, Ready),
            (Failed, Success),
            (Draft, Canceled),
        ] {
            assert!(PaymentStatus::validate_transition(from, to).is_err(), "{} -> {}", from, to);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(Success.is_terminal());
        assert!(Canceled.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(Success.allowed_transitions().is_empty());
    }
}
