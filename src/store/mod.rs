pub mod channel_accounts;
pub mod distribution_accounts;
#[cfg(test)]
pub mod memory;
pub mod models;
pub mod payments;
pub mod vault;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppResult, ErrorClass};
use models::{
    ChannelAccount, DistributionAccount, LeaseState, NewPayment, Payment, PaymentStatus,
    PaymentType, SubmissionRecord,
};

pub use channel_accounts::PgChannelAccountStore;
pub use distribution_accounts::PgDistributionAccountStore;
pub use payments::PgPaymentStore;
pub use vault::PgKeyVault;

/// Channel account rows and their lease state.
///
/// Leasing is the only concurrency control around a channel account: a row
/// moves `free -> leased` in a single conditional statement, so two claimers
/// (in this process or another) can never hold the same account.
#[async_trait]
pub trait ChannelAccountStore: Send + Sync {
    async fn get_all(&self) -> AppResult<Vec<ChannelAccount>>;

    async fn get(&self, public_key: &str) -> AppResult<Option<ChannelAccount>>;

    async fn count(&self) -> AppResult<usize>;

    async fn count_by_state(&self, state: LeaseState) -> AppResult<usize>;

    /// Lease up to `limit` free accounts, skipping rows locked by other claimers
    async fn lease_free(&self, limit: usize, locked_until_ledger: u32) -> AppResult<Vec<ChannelAccount>>;

    /// Lease one specific account if it is free
    async fn lease(&self, public_key: &str, locked_until_ledger: u32) -> AppResult<Option<ChannelAccount>>;

    /// Return a leased account to the pool. Releasing a free account is a no-op;
    /// the return value says whether a lease was actually dropped.
    async fn release(&self, public_key: &str) -> AppResult<bool>;

    /// `free -> pending_deletion`; a leased account is a conflict
    async fn mark_pending_deletion(&self, public_key: &str) -> AppResult<()>;

    /// `leased -> pending_deletion` for an account found broken while leased.
    /// It stays out of the pool until `verify` or `delete` removes it.
    async fn quarantine(&self, public_key: &str) -> AppResult<bool>;

    /// `pending_deletion -> free` after an on-chain removal failed
    async fn revert_pending_deletion(&self, public_key: &str) -> AppResult<()>;

    async fn delete(&self, public_key: &str) -> AppResult<()>;

    /// Free every lease taken before `leased_before`, returning the released keys
    async fn sweep_expired(&self, leased_before: DateTime<Utc>) -> AppResult<Vec<String>>;

    /// Free accounts, oldest first
    async fn oldest_free(&self, limit: usize) -> AppResult<Vec<ChannelAccount>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, payment: NewPayment) -> AppResult<Payment>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Payment>>;

    /// Claim up to `limit` ready payments of one type, oldest update first,
    /// moving them to `pending`. Rows still locked until a ledger at or after
    /// `current_ledger` are skipped.
    async fn claim_batch(
        &self,
        limit: usize,
        payment_type: PaymentType,
        current_ledger: u32,
    ) -> AppResult<Vec<Payment>>;

    /// Record the envelope about to be broadcast and count the attempt
    async fn save_submission(&self, id: Uuid, record: &SubmissionRecord) -> AppResult<Payment>;

    /// Count an attempt that failed before anything was broadcast
    async fn record_attempt(&self, id: Uuid) -> AppResult<Payment>;

    async fn mark_success(&self, id: Uuid, transaction_hash: &str) -> AppResult<Payment>;

    async fn mark_failed(&self, id: Uuid, class: ErrorClass, reason: &str) -> AppResult<Payment>;

    /// `pending -> ready` after a transient failure
    async fn requeue(&self, id: Uuid, class: Option<ErrorClass>, reason: &str) -> AppResult<Payment>;

    /// Validated transition used by administrative actions (cancel, retry).
    /// `tx_hash` overwrites the stored transaction hash when given. A retry
    /// (`failed -> ready`) starts a fresh submission: the attempt count, hash,
    /// envelope and ledger lock are cleared.
    async fn update_status(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<&str>,
        tx_hash: Option<&str>,
    ) -> AppResult<Payment>;

    /// Cancel ready payments whose latest move to `ready` happened before
    /// `ready_before`, returning their ids
    async fn cancel_stale_ready(&self, ready_before: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    /// Pending payments claimed before `locked_before`
    async fn stale_pending(&self, locked_before: DateTime<Utc>) -> AppResult<Vec<Payment>>;
}

#[async_trait]
pub trait DistributionAccountStore: Send + Sync {
    async fn tenant_exists(&self, tenant_id: &str) -> AppResult<bool>;

    async fn active_for_tenant(&self, tenant_id: &str) -> AppResult<Option<DistributionAccount>>;
}
