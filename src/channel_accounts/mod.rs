//! Channel account pool manager.
//!
//! Channel accounts are sponsored by the host account: they hold no balance of
//! their own and exist only to give the submitter independent sequence number
//! streams. Creation and removal are ledger transactions signed by the host and
//! the affected channel accounts.

pub mod lock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::error::{AppError, AppResult, ChannelAccountError, LedgerError};
use crate::signing::SignatureService;
use crate::stellar::horizon::{LedgerClient, SubmitResponse};
use crate::stellar::transaction::{
    build_create_channel_accounts, build_delete_channel_account, TxBounds, MAINTENANCE_TIMEOUT,
    MAX_CREATE_ACCOUNTS_PER_TX,
};
use crate::stellar::LedgerNumberTracker;
use crate::store::models::{ChannelAccount, LeaseState};
use crate::store::ChannelAccountStore;

pub use lock::{MaintenanceLock, PgAdvisoryLock};

/// Upper bound on the number of channel accounts in the pool
pub const MAX_CHANNEL_ACCOUNTS: usize = 1000;
/// Ledger lookups in flight at once during `verify`
const VERIFY_CONCURRENCY: usize = 20;

/// Bounded retry for maintenance transactions
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    pub accounts: Vec<ChannelAccount>,
    pub free: usize,
    pub leased: usize,
    pub pending_deletion: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    /// Stored accounts with no ledger entry
    pub invalid: Vec<String>,
    pub pruned: Vec<String>,
}

enum Maintenance<'a> {
    Create(&'a [String]),
    Delete(&'a str),
}

pub struct ChannelAccountService {
    store: Arc<dyn ChannelAccountStore>,
    ledger: Arc<dyn LedgerClient>,
    tracker: Arc<LedgerNumberTracker>,
    signatures: Arc<SignatureService>,
    lock: Arc<dyn MaintenanceLock>,
    host_account: String,
    base_fee: u32,
    retry: RetryPolicy,
}

impl ChannelAccountService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ChannelAccountStore>,
        ledger: Arc<dyn LedgerClient>,
        tracker: Arc<LedgerNumberTracker>,
        signatures: Arc<SignatureService>,
        lock: Arc<dyn MaintenanceLock>,
        host_account: String,
        base_fee: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            tracker,
            signatures,
            lock,
            host_account,
            base_fee,
            retry,
        }
    }

    pub async fn view(&self) -> AppResult<PoolView> {
        let accounts = self.store.get_all().await?;
        let count = |state: LeaseState| accounts.iter().filter(|a| a.lease_state == state).count();
        Ok(PoolView {
            free: count(LeaseState::Free),
            leased: count(LeaseState::Leased),
            pending_deletion: count(LeaseState::PendingDeletion),
            accounts,
        })
    }

    #[instrument(skip(self))]
    pub async fn create(&self, count: usize) -> AppResult<Vec<String>> {
        self.exclusive(|| self.create_unlocked(count)).await
    }

    #[instrument(skip(self))]
    pub async fn ensure_count(&self, target: usize) -> AppResult<EnsureOutcome> {
        self.exclusive(|| self.ensure_unlocked(target)).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, public_key: &str) -> AppResult<()> {
        self.exclusive(|| self.delete_unlocked(public_key)).await
    }

    /// Delete every account that is not leased. Leased accounts are reported
    /// as a conflict after the others are gone.
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> AppResult<Vec<String>> {
        self.exclusive(|| self.delete_all_unlocked()).await
    }

    /// Compare stored accounts against the ledger, optionally pruning the
    /// ones that do not exist on-chain
    #[instrument(skip(self))]
    pub async fn verify(&self, prune_invalid: bool) -> AppResult<VerifyReport> {
        self.exclusive(|| self.verify_unlocked(prune_invalid)).await
    }

    async fn exclusive<F, Fut, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if !self.lock.try_lock().await? {
            return Err(ChannelAccountError::Busy.into());
        }
        let result = f().await;
        if let Err(e) = self.lock.unlock().await {
            error!(error = %e, "Failed to release pool maintenance lock");
        }
        result
    }

    async fn delete_all_unlocked(&self) -> AppResult<Vec<String>> {
        let mut deleted = Vec::new();
        let mut leased = Vec::new();
        for account in self.store.get_all().await? {
            if account.lease_state == LeaseState::Leased {
                leased.push(account.public_key);
                continue;
            }
            self.delete_unlocked(&account.public_key).await?;
            deleted.push(account.public_key);
        }

        info!(deleted = deleted.len(), leased = leased.len(), "Deleted channel accounts");
        if !leased.is_empty() {
            return Err(ChannelAccountError::Leased(leased.join(",")).into());
        }
        Ok(deleted)
    }

    async fn verify_unlocked(&self, prune_invalid: bool) -> AppResult<VerifyReport> {
        let accounts = self.store.get_all().await?;
        let mut report = VerifyReport {
            checked: accounts.len(),
            ..VerifyReport::default()
        };

        for chunk in accounts.chunks(VERIFY_CONCURRENCY) {
            let lookups = join_all(chunk.iter().map(|a| self.ledger.account(&a.public_key))).await;
            for (account, lookup) in chunk.iter().zip(lookups) {
                match lookup {
                    Ok(_) => continue,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }

                warn!(public_key = %account.public_key, state = %account.lease_state, "Channel account missing on ledger");
                report.invalid.push(account.public_key.clone());
                if !prune_invalid {
                    continue;
                }
                if account.lease_state == LeaseState::Leased {
                    warn!(public_key = %account.public_key, "Skipping prune of leased channel account");
                    continue;
                }
                self.remove_row(&account.public_key).await?;
                report.pruned.push(account.public_key.clone());
            }
        }
        Ok(report)
    }

    async fn create_unlocked(&self, count: usize) -> AppResult<Vec<String>> {
        if count == 0 {
            return Err(ChannelAccountError::InvalidCount(count).into());
        }
        let existing = self.store.count().await?;
        if existing + count > MAX_CHANNEL_ACCOUNTS {
            return Err(ChannelAccountError::LimitExceeded {
                requested: existing + count,
                limit: MAX_CHANNEL_ACCOUNTS,
            }
            .into());
        }

        let signer = self.signatures.channel_signer()?;
        let mut created = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let batch = remaining.min(MAX_CREATE_ACCOUNTS_PER_TX);
            // rows start leased and only become free once the ledger confirms them
            let accounts = signer.batch_insert(batch).await?;

            match self.submit_maintenance(Maintenance::Create(&accounts)).await {
                Ok(response) => {
                    for account in &accounts {
                        self.store.release(account).await?;
                    }
                    info!(count = accounts.len(), hash = %response.hash, "Activated channel accounts");
                    created.extend(accounts);
                }
                Err(e) => {
                    let activated = self.keep_activated(&accounts).await?;
                    created.extend(activated);
                    error!(error = %e, created = created.len(), requested = count, "Channel account creation failed");
                    return Err(e);
                }
            }
            remaining -= batch;
        }
        Ok(created)
    }

    /// After a failed create, keep the accounts that exist on the ledger anyway
    /// and roll back the rest
    async fn keep_activated(&self, accounts: &[String]) -> AppResult<Vec<String>> {
        let mut activated = Vec::new();
        for account in accounts {
            match self.ledger.account(account).await {
                Ok(_) => {
                    self.store.release(account).await?;
                    activated.push(account.clone());
                }
                Err(e) if e.is_not_found() => self.remove_row(account).await?,
                Err(e) => {
                    // unknown ledger state: leave the row leased so the lease sweep
                    // frees it and verify can prune it later
                    warn!(account = %account, error = %e, "Could not confirm channel account activation");
                }
            }
        }
        Ok(activated)
    }

    async fn ensure_unlocked(&self, target: usize) -> AppResult<EnsureOutcome> {
        let free = self.store.count_by_state(LeaseState::Free).await?;
        let leased = self.store.count_by_state(LeaseState::Leased).await?;
        let current = free + leased;
        let mut outcome = EnsureOutcome::default();

        if current < target {
            outcome.created = self.create_unlocked(target - current).await?;
        } else if current > target {
            let excess = current - target;
            for account in self.store.oldest_free(excess).await? {
                self.delete_unlocked(&account.public_key).await?;
                outcome.deleted.push(account.public_key);
            }
            if outcome.deleted.len() < excess {
                let remaining = current - outcome.deleted.len();
                warn!(target, leased, remaining, "Pool could not be reduced to target");
                return Err(ChannelAccountError::Shortfall {
                    target,
                    leased,
                    remaining,
                }
                .into());
            }
        }

        info!(
            target,
            created = outcome.created.len(),
            deleted = outcome.deleted.len(),
            "Ensured channel account count"
        );
        Ok(outcome)
    }

    async fn delete_unlocked(&self, public_key: &str) -> AppResult<()> {
        self.store.mark_pending_deletion(public_key).await?;

        match self.ledger.account(public_key).await {
            Err(e) if e.is_not_found() => {
                info!(public_key, "Channel account not on ledger, removing row only");
            }
            Err(e) => {
                self.store.revert_pending_deletion(public_key).await?;
                return Err(e.into());
            }
            Ok(_) => {
                if let Err(e) = self.submit_maintenance(Maintenance::Delete(public_key)).await {
                    self.store.revert_pending_deletion(public_key).await?;
                    error!(public_key, error = %e, "Failed to merge channel account");
                    return Err(e);
                }
            }
        }

        self.remove_row(public_key).await
    }

    /// Drop the key through the channel signer, then the row itself
    async fn remove_row(&self, public_key: &str) -> AppResult<()> {
        match self.signatures.channel_signer()?.delete(public_key).await {
            Err(e) if e.is_unsupported() => {}
            other => other?,
        }
        self.store.delete(public_key).await
    }

    async fn submit_maintenance(&self, op: Maintenance<'_>) -> AppResult<SubmitResponse> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.try_submit_maintenance(&op).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(attempt, error = %e, "Maintenance transaction failed, retrying");
                    self.tracker.invalidate();
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_submit_maintenance(&self, op: &Maintenance<'_>) -> AppResult<SubmitResponse> {
        let host = self.ledger.account(&self.host_account).await?;
        let lock = self.tracker.lock_until().await?;
        let bounds = TxBounds::with_timeout(MAINTENANCE_TIMEOUT, lock.locked_until_ledger);

        let (tx, signers) = match op {
            Maintenance::Create(accounts) => (
                build_create_channel_accounts(&self.host_account, host.sequence, accounts, self.base_fee, bounds)?,
                accounts.to_vec(),
            ),
            Maintenance::Delete(account) => (
                build_delete_channel_account(&self.host_account, host.sequence, account, self.base_fee, bounds)?,
                vec![account.to_string()],
            ),
        };

        let signed = self
            .signatures
            .sign_with_host(tx, &self.host_account, &signers)
            .await?;
        let response = self.ledger.submit(&signed.xdr).await?;
        if !response.successful {
            return Err(AppError::Ledger(LedgerError::Build(format!(
                "Maintenance transaction {} was not successful",
                response.hash
            ))));
        }
        Ok(response)
    }
}
