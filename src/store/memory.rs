//! In-memory stores for unit tests. Each one mirrors the conditional-update
//! semantics of its Postgres counterpart under a single mutex.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::types::Json;
use uuid::Uuid;

use super::models::*;
use super::{ChannelAccountStore, DistributionAccountStore, PaymentStore};
use crate::error::{AppError, AppResult, ChannelAccountError, ErrorClass, PaymentError};
use crate::keystore::KeyVault;

#[derive(Default)]
pub struct MemoryKeyVault {
    keys: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyVault for MemoryKeyVault {
    async fn store(&self, entries: &[(String, String)]) -> AppResult<()> {
        let mut keys = self.keys.lock();
        for (pk, encrypted) in entries {
            keys.insert(pk.clone(), encrypted.clone());
        }
        Ok(())
    }

    async fn load(&self, public_key: &str) -> AppResult<Option<String>> {
        Ok(self.keys.lock().get(public_key).cloned())
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        self.keys.lock().remove(public_key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryChannelAccountStore {
    accounts: Mutex<Vec<ChannelAccount>>,
}

impl MemoryChannelAccountStore {
    pub fn state_of(&self, public_key: &str) -> Option<LeaseState> {
        self.accounts
            .lock()
            .iter()
            .find(|a| a.public_key == public_key)
            .map(|a| a.lease_state)
    }

    pub fn public_keys(&self) -> Vec<String> {
        self.accounts.lock().iter().map(|a| a.public_key.clone()).collect()
    }

    /// Backdate a lease so the sweeper treats it as abandoned
    pub fn backdate_lease(&self, public_key: &str, leased_at: DateTime<Utc>) {
        if let Some(account) = self
            .accounts
            .lock()
            .iter_mut()
            .find(|a| a.public_key == public_key)
        {
            account.leased_at = Some(leased_at);
        }
    }
}

#[async_trait]
impl ChannelAccountStore for MemoryChannelAccountStore {
    async fn get_all(&self) -> AppResult<Vec<ChannelAccount>> {
        Ok(self.accounts.lock().clone())
    }

    async fn get(&self, public_key: &str) -> AppResult<Option<ChannelAccount>> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|a| a.public_key == public_key)
            .cloned())
    }

    async fn count(&self) -> AppResult<usize> {
        Ok(self.accounts.lock().len())
    }

    async fn count_by_state(&self, state: LeaseState) -> AppResult<usize> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .filter(|a| a.lease_state == state)
            .count())
    }

    async fn lease_free(&self, limit: usize, locked_until_ledger: u32) -> AppResult<Vec<ChannelAccount>> {
        let now = Utc::now();
        let mut leased = Vec::new();
        for account in self.accounts.lock().iter_mut() {
            if leased.len() >= limit {
                break;
            }
            if account.lease_state == LeaseState::Free {
                account.lease_state = LeaseState::Leased;
                account.leased_at = Some(now);
                account.locked_until_ledger_number = Some(locked_until_ledger as i32);
                account.updated_at = now;
                leased.push(account.clone());
            }
        }
        Ok(leased)
    }

    async fn lease(&self, public_key: &str, locked_until_ledger: u32) -> AppResult<Option<ChannelAccount>> {
        let now = Utc::now();
        let mut accounts = self.accounts.lock();
        let Some(account) = accounts
            .iter_mut()
            .find(|a| a.public_key == public_key && a.lease_state == LeaseState::Free)
        else {
            return Ok(None);
        };
        account.lease_state = LeaseState::Leased;
        account.leased_at = Some(now);
        account.locked_until_ledger_number = Some(locked_until_ledger as i32);
        account.updated_at = now;
        Ok(Some(account.clone()))
    }

    async fn release(&self, public_key: &str) -> AppResult<bool> {
        let mut accounts = self.accounts.lock();
        let Some(account) = accounts
            .iter_mut()
            .find(|a| a.public_key == public_key && a.lease_state == LeaseState::Leased)
        else {
            return Ok(false);
        };
        account.lease_state = LeaseState::Free;
        account.leased_at = None;
        account.locked_until_ledger_number = None;
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_pending_deletion(&self, public_key: &str) -> AppResult<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .iter_mut()
            .find(|a| a.public_key == public_key)
            .ok_or_else(|| AppError::NotFound(format!("Channel account {}", public_key)))?;
        match account.lease_state {
            LeaseState::Leased => Err(ChannelAccountError::Leased(public_key.to_string()).into()),
            _ => {
                account.lease_state = LeaseState::PendingDeletion;
                Ok(())
            }
        }
    }

    async fn quarantine(&self, public_key: &str) -> AppResult<bool> {
        let mut accounts = self.accounts.lock();
        let Some(account) = accounts
            .iter_mut()
            .find(|a| a.public_key == public_key && a.lease_state == LeaseState::Leased)
        else {
            return Ok(false);
        };
        account.lease_state = LeaseState::PendingDeletion;
        account.leased_at = None;
        account.locked_until_ledger_number = None;
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn revert_pending_deletion(&self, public_key: &str) -> AppResult<()> {
        if let Some(account) = self
            .accounts
            .lock()
            .iter_mut()
            .find(|a| a.public_key == public_key && a.lease_state == LeaseState::PendingDeletion)
        {
            account.lease_state = LeaseState::Free;
        }
        Ok(())
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        self.accounts.lock().retain(|a| a.public_key != public_key);
        Ok(())
    }

    async fn sweep_expired(&self, leased_before: DateTime<Utc>) -> AppResult<Vec<String>> {
        let mut released = Vec::new();
        for account in self.accounts.lock().iter_mut() {
            if account.lease_state == LeaseState::Leased
                && account.leased_at.map_or(false, |t| t < leased_before)
            {
                account.lease_state = LeaseState::Free;
                account.leased_at = None;
                account.locked_until_ledger_number = None;
                released.push(account.public_key.clone());
            }
        }
        Ok(released)
    }

    async fn oldest_free(&self, limit: usize) -> AppResult<Vec<ChannelAccount>> {
        let mut free: Vec<ChannelAccount> = self
            .accounts
            .lock()
            .iter()
            .filter(|a| a.lease_state == LeaseState::Free)
            .cloned()
            .collect();
        free.sort_by_key(|a| a.created_at);
        free.truncate(limit);
        Ok(free)
    }
}

#[async_trait]
impl KeyVault for MemoryChannelAccountStore {
    async fn store(&self, entries: &[(String, String)]) -> AppResult<()> {
        let now = Utc::now();
        let mut accounts = self.accounts.lock();
        for (pk, encrypted) in entries {
            accounts.push(ChannelAccount {
                public_key: pk.clone(),
                encrypted_private_key: encrypted.clone(),
                lease_state: LeaseState::Leased,
                leased_at: Some(now),
                locked_until_ledger_number: None,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(())
    }

    async fn load(&self, public_key: &str) -> AppResult<Option<String>> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|a| a.public_key == public_key)
            .map(|a| a.encrypted_private_key.clone()))
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        ChannelAccountStore::delete(self, public_key).await
    }
}

#[derive(Default)]
pub struct MemoryPaymentStore {
    payments: Mutex<HashMap<Uuid, Payment>>,
}

impl MemoryPaymentStore {
    pub fn all(&self) -> Vec<Payment> {
        self.payments.lock().values().cloned().collect()
    }

    /// Move every status history entry of a payment to `at`
    pub fn backdate_history(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(p) = self.payments.lock().get_mut(&id) {
            for entry in p.status_history.0.iter_mut() {
                entry.timestamp = at;
            }
        }
    }

    pub fn backdate_lock(&self, id: Uuid, locked_at: DateTime<Utc>) {
        if let Some(p) = self.payments.lock().get_mut(&id) {
            p.locked_at = Some(locked_at);
        }
    }

    /// Apply `f` to a pending payment, recording `to` in its history
    fn transition_from_pending(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<&str>,
        f: impl FnOnce(&mut Payment),
    ) -> AppResult<Payment> {
        let mut payments = self.payments.lock();
        let payment = payments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Payment {}", id)))?;
        if payment.status != PaymentStatus::Pending {
            return Err(PaymentError::InvalidTransition {
                from: payment.status,
                to,
            }
            .into());
        }
        f(payment);
        push_status(payment, to, message);
        Ok(payment.clone())
    }
}

fn push_status(payment: &mut Payment, to: PaymentStatus, message: Option<&str>) {
    payment.status = to;
    payment
        .status_history
        .0
        .push(StatusHistoryEntry::new(to, message.map(str::to_string)));
    payment.updated_at = Utc::now();
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn insert(&self, new: NewPayment) -> AppResult<Payment> {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            payment_type: new.payment_type,
            amount: new.amount,
            asset_code: new.asset.code,
            asset_issuer: new.asset.issuer,
            destination: new.destination,
            status: new.status,
            status_history: Json(vec![StatusHistoryEntry::new(new.status, None)]),
            stellar_transaction_hash: None,
            envelope_xdr: None,
            distribution_account: None,
            channel_account: None,
            attempts_count: 0,
            last_error_class: None,
            last_error: None,
            locked_at: None,
            locked_until_ledger_number: None,
            created_at: now,
            updated_at: now,
        };
        self.payments.lock().insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self.payments.lock().get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        payment_type: PaymentType,
        current_ledger: u32,
    ) -> AppResult<Vec<Payment>> {
        let mut payments = self.payments.lock();
        let mut ready: Vec<&mut Payment> = payments
            .values_mut()
            .filter(|p| {
                p.status == PaymentStatus::Ready
                    && p.payment_type == payment_type
                    && p.locked_until_ledger_number
                        .map_or(true, |l| (l as i64) < current_ledger as i64)
            })
            .collect();
        ready.sort_by_key(|p| (p.updated_at, p.created_at));

        let now = Utc::now();
        Ok(ready
            .into_iter()
            .take(limit)
            .map(|p| {
                p.locked_at = Some(now);
                push_status(p, PaymentStatus::Pending, None);
                p.clone()
            })
            .collect())
    }

    async fn save_submission(&self, id: Uuid, record: &SubmissionRecord) -> AppResult<Payment> {
        let mut payments = self.payments.lock();
        let payment = payments
            .get_mut(&id)
            .filter(|p| p.status == PaymentStatus::Pending)
            .ok_or(PaymentError::Stale(id))?;
        payment.stellar_transaction_hash = Some(record.transaction_hash.clone());
        payment.envelope_xdr = Some(record.envelope_xdr.clone());
        payment.distribution_account = Some(record.distribution_account.clone());
        payment.channel_account = Some(record.channel_account.clone());
        payment.locked_until_ledger_number = Some(record.locked_until_ledger_number as i32);
        payment.attempts_count += 1;
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn record_attempt(&self, id: Uuid) -> AppResult<Payment> {
        let mut payments = self.payments.lock();
        let payment = payments
            .get_mut(&id)
            .filter(|p| p.status == PaymentStatus::Pending)
            .ok_or(PaymentError::Stale(id))?;
        payment.attempts_count += 1;
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn mark_success(&self, id: Uuid, transaction_hash: &str) -> AppResult<Payment> {
        self.transition_from_pending(id, PaymentStatus::Success, None, |p| {
            p.stellar_transaction_hash = Some(transaction_hash.to_string());
            p.locked_at = None;
            p.locked_until_ledger_number = None;
            p.last_error_class = None;
            p.last_error = None;
        })
    }

    async fn mark_failed(&self, id: Uuid, class: ErrorClass, reason: &str) -> AppResult<Payment> {
        self.transition_from_pending(id, PaymentStatus::Failed, Some(reason), |p| {
            p.locked_at = None;
            p.last_error_class = Some(class.as_str().to_string());
            p.last_error = Some(reason.to_string());
        })
    }

    async fn requeue(&self, id: Uuid, class: Option<ErrorClass>, reason: &str) -> AppResult<Payment> {
        self.transition_from_pending(id, PaymentStatus::Ready, Some(reason), |p| {
            p.locked_at = None;
            if let Some(class) = class {
                p.last_error_class = Some(class.as_str().to_string());
            }
            p.last_error = Some(reason.to_string());
        })
    }

    async fn update_status(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<&str>,
        tx_hash: Option<&str>,
    ) -> AppResult<Payment> {
        let mut payments = self.payments.lock();
        let payment = payments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Payment {}", id)))?;
        PaymentStatus::validate_transition(payment.status, to)?;
        if payment.status == PaymentStatus::Failed && to == PaymentStatus::Ready {
            payment.attempts_count = 0;
            payment.stellar_transaction_hash = None;
            payment.envelope_xdr = None;
            payment.locked_until_ledger_number = None;
        }
        if let Some(hash) = tx_hash {
            payment.stellar_transaction_hash = Some(hash.to_string());
        }
        payment.locked_at = None;
        push_status(payment, to, message);
        Ok(payment.clone())
    }

    async fn cancel_stale_ready(&self, ready_before: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let mut canceled = Vec::new();
        for payment in self.payments.lock().values_mut() {
            if payment.status != PaymentStatus::Ready {
                continue;
            }
            let last_ready = payment
                .history()
                .iter()
                .filter(|e| e.status == PaymentStatus::Ready)
                .map(|e| e.timestamp)
                .max();
            if last_ready.map_or(false, |t| t <= ready_before) {
                payment.locked_until_ledger_number = None;
                push_status(payment, PaymentStatus::Canceled, Some("ready past the cancellation period"));
                canceled.push(payment.id);
            }
        }
        Ok(canceled)
    }

    async fn stale_pending(&self, locked_before: DateTime<Utc>) -> AppResult<Vec<Payment>> {
        Ok(self
            .payments
            .lock()
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending && p.locked_at.map_or(false, |t| t < locked_before)
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryDistributionAccountStore {
    tenants: Mutex<Vec<String>>,
    accounts: Mutex<Vec<DistributionAccount>>,
    lookups: std::sync::atomic::AtomicUsize,
}

impl MemoryDistributionAccountStore {
    pub fn add_tenant(&self, tenant_id: &str) {
        self.tenants.lock().push(tenant_id.to_string());
    }

    pub fn add_account(&self, tenant_id: &str, address: &str, backend: SignerBackend, status: DistributionAccountStatus) {
        let now = Utc::now();
        self.accounts.lock().push(DistributionAccount {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            address: address.to_string(),
            backend,
            status,
            created_at: now,
            updated_at: now,
        });
    }

    /// Switch a tenant's active account, disabling the previous one
    pub fn replace_active(&self, tenant_id: &str, address: &str, backend: SignerBackend) {
        for account in self.accounts.lock().iter_mut() {
            if account.tenant_id == tenant_id {
                account.status = DistributionAccountStatus::Disabled;
            }
        }
        self.add_account(tenant_id, address, backend, DistributionAccountStatus::Active);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl DistributionAccountStore for MemoryDistributionAccountStore {
    async fn tenant_exists(&self, tenant_id: &str) -> AppResult<bool> {
        Ok(self.tenants.lock().iter().any(|t| t == tenant_id))
    }

    async fn active_for_tenant(&self, tenant_id: &str) -> AppResult<Option<DistributionAccount>> {
        self.lookups.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|a| a.tenant_id == tenant_id && a.status == DistributionAccountStatus::Active)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stellar::transaction::AssetRef;
    use rust_decimal_macros::dec;

    fn ready(payment_type: PaymentType) -> NewPayment {
        NewPayment {
            tenant_id: "t1".to_string(),
            payment_type,
            amount: dec!(10),
            asset: AssetRef::native(),
            destination: "GDEST".to_string(),
            status: PaymentStatus::Ready,
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryChannelAccountStore::default();
        store
            .store(&[("GA".to_string(), "enc".to_string())])
            .await
            .unwrap();

        assert!(store.release("GA").await.unwrap());
        assert!(!store.release("GA").await.unwrap());
        assert_eq!(store.state_of("GA"), Some(LeaseState::Free));
    }

    #[tokio::test]
    async fn test_leased_account_cannot_be_leased_again() {
        let store = MemoryChannelAccountStore::default();
        store
            .store(&[("GA".to_string(), "enc".to_string())])
            .await
            .unwrap();
        assert!(store.lease("GA", 10).await.unwrap().is_none());

        store.release("GA").await.unwrap();
        assert!(store.lease("GA", 10).await.unwrap().is_some());
        assert!(store.lease_free(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_illegal_update_leaves_state_unchanged() {
        let store = MemoryPaymentStore::default();
        let payment = store.insert(ready(PaymentType::Direct)).await.unwrap();

        let err = store
            .update_status(payment.id, PaymentStatus::Success, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Payment(PaymentError::InvalidTransition { .. })));

        let unchanged = store.get(payment.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, PaymentStatus::Ready);
        assert_eq!(unchanged.history().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_skips_ledger_locked_payments() {
        let store = MemoryPaymentStore::default();
        let payment = store.insert(ready(PaymentType::Disbursement)).await.unwrap();
        store.payments.lock().get_mut(&payment.id).unwrap().locked_until_ledger_number = Some(110);

        assert!(store
            .claim_batch(10, PaymentType::Disbursement, 110)
            .await
            .unwrap()
            .is_empty());
        let claimed = store
            .claim_batch(10, PaymentType::Disbursement, 111)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_starts_a_fresh_submission() {
        let store = MemoryPaymentStore::default();
        let payment = store.insert(ready(PaymentType::Direct)).await.unwrap();
        store.claim_batch(1, PaymentType::Direct, 100).await.unwrap();
        store
            .save_submission(
                payment.id,
                &SubmissionRecord {
                    transaction_hash: "aa11".to_string(),
                    envelope_xdr: "AAAA".to_string(),
                    distribution_account: "GDIST".to_string(),
                    channel_account: "GCHAN".to_string(),
                    locked_until_ledger_number: 110,
                },
            )
            .await
            .unwrap();
        store
            .mark_failed(payment.id, ErrorClass::Transient, "exceeded attempts")
            .await
            .unwrap();

        let retried = store
            .update_status(payment.id, PaymentStatus::Ready, Some("operator retry"), None)
            .await
            .unwrap();
        assert_eq!(retried.status, PaymentStatus::Ready);
        assert_eq!(retried.attempts_count, 0);
        assert!(retried.stellar_transaction_hash.is_none());
        assert!(retried.envelope_xdr.is_none());
        assert!(retried.locked_until_ledger_number.is_none());
        assert!(retried.history_is_valid_walk());
    }

    #[tokio::test]
    async fn test_update_status_records_transaction_hash() {
        let store = MemoryPaymentStore::default();
        let payment = store.insert(ready(PaymentType::Direct)).await.unwrap();
        store.claim_batch(1, PaymentType::Direct, 100).await.unwrap();

        let canceled = store
            .update_status(payment.id, PaymentStatus::Canceled, Some("admin"), Some("bb22"))
            .await
            .unwrap();
        assert_eq!(canceled.status, PaymentStatus::Canceled);
        assert_eq!(canceled.stellar_transaction_hash.as_deref(), Some("bb22"));
    }

    #[tokio::test]
    async fn test_cancel_stale_ready_uses_latest_ready_entry() {
        let store = MemoryPaymentStore::default();
        let aged = store.insert(ready(PaymentType::Disbursement)).await.unwrap();
        let requeued = store.insert(ready(PaymentType::Disbursement)).await.unwrap();
        let fresh = store.insert(ready(PaymentType::Direct)).await.unwrap();
        let ten_days_ago = Utc::now() - chrono::Duration::days(10);
        store.backdate_history(aged.id, ten_days_ago);
        store.backdate_history(requeued.id, ten_days_ago);
        // a requeue moves the payment back to ready and restarts its clock
        store.claim_batch(10, PaymentType::Disbursement, 100).await.unwrap();
        store.requeue(aged.id, None, "no free channel account").await.unwrap();
        store.requeue(requeued.id, None, "no free channel account").await.unwrap();
        store.backdate_history(aged.id, ten_days_ago);

        let cutoff = Utc::now() - chrono::Duration::days(5);
        let canceled = store.cancel_stale_ready(cutoff).await.unwrap();
        assert_eq!(canceled, vec![aged.id]);

        let aged = store.get(aged.id).await.unwrap().unwrap();
        assert_eq!(aged.status, PaymentStatus::Canceled);
        assert!(aged.history_is_valid_walk());
        assert_eq!(store.get(requeued.id).await.unwrap().unwrap().status, PaymentStatus::Ready);
        assert_eq!(store.get(fresh.id).await.unwrap().unwrap().status, PaymentStatus::Ready);
    }

    #[tokio::test]
    async fn test_quarantine_only_takes_leased_accounts() {
        let store = MemoryChannelAccountStore::default();
        store
            .store(&[("GA".to_string(), "enc".to_string())])
            .await
            .unwrap();

        assert!(store.quarantine("GA").await.unwrap());
        assert_eq!(store.state_of("GA"), Some(LeaseState::PendingDeletion));
        assert!(!store.release("GA").await.unwrap());
        assert!(store.lease_free(1, 10).await.unwrap().is_empty());
        assert!(!store.quarantine("GA").await.unwrap());
    }
}
