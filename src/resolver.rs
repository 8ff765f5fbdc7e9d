use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::error::{AppResult, ResolverError};
use crate::store::models::DistributionAccount;
use crate::store::DistributionAccountStore;

/// Resolves the active distribution account (and so the signer backend) of a tenant.
///
/// Results are cached per tenant for `ttl`. Provisioning code calls
/// [`invalidate`](Self::invalidate) when a tenant's account or custody backend
/// changes. Failures are never cached and never fall back to another account.
pub struct DistributionAccountResolver {
    store: Arc<dyn DistributionAccountStore>,
    cache: DashMap<String, (DistributionAccount, Instant)>,
    ttl: Duration,
}

impl DistributionAccountResolver {
    pub fn new(store: Arc<dyn DistributionAccountStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, tenant_id: &str) -> AppResult<DistributionAccount> {
        if let Some(entry) = self.cache.get(tenant_id) {
            let (account, cached_at) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return Ok(account.clone());
            }
        }

        let Some(account) = self.store.active_for_tenant(tenant_id).await? else {
            self.cache.remove(tenant_id);
            let err = if self.store.tenant_exists(tenant_id).await? {
                ResolverError::NoActiveAccount(tenant_id.to_string())
            } else {
                ResolverError::TenantNotFound(tenant_id.to_string())
            };
            return Err(err.into());
        };

        debug!(address = %account.address, backend = %account.backend, "resolved distribution account");
        self.cache
            .insert(tenant_id.to_string(), (account.clone(), Instant::now()));
        Ok(account)
    }

    pub fn invalidate(&self, tenant_id: &str) {
        if self.cache.remove(tenant_id).is_some() {
            info!(tenant_id, "Invalidated distribution account cache");
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::memory::MemoryDistributionAccountStore;
    use crate::store::models::{DistributionAccountStatus, SignerBackend};

    fn setup() -> (Arc<MemoryDistributionAccountStore>, DistributionAccountResolver) {
        let store = Arc::new(MemoryDistributionAccountStore::default());
        let resolver = DistributionAccountResolver::new(store.clone(), Duration::from_secs(300));
        (store, resolver)
    }

    #[tokio::test]
    async fn test_resolution_is_cached_until_invalidated() {
        let (store, resolver) = setup();
        store.add_tenant("acme");
        store.add_account("acme", "GOLD", SignerBackend::DbVault, DistributionAccountStatus::Active);

        assert_eq!(resolver.resolve("acme").await.unwrap().address, "GOLD");
        store.replace_active("acme", "GNEW", SignerBackend::Custodial);

        let cached = resolver.resolve("acme").await.unwrap();
        assert_eq!(cached.address, "GOLD");
        assert_eq!(store.lookups(), 1);

        resolver.invalidate("acme");
        let fresh = resolver.resolve("acme").await.unwrap();
        assert_eq!(fresh.address, "GNEW");
        assert_eq!(fresh.backend, SignerBackend::Custodial);
    }

    #[tokio::test]
    async fn test_typed_errors_instead_of_fallback() {
        let (store, resolver) = setup();
        store.add_tenant("pending");
        store.add_account(
            "pending",
            "GPEND",
            SignerBackend::DbVault,
            DistributionAccountStatus::PendingFunding,
        );

        let err = resolver.resolve("pending").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Resolver(ResolverError::NoActiveAccount(ref t)) if t == "pending"
        ));

        let err = resolver.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::Resolver(ResolverError::TenantNotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let store = Arc::new(MemoryDistributionAccountStore::default());
        let resolver = DistributionAccountResolver::new(store.clone(), Duration::ZERO);
        store.add_tenant("acme");
        store.add_account("acme", "GA", SignerBackend::EnvSecret, DistributionAccountStatus::Active);

        resolver.resolve("acme").await.unwrap();
        resolver.resolve("acme").await.unwrap();
        assert_eq!(store.lookups(), 2);

        resolver.invalidate_all();
        resolver.resolve("acme").await.unwrap();
        assert_eq!(store.lookups(), 3);
    }
}
