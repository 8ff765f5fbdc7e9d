use async_trait::async_trait;
use sqlx::PgPool;

use super::models::DistributionAccount;
use super::DistributionAccountStore;
use crate::error::AppResult;

pub struct PgDistributionAccountStore {
    pool: PgPool,
}

impl PgDistributionAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributionAccountStore for PgDistributionAccountStore {
    async fn tenant_exists(&self, tenant_id: &str) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tenants WHERE id = $1)")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn active_for_tenant(&self, tenant_id: &str) -> AppResult<Option<DistributionAccount>> {
        let account = sqlx::query_as::<_, DistributionAccount>(
            r#"
            SELECT id, tenant_id, address, backend, status, created_at, updated_at
            FROM distribution_accounts
            WHERE tenant_id = $1 AND status = 'active'
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }
}
