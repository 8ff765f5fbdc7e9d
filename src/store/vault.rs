use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::AppResult;
use crate::keystore::KeyVault;

/// Database vault for self-custodied distribution account keys
pub struct PgKeyVault {
    pool: PgPool,
}

impl PgKeyVault {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyVault for PgKeyVault {
    async fn store(&self, entries: &[(String, String)]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for (public_key, encrypted) in entries {
            sqlx::query(
                r#"
                INSERT INTO vault_keys (public_key, encrypted_private_key)
                VALUES ($1, $2)
                ON CONFLICT (public_key) DO UPDATE SET encrypted_private_key = EXCLUDED.encrypted_private_key
                "#,
            )
            .bind(public_key)
            .bind(encrypted)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, public_key: &str) -> AppResult<Option<String>> {
        let encrypted: Option<String> =
            sqlx::query_scalar("SELECT encrypted_private_key FROM vault_keys WHERE public_key = $1")
                .bind(public_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(encrypted)
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM vault_keys WHERE public_key = $1")
            .bind(public_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
