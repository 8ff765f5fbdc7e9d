use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use super::models::{ChannelAccount, LeaseState};
use super::ChannelAccountStore;
use crate::error::{AppError, AppResult, ChannelAccountError};
use crate::keystore::KeyVault;

const COLUMNS: &str = "public_key, encrypted_private_key, lease_state, leased_at, \
                       locked_until_ledger_number, created_at, updated_at";

/// Postgres-backed channel account pool
pub struct PgChannelAccountStore {
    pool: PgPool,
}

impl PgChannelAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelAccountStore for PgChannelAccountStore {
    async fn get_all(&self) -> AppResult<Vec<ChannelAccount>> {
        let accounts = sqlx::query_as::<_, ChannelAccount>(&format!(
            "SELECT {} FROM channel_accounts ORDER BY created_at",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn get(&self, public_key: &str) -> AppResult<Option<ChannelAccount>> {
        let account = sqlx::query_as::<_, ChannelAccount>(&format!(
            "SELECT {} FROM channel_accounts WHERE public_key = $1",
            COLUMNS
        ))
        .bind(public_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn count(&self) -> AppResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channel_accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn count_by_state(&self, state: LeaseState) -> AppResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM channel_accounts WHERE lease_state = $1")
                .bind(state)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn lease_free(&self, limit: usize, locked_until_ledger: u32) -> AppResult<Vec<ChannelAccount>> {
        let accounts = sqlx::query_as::<_, ChannelAccount>(&format!(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'leased', leased_at = NOW(), locked_until_ledger_number = $2, updated_at = NOW()
            WHERE public_key IN (
                SELECT public_key FROM channel_accounts
                WHERE lease_state = 'free'
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(limit as i64)
        .bind(locked_until_ledger as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn lease(&self, public_key: &str, locked_until_ledger: u32) -> AppResult<Option<ChannelAccount>> {
        let account = sqlx::query_as::<_, ChannelAccount>(&format!(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'leased', leased_at = NOW(), locked_until_ledger_number = $2, updated_at = NOW()
            WHERE public_key = $1 AND lease_state = 'free'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(public_key)
        .bind(locked_until_ledger as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn release(&self, public_key: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'free', leased_at = NULL, locked_until_ledger_number = NULL, updated_at = NOW()
            WHERE public_key = $1 AND lease_state = 'leased'
            "#,
        )
        .bind(public_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_pending_deletion(&self, public_key: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'pending_deletion', updated_at = NOW()
            WHERE public_key = $1 AND lease_state = 'free'
            "#,
        )
        .bind(public_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(public_key).await? {
                None => Err(AppError::NotFound(format!("Channel account {}", public_key))),
                Some(account) if account.lease_state == LeaseState::PendingDeletion => Ok(()),
                Some(_) => Err(ChannelAccountError::Leased(public_key.to_string()).into()),
            };
        }
        Ok(())
    }

    async fn quarantine(&self, public_key: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'pending_deletion', leased_at = NULL,
                locked_until_ledger_number = NULL, updated_at = NOW()
            WHERE public_key = $1 AND lease_state = 'leased'
            "#,
        )
        .bind(public_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn revert_pending_deletion(&self, public_key: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'free', updated_at = NOW()
            WHERE public_key = $1 AND lease_state = 'pending_deletion'
            "#,
        )
        .bind(public_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM channel_accounts WHERE public_key = $1")
            .bind(public_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self, leased_before: DateTime<Utc>) -> AppResult<Vec<String>> {
        let released: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE channel_accounts
            SET lease_state = 'free', leased_at = NULL, locked_until_ledger_number = NULL, updated_at = NOW()
            WHERE lease_state = 'leased' AND leased_at < $1
            RETURNING public_key
            "#,
        )
        .bind(leased_before)
        .fetch_all(&self.pool)
        .await?;

        if !released.is_empty() {
            warn!(count = released.len(), "Reclaimed expired channel account leases");
        }
        Ok(released)
    }

    async fn oldest_free(&self, limit: usize) -> AppResult<Vec<ChannelAccount>> {
        let accounts = sqlx::query_as::<_, ChannelAccount>(&format!(
            "SELECT {} FROM channel_accounts WHERE lease_state = 'free' ORDER BY created_at LIMIT $1",
            COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }
}

/// Channel account keys live on the pool rows themselves. New rows start out
/// leased so the submitter cannot pick them before they are activated on-chain.
#[async_trait]
impl KeyVault for PgChannelAccountStore {
    async fn store(&self, entries: &[(String, String)]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for (public_key, encrypted) in entries {
            sqlx::query(
                r#"
                INSERT INTO channel_accounts (public_key, encrypted_private_key, lease_state, leased_at)
                VALUES ($1, $2, 'leased', NOW())
                "#,
            )
            .bind(public_key)
            .bind(encrypted)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(count = entries.len(), "Inserted channel account keys");
        Ok(())
    }

    async fn load(&self, public_key: &str) -> AppResult<Option<String>> {
        let encrypted: Option<String> = sqlx::query_scalar(
            "SELECT encrypted_private_key FROM channel_accounts WHERE public_key = $1",
        )
        .bind(public_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(encrypted)
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        ChannelAccountStore::delete(self, public_key).await
    }
}
