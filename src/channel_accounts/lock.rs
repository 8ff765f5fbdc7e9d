use async_trait::async_trait;
use sqlx::{pool::PoolConnection, PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppResult;

/// Advisory key shared by every pool maintenance command
pub const POOL_MAINTENANCE_LOCK_KEY: i64 = 0x7453_735f_706f_6f6c;

/// Cross-process mutual exclusion for pool maintenance
#[async_trait]
pub trait MaintenanceLock: Send + Sync {
    /// Take the lock without waiting. `false` means another holder has it.
    async fn try_lock(&self) -> AppResult<bool>;

    async fn unlock(&self) -> AppResult<()>;
}

/// Postgres session advisory lock. The session that took the lock is kept
/// aside until `unlock`, since only that session may release it.
pub struct PgAdvisoryLock {
    pool: PgPool,
    key: i64,
    session: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            key: POOL_MAINTENANCE_LOCK_KEY,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MaintenanceLock for PgAdvisoryLock {
    async fn try_lock(&self) -> AppResult<bool> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            debug!(key = self.key, "acquired pool maintenance lock");
            *session = Some(conn);
        }
        Ok(acquired)
    }

    async fn unlock(&self) -> AppResult<()> {
        let Some(mut conn) = self.session.lock().await.take() else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *conn)
            .await?;
        debug!(key = self.key, "released pool maintenance lock");
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct InProcessLock {
    held: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[async_trait]
impl MaintenanceLock for InProcessLock {
    async fn try_lock(&self) -> AppResult<bool> {
        use std::sync::atomic::Ordering;
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    async fn unlock(&self) -> AppResult<()> {
        self.held.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
