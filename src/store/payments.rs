use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::models::{
    NewPayment, Payment, PaymentStatus, PaymentType, StatusHistoryEntry, SubmissionRecord,
};
use super::PaymentStore;
use crate::error::{AppError, AppResult, ErrorClass, PaymentError};

const COLUMNS: &str = "id, tenant_id, payment_type, amount, asset_code, asset_issuer, destination, \
                       status, status_history, stellar_transaction_hash, envelope_xdr, \
                       distribution_account, channel_account, attempts_count, last_error_class, \
                       last_error, locked_at, locked_until_ledger_number, created_at, updated_at";

fn history(status: PaymentStatus, message: Option<&str>) -> Json<Vec<StatusHistoryEntry>> {
    Json(vec![StatusHistoryEntry::new(status, message.map(str::to_string))])
}

/// Postgres-backed payment store. Every status change appends to
/// `status_history` in the same statement that writes `status`.
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional update out of `pending` matched no row
    async fn rejected_transition(&self, id: Uuid, to: PaymentStatus) -> AppError {
        match self.get(id).await {
            Ok(Some(payment)) => PaymentError::InvalidTransition {
                from: payment.status,
                to,
            }
            .into(),
            Ok(None) => AppError::NotFound(format!("Payment {}", id)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert(&self, payment: NewPayment) -> AppResult<Payment> {
        let inserted = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (tenant_id, payment_type, amount, asset_code, asset_issuer, destination, status, status_history)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(&payment.tenant_id)
        .bind(payment.payment_type)
        .bind(payment.amount)
        .bind(&payment.asset.code)
        .bind(&payment.asset.issuer)
        .bind(&payment.destination)
        .bind(payment.status)
        .bind(history(payment.status, None))
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        payment_type: PaymentType,
        current_ledger: u32,
    ) -> AppResult<Vec<Payment>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut claimed = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'pending', locked_at = NOW(), updated_at = NOW(),
                status_history = status_history || $4
            WHERE id IN (
                SELECT id FROM payments
                WHERE status = 'ready'
                  AND payment_type = $2
                  AND (locked_until_ledger_number IS NULL OR locked_until_ledger_number < $3)
                ORDER BY updated_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(limit as i64)
        .bind(payment_type)
        .bind(current_ledger as i32)
        .bind(history(PaymentStatus::Pending, None))
        .fetch_all(&self.pool)
        .await?;

        claimed.sort_by_key(|p| p.created_at);
        debug!(count = claimed.len(), ?payment_type, "Claimed payments");
        Ok(claimed)
    }

    async fn save_submission(&self, id: Uuid, record: &SubmissionRecord) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET stellar_transaction_hash = $2, envelope_xdr = $3, distribution_account = $4,
                channel_account = $5, locked_until_ledger_number = $6,
                attempts_count = attempts_count + 1, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(&record.transaction_hash)
        .bind(&record.envelope_xdr)
        .bind(&record.distribution_account)
        .bind(&record.channel_account)
        .bind(record.locked_until_ledger_number as i32)
        .fetch_optional(&self.pool)
        .await?;

        payment.ok_or_else(|| PaymentError::Stale(id).into())
    }

    async fn record_attempt(&self, id: Uuid) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET attempts_count = attempts_count + 1, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        payment.ok_or_else(|| PaymentError::Stale(id).into())
    }

    async fn mark_success(&self, id: Uuid, transaction_hash: &str) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'success', stellar_transaction_hash = $2, locked_at = NULL,
                locked_until_ledger_number = NULL, last_error_class = NULL, last_error = NULL,
                status_history = status_history || $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(transaction_hash)
        .bind(history(PaymentStatus::Success, None))
        .fetch_optional(&self.pool)
        .await?;

        match payment {
            Some(payment) => Ok(payment),
            None => Err(self.rejected_transition(id, PaymentStatus::Success).await),
        }
    }

    async fn mark_failed(&self, id: Uuid, class: ErrorClass, reason: &str) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'failed', locked_at = NULL, last_error_class = $2, last_error = $3,
                status_history = status_history || $4, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(class.as_str())
        .bind(reason)
        .bind(history(PaymentStatus::Failed, Some(reason)))
        .fetch_optional(&self.pool)
        .await?;

        match payment {
            Some(payment) => Ok(payment),
            None => Err(self.rejected_transition(id, PaymentStatus::Failed).await),
        }
    }

    async fn requeue(&self, id: Uuid, class: Option<ErrorClass>, reason: &str) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'ready', locked_at = NULL,
                last_error_class = COALESCE($2, last_error_class), last_error = $3,
                status_history = status_history || $4, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(class.map(|c| c.as_str()))
        .bind(reason)
        .bind(history(PaymentStatus::Ready, Some(reason)))
        .fetch_optional(&self.pool)
        .await?;

        match payment {
            Some(payment) => Ok(payment),
            None => Err(self.rejected_transition(id, PaymentStatus::Ready).await),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        to: PaymentStatus,
        message: Option<&str>,
        tx_hash: Option<&str>,
    ) -> AppResult<Payment> {
        let mut tx = self.pool.begin().await?;

        let current: Option<PaymentStatus> =
            sqlx::query_scalar("SELECT status FROM payments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let from = current.ok_or_else(|| AppError::NotFound(format!("Payment {}", id)))?;
        PaymentStatus::validate_transition(from, to)?;
        let retry = from == PaymentStatus::Failed && to == PaymentStatus::Ready;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = $2, locked_at = NULL,
                stellar_transaction_hash = COALESCE($4, CASE WHEN $5 THEN NULL ELSE stellar_transaction_hash END),
                envelope_xdr = CASE WHEN $5 THEN NULL ELSE envelope_xdr END,
                locked_until_ledger_number = CASE WHEN $5 THEN NULL ELSE locked_until_ledger_number END,
                attempts_count = CASE WHEN $5 THEN 0 ELSE attempts_count END,
                status_history = status_history || $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(to)
        .bind(history(to, message))
        .bind(tx_hash)
        .bind(retry)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payment)
    }

    async fn cancel_stale_ready(&self, ready_before: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let canceled: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE payments
            SET status = 'canceled', locked_until_ledger_number = NULL,
                status_history = status_history || $2, updated_at = NOW()
            WHERE status = 'ready'
              AND (
                  SELECT MAX((entry->>'timestamp')::timestamptz)
                  FROM jsonb_array_elements(status_history) AS entry
                  WHERE entry->>'status' = 'ready'
              ) <= $1
            RETURNING id
            "#,
        )
        .bind(ready_before)
        .bind(history(PaymentStatus::Canceled, Some("ready past the cancellation period")))
        .fetch_all(&self.pool)
        .await?;

        if canceled.is_empty() {
            debug!("No aged payments to cancel");
        }
        Ok(canceled)
    }

    async fn stale_pending(&self, locked_before: DateTime<Utc>) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE status = 'pending' AND locked_at < $1 ORDER BY locked_at",
            COLUMNS
        ))
        .bind(locked_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }
}
