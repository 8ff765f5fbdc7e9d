use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn, Instrument};

use super::limiter::TransactionProcessingLimiter;
use super::SubmitterConfig;
use crate::error::{AppError, AppResult, ChannelAccountError, ErrorClass, LedgerError, PaymentError};
use crate::resolver::DistributionAccountResolver;
use crate::signing::{SignatureService, SignedEnvelope};
use crate::stellar::horizon::{HorizonError, LedgerClient};
use crate::stellar::transaction::{build_payment, PaymentParams, TxBounds, PAYMENT_TIMEOUT};
use crate::stellar::LedgerNumberTracker;
use crate::store::models::{
    ChannelAccount, DistributionAccount, Payment, PaymentStatus, SubmissionRecord,
};
use crate::store::{ChannelAccountStore, PaymentStore};

const LEASE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// What happened to a claimed payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    /// Back to `ready` for a later iteration
    Requeued,
    /// Left `pending`; the lease sweep will pick it up
    Abandoned,
    /// Canceled by an administrator while the job held it
    Canceled,
}

/// Processes one claimed payment end to end: reconcile, lease, build, sign,
/// submit, resolve and release.
pub struct TransactionWorker {
    payments: Arc<dyn PaymentStore>,
    channels: Arc<dyn ChannelAccountStore>,
    ledger: Arc<dyn LedgerClient>,
    tracker: Arc<LedgerNumberTracker>,
    signatures: Arc<SignatureService>,
    resolver: Arc<DistributionAccountResolver>,
    limiter: Arc<TransactionProcessingLimiter>,
    config: SubmitterConfig,
}

impl TransactionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        channels: Arc<dyn ChannelAccountStore>,
        ledger: Arc<dyn LedgerClient>,
        tracker: Arc<LedgerNumberTracker>,
        signatures: Arc<SignatureService>,
        resolver: Arc<DistributionAccountResolver>,
        limiter: Arc<TransactionProcessingLimiter>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            payments,
            channels,
            ledger,
            tracker,
            signatures,
            resolver,
            limiter,
            config,
        }
    }

    pub async fn process(&self, payment: Payment) -> JobOutcome {
        let span = tracing::info_span!(
            "payment_job",
            payment_id = %payment.id,
            tenant_id = %payment.tenant_id,
            channel_account = tracing::field::Empty,
            backend = tracing::field::Empty,
        );
        let id = payment.id;

        match self.run(payment).instrument(span.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // store writes failed mid-job; the payment stays pending until swept
                span.in_scope(|| error!(payment_id = %id, error = %e, "Payment job aborted"));
                JobOutcome::Abandoned
            }
        }
    }

    async fn run(&self, payment: Payment) -> AppResult<JobOutcome> {
        if let Some(hash) = payment.stellar_transaction_hash.as_deref() {
            match self.ledger.transaction(hash).await {
                Ok(record) if record.successful => {
                    let outcome = self.record_success(&payment, &record.hash).await?;
                    if outcome == JobOutcome::Succeeded {
                        info!(hash, "Reconciled previously submitted transaction");
                    }
                    return Ok(outcome);
                }
                Ok(_) => debug!(hash, "Previous transaction failed, rebuilding"),
                Err(e) if e.is_not_found() => debug!(hash, "Previous transaction never landed, rebuilding"),
                Err(e) => {
                    warn!(hash, error = %e, "Could not reconcile previous transaction");
                    self.payments
                        .requeue(payment.id, Some(ErrorClass::Transient), &e.to_string())
                        .await?;
                    return Ok(JobOutcome::Requeued);
                }
            }
        }

        if payment.attempts_count >= self.config.max_attempts as i32 {
            let reason = format!("exceeded {} submission attempts", self.config.max_attempts);
            self.payments
                .mark_failed(payment.id, ErrorClass::Transient, &reason)
                .await?;
            error!(attempts = payment.attempts_count, "Payment failed: {}", reason);
            return Ok(JobOutcome::Failed);
        }

        let distribution = match self.resolver.resolve(&payment.tenant_id).await {
            Ok(account) => account,
            Err(e) => return self.resolve_failure(&payment, None, e).await,
        };
        tracing::Span::current().record("backend", distribution.backend.as_str());

        let Some(channel) = self.lease_channel_account().await? else {
            self.payments
                .requeue(payment.id, None, "no free channel account")
                .await?;
            debug!("No channel account available, payment requeued");
            return Ok(JobOutcome::Requeued);
        };
        tracing::Span::current().record("channel_account", channel.public_key.as_str());

        let result = self.submit_with_lease(&payment, &channel, &distribution).await;

        if let Err(e) = self.channels.release(&channel.public_key).await {
            error!(channel_account = %channel.public_key, error = %e, "Failed to release channel account");
        }
        result
    }

    /// Lease any free channel account, waiting a bounded time for one to free up
    async fn lease_channel_account(&self) -> AppResult<Option<ChannelAccount>> {
        let started = Instant::now();
        loop {
            let lock = self.tracker.lock_until().await?;
            if let Some(account) = self
                .channels
                .lease_free(1, lock.locked_until_ledger)
                .await?
                .pop()
            {
                return Ok(Some(account));
            }
            if started.elapsed() >= self.config.lease_wait {
                return Ok(None);
            }
            tokio::time::sleep(LEASE_RETRY_INTERVAL.min(self.config.lease_wait)).await;
        }
    }

    async fn submit_with_lease(
        &self,
        payment: &Payment,
        channel: &ChannelAccount,
        distribution: &DistributionAccount,
    ) -> AppResult<JobOutcome> {
        let (signed, locked_until) = match self.build_and_sign(payment, channel, distribution).await {
            Ok(built) => built,
            Err(e) => {
                if matches!(e, AppError::ChannelAccount(ChannelAccountError::MissingOnLedger(_))) {
                    self.channels.quarantine(&channel.public_key).await?;
                    error!(channel_account = %channel.public_key, "Channel account missing on ledger, removed from the pool");
                }
                let counted = self.payments.record_attempt(payment.id).await?;
                return self.resolve_failure(&counted, Some(channel), e).await;
            }
        };

        let saved = self
            .payments
            .save_submission(
                payment.id,
                &SubmissionRecord {
                    transaction_hash: signed.hash.clone(),
                    envelope_xdr: signed.xdr.clone(),
                    distribution_account: distribution.address.clone(),
                    channel_account: channel.public_key.clone(),
                    locked_until_ledger_number: locked_until,
                },
            )
            .await?;

        let outcome = tokio::time::timeout(
            self.config.confirmation_timeout,
            self.ledger.submit(&signed.xdr),
        )
        .await
        .unwrap_or_else(|_| {
            Err(HorizonError::timeout(format!(
                "no confirmation within {:?}",
                self.config.confirmation_timeout
            )))
        });

        match outcome {
            Ok(response) if response.successful => {
                let outcome = self.record_success(payment, &response.hash).await?;
                if outcome == JobOutcome::Succeeded {
                    info!(hash = %response.hash, attempts = saved.attempts_count, "Payment succeeded");
                }
                Ok(outcome)
            }
            Ok(response) => {
                let reason = format!("transaction {} was not successful", response.hash);
                self.payments
                    .mark_failed(payment.id, ErrorClass::Permanent, &reason)
                    .await?;
                error!(channel_account = %channel.public_key, "Payment failed: {}", reason);
                Ok(JobOutcome::Failed)
            }
            Err(e) => {
                self.limiter.record_outcome(&e);
                self.tracker.invalidate();
                if e.is_indeterminate() {
                    warn!(error = %e, locked_until, "Submission outcome unknown");
                }
                self.resolve_failure(&saved, Some(channel), e.into()).await
            }
        }
    }

    async fn build_and_sign(
        &self,
        payment: &Payment,
        channel: &ChannelAccount,
        distribution: &DistributionAccount,
    ) -> AppResult<(SignedEnvelope, u32)> {
        let channel_info = match self.ledger.account(&channel.public_key).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return Err(ChannelAccountError::MissingOnLedger(channel.public_key.clone()).into())
            }
            Err(e) => return Err(e.into()),
        };
        let bounds = self.tracker.ledger_bounds().await?;
        let asset = payment.asset();

        let tx = build_payment(&PaymentParams {
            channel_account: &channel.public_key,
            channel_sequence: channel_info.sequence,
            distribution_account: &distribution.address,
            destination: &payment.destination,
            asset: &asset,
            amount: payment.amount,
            base_fee: self.config.base_fee,
            bounds: TxBounds::with_timeout(PAYMENT_TIMEOUT, bounds.max_ledger),
        })?;

        let signed = self
            .signatures
            .sign_payment(
                tx,
                &channel.public_key,
                &distribution.address,
                distribution.backend,
                self.config.base_fee,
            )
            .await?;
        Ok((signed, bounds.max_ledger))
    }

    /// Mark the payment successful, flagging one that was canceled while its
    /// envelope was in flight
    async fn record_success(&self, payment: &Payment, hash: &str) -> AppResult<JobOutcome> {
        match self.payments.mark_success(payment.id, hash).await {
            Ok(_) => Ok(JobOutcome::Succeeded),
            Err(AppError::Payment(PaymentError::InvalidTransition {
                from: PaymentStatus::Canceled,
                ..
            })) => {
                error!(
                    hash,
                    destination = %payment.destination,
                    amount = %payment.amount,
                    "Transaction landed for a payment canceled while in flight"
                );
                Ok(JobOutcome::Canceled)
            }
            Err(e) => Err(e),
        }
    }

    /// Permanent and configuration errors fail the payment; everything else
    /// requeues it until the attempt budget runs out
    async fn resolve_failure(
        &self,
        payment: &Payment,
        channel: Option<&ChannelAccount>,
        err: AppError,
    ) -> AppResult<JobOutcome> {
        let class = err.class();
        let reason = err.to_string();
        let channel_account = channel.map(|c| c.public_key.as_str()).unwrap_or("-");

        match class {
            ErrorClass::Permanent | ErrorClass::Configuration => {
                self.payments.mark_failed(payment.id, class, &reason).await?;
                let destination_not_ready = matches!(
                    &err,
                    AppError::Ledger(LedgerError::Horizon(h)) if h.is_destination_not_ready()
                );
                if destination_not_ready {
                    warn!(channel_account, error = %reason, "Payment failed: destination not ready");
                } else {
                    error!(channel_account, class = class.as_str(), error = %reason, "Payment failed");
                }
                Ok(JobOutcome::Failed)
            }
            _ if payment.attempts_count >= self.config.max_attempts as i32 => {
                let reason = format!(
                    "exceeded {} submission attempts, last error: {}",
                    self.config.max_attempts, reason
                );
                self.payments.mark_failed(payment.id, class, &reason).await?;
                error!(channel_account, attempts = payment.attempts_count, "Payment failed: {}", reason);
                Ok(JobOutcome::Failed)
            }
            _ => {
                self.payments.requeue(payment.id, Some(class), &reason).await?;
                warn!(
                    channel_account,
                    attempts = payment.attempts_count,
                    class = class.as_str(),
                    error = %reason,
                    "Payment requeued"
                );
                Ok(JobOutcome::Requeued)
            }
        }
    }
}
