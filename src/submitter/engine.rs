use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::limiter::TransactionProcessingLimiter;
use super::worker::TransactionWorker;
use super::SubmitterConfig;
use crate::error::{AppResult, ErrorClass};
use crate::stellar::horizon::LedgerClient;
use crate::stellar::LedgerNumberTracker;
use crate::store::models::{Payment, PaymentType};
use crate::store::{ChannelAccountStore, PaymentStore};

/// Result of one crash-recovery sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub released_channel_accounts: usize,
    pub reconciled: usize,
    pub requeued: usize,
    pub skipped: usize,
}

/// Claims ready payments and hands each one to a worker slot
pub struct SubmitterEngine {
    payments: Arc<dyn PaymentStore>,
    channels: Arc<dyn ChannelAccountStore>,
    ledger: Arc<dyn LedgerClient>,
    tracker: Arc<LedgerNumberTracker>,
    limiter: Arc<TransactionProcessingLimiter>,
    worker: Arc<TransactionWorker>,
    config: SubmitterConfig,
}

impl SubmitterEngine {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        channels: Arc<dyn ChannelAccountStore>,
        ledger: Arc<dyn LedgerClient>,
        tracker: Arc<LedgerNumberTracker>,
        limiter: Arc<TransactionProcessingLimiter>,
        worker: Arc<TransactionWorker>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            payments,
            channels,
            ledger,
            tracker,
            limiter,
            worker,
            config,
        }
    }

    /// Start the engine in the background. The task ends once `cancel` fires
    /// and every in-flight job has finished.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            workers = self.config.workers,
            polling_interval = ?self.config.polling_interval,
            "Submitter engine starting"
        );

        match self.sweep_leases().await {
            Ok(report) => info!(?report, "Startup lease sweep complete"),
            Err(e) => error!(error = %e, "Startup lease sweep failed"),
        }
        if let Err(e) = self.cancel_aged_payments().await {
            error!(error = %e, "Aged payment cancellation failed");
        }

        let jobs = TaskTracker::new();
        let slots = Arc::new(Semaphore::new(self.config.workers));
        let mut ticker = interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sweep = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if last_sweep.elapsed() >= self.config.lease_timeout {
                if let Err(e) = self.sweep_leases().await {
                    error!(error = %e, "Lease sweep failed");
                }
                if let Err(e) = self.cancel_aged_payments().await {
                    error!(error = %e, "Aged payment cancellation failed");
                }
                last_sweep = Instant::now();
            }

            let limit = self.limiter.limit_value().min(slots.available_permits());
            if limit == 0 {
                continue;
            }

            let current_ledger = match self.tracker.ledger_number().await {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!(error = %e, "Could not fetch ledger number, skipping iteration");
                    continue;
                }
            };

            let batch = match self.claim(limit, current_ledger).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Failed to claim payments");
                    continue;
                }
            };
            if !batch.is_empty() {
                debug!(claimed = batch.len(), ledger = current_ledger, "Claimed payments");
            }

            for payment in batch {
                // claims never exceed the free slots, and only this loop takes them
                let Ok(permit) = slots.clone().acquire_owned().await else {
                    break;
                };
                let worker = self.worker.clone();
                jobs.spawn(async move {
                    worker.process(payment).await;
                    drop(permit);
                });
            }
        }

        info!(in_flight = jobs.len(), "Submitter engine stopping, waiting for in-flight jobs");
        jobs.close();
        jobs.wait().await;
        info!("Submitter engine stopped");
    }

    /// Claim up to `limit` payments, splitting the batch between disbursement
    /// and direct payments. Capacity one type leaves unused goes to the other.
    pub async fn claim(&self, limit: usize, current_ledger: u32) -> AppResult<Vec<Payment>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let share = self.config.disbursement_share.clamp(0.0, 1.0);
        let quota = ((limit as f64) * share).round() as usize;

        let mut batch = if quota > 0 {
            self.payments
                .claim_batch(quota, PaymentType::Disbursement, current_ledger)
                .await?
        } else {
            Vec::new()
        };

        let direct_limit = limit - batch.len();
        let direct = self
            .payments
            .claim_batch(direct_limit, PaymentType::Direct, current_ledger)
            .await?;
        let direct_claimed = direct.len();
        batch.extend(direct);

        let leftover = limit - batch.len();
        if leftover > 0 && direct_claimed < direct_limit && batch.len() - direct_claimed == quota {
            let more = self
                .payments
                .claim_batch(leftover, PaymentType::Disbursement, current_ledger)
                .await?;
            batch.extend(more);
        }
        Ok(batch)
    }

    /// Cancel payments that have sat in `ready` longer than the configured
    /// cancellation period
    pub async fn cancel_aged_payments(&self) -> AppResult<usize> {
        let Some(period) = self.config.payment_cancellation_period else {
            return Ok(0);
        };
        let Ok(period) = chrono::Duration::from_std(period) else {
            return Ok(0);
        };

        let canceled = self.payments.cancel_stale_ready(Utc::now() - period).await?;
        if !canceled.is_empty() {
            info!(count = canceled.len(), ?period, "Canceled aged ready payments");
        }
        Ok(canceled.len())
    }

    /// Recover from an ungraceful shutdown: free channel accounts whose lease
    /// expired, then settle payments left `pending` past the lease timeout
    /// against the ledger.
    #[instrument(skip(self))]
    pub async fn sweep_leases(&self) -> AppResult<SweepReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut report = SweepReport::default();

        let released = self.channels.sweep_expired(cutoff).await?;
        if !released.is_empty() {
            warn!(count = released.len(), "Released expired channel account leases");
        }
        report.released_channel_accounts = released.len();

        for payment in self.payments.stale_pending(cutoff).await? {
            let Some(hash) = payment.stellar_transaction_hash.as_deref() else {
                self.payments
                    .requeue(payment.id, None, "lease expired before submission")
                    .await?;
                report.requeued += 1;
                continue;
            };

            match self.ledger.transaction(hash).await {
                Ok(record) if record.successful => {
                    self.payments.mark_success(payment.id, &record.hash).await?;
                    info!(payment_id = %payment.id, hash, "Reconciled stale payment as successful");
                    report.reconciled += 1;
                }
                Ok(_) => {
                    self.payments
                        .requeue(payment.id, Some(ErrorClass::Transient), "previous transaction failed")
                        .await?;
                    report.requeued += 1;
                }
                Err(e) if e.is_not_found() => {
                    self.payments
                        .requeue(payment.id, Some(ErrorClass::Transient), "lease expired")
                        .await?;
                    report.requeued += 1;
                }
                Err(e) => {
                    warn!(payment_id = %payment.id, hash, error = %e, "Could not reconcile stale payment");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}
