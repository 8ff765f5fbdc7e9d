//! Transaction submission: claims ready payments, pairs each with a leased
//! channel account, signs and submits, then writes the outcome back.

use std::time::Duration;

pub mod engine;
pub mod limiter;
pub mod worker;

pub use engine::{SubmitterEngine, SweepReport};
pub use limiter::TransactionProcessingLimiter;
pub use worker::{JobOutcome, TransactionWorker};

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Concurrent jobs per engine
    pub workers: usize,
    pub polling_interval: Duration,
    /// Submissions allowed before a payment is failed
    pub max_attempts: u32,
    pub confirmation_timeout: Duration,
    /// Age after which a lease or a pending payment is considered abandoned
    pub lease_timeout: Duration,
    /// How long a job waits for a free channel account
    pub lease_wait: Duration,
    /// Fraction of each claim batch reserved for disbursement payments
    pub disbursement_share: f64,
    /// Fee per operation in stroops
    pub base_fee: u32,
    /// Ready payments older than this are canceled; `None` keeps them forever
    pub payment_cancellation_period: Option<Duration>,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            polling_interval: Duration::from_secs(6),
            max_attempts: 5,
            confirmation_timeout: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(300),
            lease_wait: Duration::from_secs(2),
            disbursement_share: 0.5,
            base_fee: 10_000,
            payment_cancellation_period: None,
        }
    }
}
