use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use stellar_xdr::curr::LedgerBounds;
use tracing::debug;

use super::horizon::{HorizonError, LedgerClient};

/// How long a fetched ledger number may be reused
pub const MAX_LEDGER_AGE: Duration = Duration::from_secs(5);
/// Ledgers a built transaction (and the lease backing it) stays valid for
pub const INCREMENT_FOR_MAX_LEDGER_BOUNDS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLock {
    pub current_ledger: u32,
    pub locked_until_ledger: u32,
}

/// Caches the current ledger sequence so every built transaction carries a
/// fresh, bounded validity window
pub struct LedgerNumberTracker {
    client: Arc<dyn LedgerClient>,
    max_age: Duration,
    cached: Mutex<Option<(u32, Instant)>>,
}

impl LedgerNumberTracker {
    pub fn new(client: Arc<dyn LedgerClient>) -> Self {
        Self::with_max_age(client, MAX_LEDGER_AGE)
    }

    pub fn with_max_age(client: Arc<dyn LedgerClient>, max_age: Duration) -> Self {
        Self {
            client,
            max_age,
            cached: Mutex::new(None),
        }
    }

    pub async fn ledger_number(&self) -> Result<u32, HorizonError> {
        if let Some((number, fetched_at)) = *self.cached.lock() {
            if fetched_at.elapsed() < self.max_age {
                return Ok(number);
            }
        }

        let number = self.client.latest_ledger().await?;
        debug!(ledger = number, "refreshed ledger number");
        *self.cached.lock() = Some((number, Instant::now()));
        Ok(number)
    }

    pub async fn ledger_bounds(&self) -> Result<LedgerBounds, HorizonError> {
        let lock = self.lock_until().await?;
        Ok(LedgerBounds {
            min_ledger: 0,
            max_ledger: lock.locked_until_ledger,
        })
    }

    pub async fn lock_until(&self) -> Result<LedgerLock, HorizonError> {
        let current_ledger = self.ledger_number().await?;
        Ok(LedgerLock {
            current_ledger,
            locked_until_ledger: current_ledger + INCREMENT_FOR_MAX_LEDGER_BOUNDS,
        })
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
