use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::stellar::HorizonError;

/// Claim batch size used while the network is congested
pub const DEFAULT_BATCH_LIMIT: usize = 8;
/// Congestion responses tolerated per window before the batch size drops
pub const CONGESTION_TOLERANCE: usize = 10;
pub const CONGESTION_WINDOW: Duration = Duration::from_secs(3 * 60);

struct State {
    congestion_count: usize,
    window_started: Instant,
    limit: usize,
}

/// Shrinks the claim batch when the ledger API signals congestion (throttling,
/// gateway timeouts, fee too low) and restores it once a quiet window passes
pub struct TransactionProcessingLimiter {
    configured: usize,
    window: Duration,
    state: Mutex<State>,
}

impl TransactionProcessingLimiter {
    pub fn new(configured: usize) -> Self {
        Self::with_window(configured, CONGESTION_WINDOW)
    }

    pub fn with_window(configured: usize, window: Duration) -> Self {
        let configured = if configured == 0 {
            DEFAULT_BATCH_LIMIT
        } else {
            configured
        };
        Self {
            configured,
            window,
            state: Mutex::new(State {
                congestion_count: 0,
                window_started: Instant::now(),
                limit: configured,
            }),
        }
    }

    pub fn record_outcome(&self, err: &HorizonError) {
        if !err.is_congestion() {
            return;
        }

        let mut state = self.state.lock();
        state.congestion_count += 1;
        if state.congestion_count >= CONGESTION_TOLERANCE {
            if state.limit != DEFAULT_BATCH_LIMIT {
                warn!(
                    congestion_count = state.congestion_count,
                    limit = DEFAULT_BATCH_LIMIT,
                    "Network congestion detected, reducing claim batch size"
                );
            }
            state.limit = DEFAULT_BATCH_LIMIT;
            state.window_started = Instant::now();
        }
    }

    pub fn limit_value(&self) -> usize {
        let mut state = self.state.lock();
        if state.window_started.elapsed() > self.window {
            state.congestion_count = 0;
            state.window_started = Instant::now();
            state.limit = self.configured;
        }
        state.limit
    }
}
