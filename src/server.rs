use std::future::Future;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::channel_accounts::{ChannelAccountService, PoolView};
use crate::error::{AppError, AppResult};
use crate::stellar::LedgerNumberTracker;

#[derive(Clone)]
pub struct AppState {
    pub pool_manager: Arc<ChannelAccountService>,
    pub tracker: Arc<LedgerNumberTracker>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub ledger: Option<u32>,
    pub free_channel_accounts: usize,
}

/// GET /health - degraded when the ledger is unreachable or no channel account is free
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let ledger = match state.tracker.ledger_number().await {
        Ok(ledger) => Some(ledger),
        Err(e) => {
            warn!(error = %e, "Health check could not reach the ledger");
            None
        }
    };
    let view = state.pool_manager.view().await?;
    let healthy = ledger.is_some() && view.free > 0;

    Ok(Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        ledger,
        free_channel_accounts: view.free,
    }))
}

/// GET /channel-accounts - the pool with per-state counts
pub async fn view_channel_accounts(State(state): State<AppState>) -> AppResult<Json<PoolView>> {
    Ok(Json(state.pool_manager.view().await?))
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/channel-accounts", get(view_channel_accounts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Config(format!("Cannot bind {}: {}", bind_address, e)))?;
    info!(bind_address, "Admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppError::Internal(format!("Admin server failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel_accounts::lock::InProcessLock;
    use crate::channel_accounts::RetryPolicy;
    use crate::signing::testing;
    use crate::stellar::horizon::fake::FakeLedger;
    use crate::stellar::Keypair;
    use crate::store::memory::MemoryChannelAccountStore;

    async fn spawn_app(ledger: Arc<FakeLedger>) -> (String, Arc<ChannelAccountService>) {
        let store = Arc::new(MemoryChannelAccountStore::default());
        let host = Keypair::random();
        ledger.fund(&host.address());
        let tracker = Arc::new(LedgerNumberTracker::new(ledger.clone()));
        let pool_manager = Arc::new(ChannelAccountService::new(
            store.clone(),
            ledger.clone(),
            tracker.clone(),
            Arc::new(testing::service(store, &host, &Keypair::random())),
            Arc::new(InProcessLock::default()),
            host.address(),
            100,
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
            },
        ));

        let app = create_app(AppState {
            pool_manager: pool_manager.clone(),
            tracker,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), pool_manager)
    }

    #[tokio::test]
    async fn test_health_degraded_without_free_accounts() {
        let (base, pool_manager) = spawn_app(Arc::new(FakeLedger::new(42))).await;

        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["ledger"], 42);

        pool_manager.create(2).await.unwrap();
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["free_channel_accounts"], 2);
    }

    #[tokio::test]
    async fn test_channel_accounts_view_hides_keys() {
        let (base, pool_manager) = spawn_app(Arc::new(FakeLedger::new(42))).await;
        pool_manager.create(3).await.unwrap();

        let response = reqwest::get(format!("{}/channel-accounts", base)).await.unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["free"], 3);
        assert_eq!(body["accounts"].as_array().unwrap().len(), 3);
        assert!(body["accounts"][0].get("encrypted_private_key").is_none());
    }
}
