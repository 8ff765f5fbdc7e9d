use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::{BytesM, DecoratedSignature, Signature};
use tracing::{instrument, warn};

use super::SignatureClient;
use crate::error::{AppError, AppResult, SigningError};
use crate::stellar::keypair::{decode_address, signature_hint, verify_decorated};
use crate::store::models::SignerBackend;

#[derive(Debug, Clone)]
pub struct CustodialConfig {
    pub base_url: String,
    pub api_key: String,
    pub network_passphrase: String,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub requests_per_second: u32,
    pub request_timeout: Duration,
}

impl CustodialConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, network_passphrase: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            network_passphrase: network_passphrase.into(),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            requests_per_second: 20,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    account: &'a str,
    network_passphrase: &'a str,
    transaction_hash: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

/// Delegates signing to a third-party custodian that holds the tenant's keys.
/// Local key provisioning does not apply.
pub struct CustodialSigner {
    config: CustodialConfig,
    http: reqwest::Client,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

/// Outcome of one request: retry or give up
enum Attempt {
    Retry(String),
    Fatal(String),
}

impl CustodialSigner {
    pub fn new(config: CustodialConfig) -> AppResult<Self> {
        if config.base_url.is_empty() || config.api_key.is_empty() {
            return Err(AppError::Config(
                "Custodial signer requires an API url and key".to_string(),
            ));
        }
        let per_second = NonZeroU32::new(config.requests_per_second)
            .ok_or_else(|| AppError::Config("Custodial rate limit must be positive".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build http client: {}", e)))?;

        Ok(Self {
            config,
            http,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    async fn request_signature(&self, hash: &[u8; 32], account: &str) -> Result<Vec<u8>, Attempt> {
        self.limiter.until_ready().await;

        let url = format!("{}/v1/sign", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&SignRequest {
                account,
                network_passphrase: &self.config.network_passphrase,
                transaction_hash: hex::encode(hash),
            })
            .send()
            .await
            .map_err(|e| Attempt::Retry(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Attempt::Retry(format!("custodian answered {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::Fatal(format!("custodian answered {}: {}", status, body)));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(format!("invalid custodian response: {}", e)))?;
        base64::engine::general_purpose::STANDARD
            .decode(body.signature)
            .map_err(|e| Attempt::Fatal(format!("invalid signature encoding: {}", e)))
    }
}

#[async_trait]
impl SignatureClient for CustodialSigner {
    fn backend(&self) -> SignerBackend {
        SignerBackend::Custodial
    }

    fn network_passphrase(&self) -> &str {
        &self.config.network_passphrase
    }

    #[instrument(skip(self, hash))]
    async fn sign(&self, hash: &[u8; 32], account: &str) -> AppResult<DecoratedSignature> {
        let public_key = decode_address(account)?;
        let mut backoff = self.config.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.request_signature(hash, account).await {
                Ok(raw) => {
                    let bytes: BytesM<64> = raw.try_into().map_err(|_| {
                        SigningError::Custodial("signature must be 64 bytes".to_string())
                    })?;
                    let signature = DecoratedSignature {
                        hint: signature_hint(&public_key),
                        signature: Signature(bytes),
                    };
                    if !verify_decorated(account, hash, &signature) {
                        return Err(SigningError::Custodial(format!(
                            "custodian returned an invalid signature for {}",
                            account
                        ))
                        .into());
                    }
                    return Ok(signature);
                }
                Err(Attempt::Fatal(message)) => {
                    return Err(SigningError::Custodial(message).into());
                }
                Err(Attempt::Retry(message)) => {
                    warn!(attempt, error = %message, "Custodial signing attempt failed");
                    last_error = message;
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(SigningError::Custodial(format!(
            "gave up after {} attempts: {}",
            self.config.max_attempts, last_error
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};

    use super::*;
    use crate::stellar::horizon::fake::TEST_NETWORK;
    use crate::stellar::Keypair;

    struct Custodian {
        keypair: Keypair,
        failures: AtomicUsize,
        status: StatusCode,
        calls: AtomicUsize,
    }

    #[derive(Deserialize)]
    struct Request {
        transaction_hash: String,
    }

    async fn sign_handler(
        State(custodian): State<Arc<Custodian>>,
        headers: HeaderMap,
        Json(req): Json<Request>,
    ) -> Result<Json<serde_json::Value>, StatusCode> {
        custodian.calls.fetch_add(1, Ordering::SeqCst);
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer secret-key") {
            return Err(StatusCode::UNAUTHORIZED);
        }
        if custodian
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(custodian.status);
        }
        let hash: [u8; 32] = hex::decode(req.transaction_hash).unwrap().try_into().unwrap();
        let signature = custodian.keypair.sign_decorated(&hash).unwrap();
        Ok(Json(serde_json::json!({
            "signature": base64::engine::general_purpose::STANDARD.encode(signature.signature.0.to_vec())
        })))
    }

    async fn spawn_custodian(failures: usize, status: StatusCode) -> (String, Arc<Custodian>) {
        let custodian = Arc::new(Custodian {
            keypair: Keypair::random(),
            failures: AtomicUsize::new(failures),
            status,
            calls: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/v1/sign", post(sign_handler))
            .with_state(custodian.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), custodian)
    }

    fn signer(url: &str, api_key: &str) -> CustodialSigner {
        let mut config = CustodialConfig::new(url, api_key, TEST_NETWORK);
        config.initial_backoff = Duration::from_millis(1);
        CustodialSigner::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let (url, custodian) = spawn_custodian(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let signer = signer(&url, "secret-key");
        let hash = [9u8; 32];

        let signature = signer.sign(&hash, &custodian.keypair.address()).await.unwrap();
        assert!(verify_decorated(&custodian.keypair.address(), &hash, &signature));
        assert_eq!(custodian.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (url, custodian) = spawn_custodian(10, StatusCode::BAD_GATEWAY).await;
        let signer = signer(&url, "secret-key");

        let err = signer
            .sign(&[1u8; 32], &custodian.keypair.address())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Signing(SigningError::Custodial(_))));
        assert_eq!(custodian.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (url, custodian) = spawn_custodian(0, StatusCode::OK).await;
        let signer = signer(&url, "wrong-key");

        assert!(signer
            .sign(&[1u8; 32], &custodian.keypair.address())
            .await
            .is_err());
        assert_eq!(custodian.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signature_for_wrong_account_is_rejected() {
        let (url, _custodian) = spawn_custodian(0, StatusCode::OK).await;
        let signer = signer(&url, "secret-key");

        let err = signer
            .sign(&[1u8; 32], &Keypair::random().address())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }

    #[tokio::test]
    async fn test_key_operations_are_unsupported() {
        let signer = signer("http://127.0.0.1:9", "secret-key");
        assert!(signer.batch_insert(1).await.unwrap_err().is_unsupported());
        assert!(signer.delete("GABC").await.unwrap_err().is_unsupported());
    }
}
