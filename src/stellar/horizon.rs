use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Ledger rejection codes that no amount of retrying will fix
const TERMINAL_TX_CODES: [&str; 3] = ["tx_bad_auth", "tx_bad_auth_extra", "tx_insufficient_balance"];
const TERMINAL_OP_CODES: [&str; 8] = [
    "op_bad_auth",
    "op_underfunded",
    "op_src_not_authorized",
    "op_no_destination",
    "op_no_trust",
    "op_line_full",
    "op_not_authorized",
    "op_no_issuer",
];
const RETRYABLE_TX_CODES: [&str; 3] = ["tx_insufficient_fee", "tx_too_late", "tx_bad_seq"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResultCodes {
    pub transaction: Option<String>,
    pub inner_transaction: Option<String>,
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonErrorKind {
    /// Horizon answered with a problem document
    Response,
    /// The request never got a response
    Network,
    Timeout,
    Decode,
}

/// Error returned by the ledger API, with enough structure to classify it
#[derive(Debug, Clone)]
pub struct HorizonError {
    pub kind: HorizonErrorKind,
    pub status: Option<u16>,
    pub title: String,
    pub result_codes: Option<ResultCodes>,
}

impl fmt::Display for HorizonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "horizon response error: status={} {}", status, self.title)?,
            None => write!(f, "horizon {:?} error: {}", self.kind, self.title)?,
        }
        if let Some(codes) = &self.result_codes {
            if let Some(tx) = &codes.transaction {
                write!(f, ", transaction={}", tx)?;
            }
            if let Some(inner) = &codes.inner_transaction {
                write!(f, ", inner_transaction={}", inner)?;
            }
            if !codes.operations.is_empty() {
                write!(f, ", operations={}", codes.operations.join(","))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for HorizonError {}

impl HorizonError {
    pub fn response(status: u16, title: impl Into<String>, result_codes: Option<ResultCodes>) -> Self {
        Self {
            kind: HorizonErrorKind::Response,
            status: Some(status),
            title: title.into(),
            result_codes,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: HorizonErrorKind::Network,
            status: None,
            title: message.into(),
            result_codes: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: HorizonErrorKind::Timeout,
            status: None,
            title: message.into(),
            result_codes: None,
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::response(404, format!("Resource Missing: {}", resource.into()), None)
    }

    pub fn rejected(tx_code: &str, op_codes: &[&str]) -> Self {
        Self::response(
            400,
            "Transaction Failed",
            Some(ResultCodes {
                transaction: Some(tx_code.to_string()),
                inner_transaction: None,
                operations: op_codes.iter().map(|c| c.to_string()).collect(),
            }),
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.status == Some(429)
    }

    pub fn is_gateway_timeout(&self) -> bool {
        self.status == Some(504)
    }

    fn tx_codes(&self) -> impl Iterator<Item = &str> {
        self.result_codes
            .iter()
            .flat_map(|c| [c.transaction.as_deref(), c.inner_transaction.as_deref()])
            .flatten()
    }

    fn op_codes(&self) -> impl Iterator<Item = &str> {
        self.result_codes
            .iter()
            .flat_map(|c| c.operations.iter().map(String::as_str))
    }

    pub fn has_tx_code(&self, code: &str) -> bool {
        self.tx_codes().any(|c| c == code)
    }

    pub fn is_insufficient_fee(&self) -> bool {
        self.has_tx_code("tx_insufficient_fee")
    }

    /// A definitive rejection: the payment must be marked failed
    pub fn is_terminal(&self) -> bool {
        if self.kind != HorizonErrorKind::Response {
            return false;
        }
        self.tx_codes().any(|c| TERMINAL_TX_CODES.contains(&c))
            || self.op_codes().any(|c| TERMINAL_OP_CODES.contains(&c))
    }

    /// Retry-safe: network errors, gateway timeouts, throttling, server errors and
    /// stale-precondition codes
    pub fn is_retryable(&self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.kind {
            HorizonErrorKind::Network | HorizonErrorKind::Timeout => true,
            HorizonErrorKind::Decode => false,
            HorizonErrorKind::Response => match self.status {
                Some(429) | Some(504) => true,
                Some(s) if s >= 500 => true,
                _ => self.tx_codes().any(|c| RETRYABLE_TX_CODES.contains(&c)),
            },
        }
    }

    /// The outcome of the submission is unknown: the envelope may still land
    pub fn is_indeterminate(&self) -> bool {
        matches!(self.kind, HorizonErrorKind::Network | HorizonErrorKind::Timeout)
            || self.is_gateway_timeout()
            || self.status.map_or(false, |s| s >= 500)
    }

    /// Responses that indicate network congestion
    pub fn is_congestion(&self) -> bool {
        self.is_rate_limit() || self.is_gateway_timeout() || self.is_insufficient_fee()
    }

    /// Rejections caused by the destination wallet rather than the platform
    pub fn is_destination_not_ready(&self) -> bool {
        self.op_codes().any(|c| {
            matches!(
                c,
                "op_no_destination" | "op_no_trust" | "op_line_full" | "op_not_authorized"
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub address: String,
    pub sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub hash: String,
    pub successful: bool,
    pub ledger: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub hash: String,
    pub successful: bool,
    pub ledger: Option<u32>,
}

/// Client to the ledger's public API
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn latest_ledger(&self) -> Result<u32, HorizonError>;

    async fn account(&self, address: &str) -> Result<AccountInfo, HorizonError>;

    /// Submit a base64 envelope and wait for the ledger's verdict
    async fn submit(&self, envelope_xdr: &str) -> Result<SubmitResponse, HorizonError>;

    async fn transaction(&self, hash: &str) -> Result<TransactionRecord, HorizonError>;
}

#[derive(Debug, Clone)]
pub struct HorizonConfig {
    pub horizon_url: String,
    pub request_timeout: Duration,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            horizon_url: "https://horizon-testnet.stellar.org".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
    extras: Option<ProblemExtras>,
}

#[derive(Debug, Deserialize)]
struct ProblemExtras {
    result_codes: Option<ResultCodes>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account_id: String,
    sequence: String,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    hash: String,
    successful: bool,
    ledger: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LedgersPage {
    #[serde(rename = "_embedded")]
    embedded: LedgerRecords,
}

#[derive(Debug, Deserialize)]
struct LedgerRecords {
    records: Vec<LedgerRecord>,
}

#[derive(Debug, Deserialize)]
struct LedgerRecord {
    sequence: u32,
}

/// Horizon REST implementation of [`LedgerClient`]
pub struct HorizonClient {
    config: HorizonConfig,
    http: reqwest::Client,
}

impl HorizonClient {
    pub fn new(config: HorizonConfig) -> Result<Self, HorizonError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HorizonError::network(format!("Failed to build http client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.horizon_url.trim_end_matches('/'), path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HorizonError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| HorizonError {
                kind: HorizonErrorKind::Decode,
                status: Some(status.as_u16()),
                title: format!("Failed to parse response: {}", e),
                result_codes: None,
            });
        }

        let problem = response.json::<Problem>().await.ok();
        let (title, result_codes) = match problem {
            Some(p) => {
                let title = if p.detail.is_empty() {
                    p.title
                } else {
                    format!("{}: {}", p.title, p.detail)
                };
                (title, p.extras.and_then(|e| e.result_codes))
            }
            None => (status.to_string(), None),
        };
        Err(HorizonError::response(status.as_u16(), title, result_codes))
    }
}

fn map_transport(err: reqwest::Error) -> HorizonError {
    if err.is_timeout() {
        HorizonError::timeout(err.to_string())
    } else {
        HorizonError::network(err.to_string())
    }
}

#[async_trait]
impl LedgerClient for HorizonClient {
    async fn latest_ledger(&self) -> Result<u32, HorizonError> {
        let response = self
            .http
            .get(self.url("ledgers?order=desc&limit=1"))
            .send()
            .await
            .map_err(map_transport)?;
        let page: LedgersPage = Self::decode(response).await?;
        page.embedded
            .records
            .first()
            .map(|r| r.sequence)
            .ok_or_else(|| HorizonError {
                kind: HorizonErrorKind::Decode,
                status: None,
                title: "No ledger records returned".to_string(),
                result_codes: None,
            })
    }

    async fn account(&self, address: &str) -> Result<AccountInfo, HorizonError> {
        let response = self
            .http
            .get(self.url(&format!("accounts/{}", address)))
            .send()
            .await
            .map_err(map_transport)?;
        let account: AccountResponse = Self::decode(response).await?;
        let sequence = account.sequence.parse::<i64>().map_err(|_| HorizonError {
            kind: HorizonErrorKind::Decode,
            status: None,
            title: format!("Invalid sequence number: {}", account.sequence),
            result_codes: None,
        })?;

        Ok(AccountInfo {
            address: account.account_id,
            sequence,
        })
    }

    #[instrument(skip(self, envelope_xdr))]
    async fn submit(&self, envelope_xdr: &str) -> Result<SubmitResponse, HorizonError> {
        let response = self
            .http
            .post(self.url("transactions"))
            .form(&[("tx", envelope_xdr)])
            .send()
            .await
            .map_err(map_transport)?;
        let tx: TransactionResponse = Self::decode(response).await?;
        debug!(hash = %tx.hash, successful = tx.successful, "transaction submitted");

        Ok(SubmitResponse {
            hash: tx.hash,
            successful: tx.successful,
            ledger: tx.ledger,
        })
    }

    async fn transaction(&self, hash: &str) -> Result<TransactionRecord, HorizonError> {
        let response = self
            .http
            .get(self.url(&format!("transactions/{}", hash)))
            .send()
            .await
            .map_err(map_transport)?;
        let tx: TransactionResponse = Self::decode(response).await?;

        Ok(TransactionRecord {
            hash: tx.hash,
            successful: tx.successful,
            ledger: tx.ledger,
        })
    }
}
