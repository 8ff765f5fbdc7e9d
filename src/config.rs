use std::fmt;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};
use serde::Deserialize;

use crate::channel_accounts::MAX_CHANNEL_ACCOUNTS;
use crate::error::{AppError, AppResult};
use crate::submitter::SubmitterConfig;

/// Shortest allowed pause between claim iterations, about one ledger close
pub const MIN_POLLING_INTERVAL_SECS: u64 = 6;
/// Minimum per-operation fee accepted by the network, in stroops
pub const MIN_BASE_FEE: u32 = 100;

#[derive(Deserialize)]
struct RawConfig {
    database_url: String,
    database_max_connections: u32,
    bind_address: String,
    horizon_url: String,
    network_passphrase: String,
    host_account_secret: Option<String>,
    distribution_account_secret: Option<String>,
    channel_account_encryption_passphrase: Option<String>,
    distribution_account_encryption_passphrase: Option<String>,
    custodial_api_url: Option<String>,
    custodial_api_key: Option<String>,
    max_base_fee: u32,
    num_channel_accounts: Option<usize>,
    submitter_polling_interval_secs: u64,
    submitter_workers: usize,
    submitter_max_attempts: u32,
    submitter_confirmation_timeout_secs: u64,
    submitter_lease_timeout_secs: u64,
    submitter_disbursement_share: f64,
    payment_cancellation_period_days: Option<u64>,
    resolver_cache_ttl_secs: u64,
}

#[derive(Clone)]
pub struct CustodialSettings {
    pub api_url: String,
    pub api_key: String,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,
    pub horizon_url: String,
    pub network_passphrase: String,
    pub host_account_secret: String,
    pub distribution_account_secret: Option<String>,
    pub channel_account_encryption_passphrase: String,
    pub distribution_account_encryption_passphrase: Option<String>,
    pub custodial: Option<CustodialSettings>,
    pub max_base_fee: u32,
    pub num_channel_accounts: Option<usize>,
    pub submitter: SubmitterConfig,
    pub resolver_cache_ttl: Duration,
}

// secrets stay out of logs
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("horizon_url", &self.horizon_url)
            .field("network_passphrase", &self.network_passphrase)
            .field("distribution_env_secret", &self.distribution_account_secret.is_some())
            .field("distribution_db_vault", &self.distribution_account_encryption_passphrase.is_some())
            .field("custodial", &self.custodial.as_ref().map(|c| c.api_url.as_str()))
            .field("max_base_fee", &self.max_base_fee)
            .field("num_channel_accounts", &self.num_channel_accounts)
            .field("submitter", &self.submitter)
            .field("resolver_cache_ttl", &self.resolver_cache_ttl)
            .finish()
    }
}

impl Config {
    /// Load from the process environment (and `.env`, if present)
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();
        Self::load(defaults()?.add_source(Environment::default()))
    }

    fn load(builder: ConfigBuilder<DefaultState>) -> AppResult<Self> {
        let raw: RawConfig = builder.build()?.try_deserialize()?;
        raw.validate()
    }
}

fn defaults() -> AppResult<ConfigBuilder<DefaultState>> {
    Ok(config::Config::builder()
        .set_default("database_url", "postgresql://localhost/disbursement")?
        .set_default("database_max_connections", 20)?
        .set_default("bind_address", "0.0.0.0:8080")?
        .set_default("horizon_url", "https://horizon-testnet.stellar.org")?
        .set_default("network_passphrase", "Test SDF Network ; September 2015")?
        .set_default("max_base_fee", 10_000)?
        .set_default("submitter_polling_interval_secs", MIN_POLLING_INTERVAL_SECS as i64)?
        .set_default("submitter_workers", 8)?
        .set_default("submitter_max_attempts", 5)?
        .set_default("submitter_confirmation_timeout_secs", 60)?
        .set_default("submitter_lease_timeout_secs", 300)?
        .set_default("submitter_disbursement_share", 0.5)?
        .set_default("resolver_cache_ttl_secs", 300)?)
}

/// Treat empty variables as unset
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required(value: Option<String>, name: &str) -> AppResult<String> {
    present(value).ok_or_else(|| AppError::Config(format!("{} must be set", name)))
}

impl RawConfig {
    fn validate(self) -> AppResult<Config> {
        if self.submitter_polling_interval_secs < MIN_POLLING_INTERVAL_SECS {
            return Err(AppError::Config(format!(
                "SUBMITTER_POLLING_INTERVAL_SECS must be at least {}, got {}",
                MIN_POLLING_INTERVAL_SECS, self.submitter_polling_interval_secs
            )));
        }
        if self.submitter_workers == 0 {
            return Err(AppError::Config("SUBMITTER_WORKERS must be positive".to_string()));
        }
        if self.submitter_max_attempts == 0 {
            return Err(AppError::Config("SUBMITTER_MAX_ATTEMPTS must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.submitter_disbursement_share) {
            return Err(AppError::Config(format!(
                "SUBMITTER_DISBURSEMENT_SHARE must be between 0 and 1, got {}",
                self.submitter_disbursement_share
            )));
        }
        if self.max_base_fee < MIN_BASE_FEE {
            return Err(AppError::Config(format!(
                "MAX_BASE_FEE must be at least {} stroops",
                MIN_BASE_FEE
            )));
        }
        if let Some(n) = self.num_channel_accounts {
            if n > MAX_CHANNEL_ACCOUNTS {
                return Err(AppError::Config(format!(
                    "NUM_CHANNEL_ACCOUNTS must not exceed {}",
                    MAX_CHANNEL_ACCOUNTS
                )));
            }
        }
        if self.payment_cancellation_period_days == Some(0) {
            return Err(AppError::Config(
                "PAYMENT_CANCELLATION_PERIOD_DAYS must be positive when set".to_string(),
            ));
        }
        if self.network_passphrase.trim().is_empty() {
            return Err(AppError::Config("NETWORK_PASSPHRASE must be set".to_string()));
        }

        let custodial = match (present(self.custodial_api_url), present(self.custodial_api_key)) {
            (Some(api_url), Some(api_key)) => Some(CustodialSettings { api_url, api_key }),
            (None, None) => None,
            _ => {
                return Err(AppError::Config(
                    "CUSTODIAL_API_URL and CUSTODIAL_API_KEY must be set together".to_string(),
                ))
            }
        };
        let distribution_account_secret = present(self.distribution_account_secret);
        let distribution_account_encryption_passphrase =
            present(self.distribution_account_encryption_passphrase);
        if distribution_account_secret.is_none()
            && distribution_account_encryption_passphrase.is_none()
            && custodial.is_none()
        {
            return Err(AppError::Config(
                "At least one distribution account signer must be configured".to_string(),
            ));
        }

        Ok(Config {
            database_url: self.database_url,
            database_max_connections: self.database_max_connections,
            bind_address: self.bind_address,
            horizon_url: self.horizon_url,
            network_passphrase: self.network_passphrase,
            host_account_secret: required(self.host_account_secret, "HOST_ACCOUNT_SECRET")?,
            distribution_account_secret,
            channel_account_encryption_passphrase: required(
                self.channel_account_encryption_passphrase,
                "CHANNEL_ACCOUNT_ENCRYPTION_PASSPHRASE",
            )?,
            distribution_account_encryption_passphrase,
            custodial,
            max_base_fee: self.max_base_fee,
            num_channel_accounts: self.num_channel_accounts,
            submitter: SubmitterConfig {
                workers: self.submitter_workers,
                polling_interval: Duration::from_secs(self.submitter_polling_interval_secs),
                max_attempts: self.submitter_max_attempts,
                confirmation_timeout: Duration::from_secs(self.submitter_confirmation_timeout_secs),
                lease_timeout: Duration::from_secs(self.submitter_lease_timeout_secs),
                disbursement_share: self.submitter_disbursement_share,
                base_fee: self.max_base_fee,
                payment_cancellation_period: self
                    .payment_cancellation_period_days
                    .map(|days| Duration::from_secs(days * 24 * 60 * 60)),
                ..SubmitterConfig::default()
            },
            resolver_cache_ttl: Duration::from_secs(self.resolver_cache_ttl_secs),
        })
    }
}
