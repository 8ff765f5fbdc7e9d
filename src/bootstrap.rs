use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    channel_accounts::{ChannelAccountService, PgAdvisoryLock, RetryPolicy},
    config::Config,
    error::AppResult,
    keystore::{EncryptedKeyStore, KdfParams, KeyEncryptor},
    resolver::DistributionAccountResolver,
    signing::{
        custodial::{CustodialConfig, CustodialSigner},
        db_vault::DbVaultSigner,
        env_secret::EnvSecretSigner,
        SignatureService,
    },
    stellar::{HorizonClient, HorizonConfig, Keypair, LedgerClient, LedgerNumberTracker},
    store::{
        ChannelAccountStore, DistributionAccountStore, PaymentStore, PgChannelAccountStore,
        PgDistributionAccountStore, PgKeyVault, PgPaymentStore,
    },
    submitter::{SubmitterEngine, TransactionProcessingLimiter, TransactionWorker},
};

/// Everything the process needs, built once at startup and shared by handle
pub struct Dependencies {
    pub config: Config,
    pub pool: PgPool,
    pub channel_accounts: Arc<dyn ChannelAccountStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub distribution_accounts: Arc<dyn DistributionAccountStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub tracker: Arc<LedgerNumberTracker>,
    pub signatures: Arc<SignatureService>,
    pub resolver: Arc<DistributionAccountResolver>,
    pub pool_manager: Arc<ChannelAccountService>,
    pub limiter: Arc<TransactionProcessingLimiter>,
}

impl Dependencies {
    pub async fn build(config: Config) -> AppResult<Self> {
        info!("Initializing submission subsystem components");

        let pool = initialize_database(&config).await?;

        let channel_store = Arc::new(PgChannelAccountStore::new(pool.clone()));
        let payments: Arc<dyn PaymentStore> = Arc::new(PgPaymentStore::new(pool.clone()));
        let distribution_accounts: Arc<dyn DistributionAccountStore> =
            Arc::new(PgDistributionAccountStore::new(pool.clone()));

        let ledger: Arc<dyn LedgerClient> = Arc::new(HorizonClient::new(HorizonConfig {
            horizon_url: config.horizon_url.clone(),
            ..HorizonConfig::default()
        })?);
        let tracker = Arc::new(LedgerNumberTracker::new(ledger.clone()));
        info!(horizon_url = %config.horizon_url, "Ledger client configured");

        let signatures = Arc::new(build_signature_service(&config, &pool, channel_store.clone())?);
        signatures.validate()?;
        info!(network = %config.network_passphrase, "Signature service validated");

        let resolver = Arc::new(DistributionAccountResolver::new(
            distribution_accounts.clone(),
            config.resolver_cache_ttl,
        ));

        let host_account = Keypair::from_secret(&config.host_account_secret)?.address();
        let channel_accounts: Arc<dyn ChannelAccountStore> = channel_store;
        let pool_manager = Arc::new(ChannelAccountService::new(
            channel_accounts.clone(),
            ledger.clone(),
            tracker.clone(),
            signatures.clone(),
            Arc::new(PgAdvisoryLock::new(pool.clone())),
            host_account,
            config.max_base_fee,
            RetryPolicy::default(),
        ));
        let limiter = Arc::new(TransactionProcessingLimiter::new(config.submitter.workers));

        Ok(Self {
            config,
            pool,
            channel_accounts,
            payments,
            distribution_accounts,
            ledger,
            tracker,
            signatures,
            resolver,
            pool_manager,
            limiter,
        })
    }

    pub fn submitter(&self) -> Arc<SubmitterEngine> {
        let worker = Arc::new(TransactionWorker::new(
            self.payments.clone(),
            self.channel_accounts.clone(),
            self.ledger.clone(),
            self.tracker.clone(),
            self.signatures.clone(),
            self.resolver.clone(),
            self.limiter.clone(),
            self.config.submitter.clone(),
        ));
        Arc::new(SubmitterEngine::new(
            self.payments.clone(),
            self.channel_accounts.clone(),
            self.ledger.clone(),
            self.tracker.clone(),
            self.limiter.clone(),
            worker,
            self.config.submitter.clone(),
        ))
    }
}

fn build_signature_service(
    config: &Config,
    pool: &PgPool,
    channel_store: Arc<PgChannelAccountStore>,
) -> AppResult<SignatureService> {
    let passphrase = config.network_passphrase.as_str();

    let channel_keys = EncryptedKeyStore::new(
        channel_store,
        KeyEncryptor::new(
            config.channel_account_encryption_passphrase.clone(),
            KdfParams::default(),
        )?,
    );
    let mut service = SignatureService::new(passphrase)
        .with_channel_signer(Arc::new(DbVaultSigner::new(channel_keys, passphrase)))
        .with_host_signer(Arc::new(EnvSecretSigner::from_secret(
            &config.host_account_secret,
            passphrase,
        )?));

    if let Some(secret) = &config.distribution_account_secret {
        service = service.with_distribution_signer(Arc::new(EnvSecretSigner::from_secret(secret, passphrase)?));
        info!("Distribution signer enabled: env_secret");
    }
    if let Some(vault_passphrase) = &config.distribution_account_encryption_passphrase {
        let keys = EncryptedKeyStore::new(
            Arc::new(PgKeyVault::new(pool.clone())),
            KeyEncryptor::new(vault_passphrase.clone(), KdfParams::default())?,
        );
        service = service.with_distribution_signer(Arc::new(DbVaultSigner::new(keys, passphrase)));
        info!("Distribution signer enabled: db_vault");
    }
    if let Some(custodial) = &config.custodial {
        let signer = CustodialSigner::new(CustodialConfig::new(
            custodial.api_url.clone(),
            custodial.api_key.clone(),
            passphrase,
        ))?;
        service = service.with_distribution_signer(Arc::new(signer));
        info!(api_url = %custodial.api_url, "Distribution signer enabled: custodial");
    }
    Ok(service)
}

async fn initialize_database(config: &Config) -> AppResult<PgPool> {
    info!("Connecting to database");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;
    info!(max_connections = config.database_max_connections, "Database pool configured");

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");
    Ok(pool)
}
