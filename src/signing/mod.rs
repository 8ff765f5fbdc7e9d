//! Signature service: one signing contract over several key custody models.
//!
//! Three roles are configured independently. The channel signer signs for
//! channel accounts, the host signer for the platform host account, and the
//! distribution signers (one per [`SignerBackend`]) for tenant funding accounts.
//! Backends that have nothing to provision answer `batch_insert` and `delete`
//! with [`SigningError::Unsupported`].

pub mod custodial;
pub mod db_vault;
pub mod env_secret;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stellar_xdr::curr::{
    DecoratedSignature, FeeBumpTransactionEnvelope, Transaction, TransactionEnvelope,
    TransactionV1Envelope, VecM,
};
use tracing::debug;

use crate::error::{AppError, AppResult, LedgerError, SigningError};
use crate::stellar::transaction::{
    encode_envelope, fee_bump_hash, network_id, transaction_hash, wrap_in_fee_bump,
};
use crate::store::models::SignerBackend;

pub use custodial::{CustodialConfig, CustodialSigner};
pub use db_vault::DbVaultSigner;
pub use env_secret::EnvSecretSigner;

#[async_trait]
pub trait SignatureClient: Send + Sync {
    fn backend(&self) -> SignerBackend;

    fn network_passphrase(&self) -> &str;

    /// Sign a transaction hash on behalf of `account`
    async fn sign(&self, hash: &[u8; 32], account: &str) -> AppResult<DecoratedSignature>;

    /// Provision `count` new keys, returning their public addresses
    async fn batch_insert(&self, _count: usize) -> AppResult<Vec<String>> {
        Err(SigningError::Unsupported {
            backend: self.backend().as_str(),
            operation: "batch_insert",
        }
        .into())
    }

    async fn delete(&self, _public_key: &str) -> AppResult<()> {
        Err(SigningError::Unsupported {
            backend: self.backend().as_str(),
            operation: "delete",
        }
        .into())
    }
}

/// A signed, encoded envelope ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// Hex hash of the outermost transaction
    pub hash: String,
    pub xdr: String,
}

#[derive(Clone)]
pub struct SignatureService {
    network_passphrase: String,
    network_id: [u8; 32],
    channel: Option<Arc<dyn SignatureClient>>,
    host: Option<Arc<dyn SignatureClient>>,
    distribution: HashMap<SignerBackend, Arc<dyn SignatureClient>>,
}

impl SignatureService {
    pub fn new(network_passphrase: impl Into<String>) -> Self {
        let network_passphrase = network_passphrase.into();
        Self {
            network_id: network_id(&network_passphrase),
            network_passphrase,
            channel: None,
            host: None,
            distribution: HashMap::new(),
        }
    }

    pub fn with_channel_signer(mut self, signer: Arc<dyn SignatureClient>) -> Self {
        self.channel = Some(signer);
        self
    }

    pub fn with_host_signer(mut self, signer: Arc<dyn SignatureClient>) -> Self {
        self.host = Some(signer);
        self
    }

    pub fn with_distribution_signer(mut self, signer: Arc<dyn SignatureClient>) -> Self {
        self.distribution.insert(signer.backend(), signer);
        self
    }

    pub fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    pub fn network_id(&self) -> &[u8; 32] {
        &self.network_id
    }

    /// Every role must be configured and on the same network
    pub fn validate(&self) -> AppResult<()> {
        let channel = self.channel_signer()?;
        let host = self.host_signer()?;
        if self.distribution.is_empty() {
            return Err(SigningError::MissingSigner {
                backend: "distribution",
            }
            .into());
        }

        let roles = [("channel", channel), ("host", host)]
            .into_iter()
            .chain(self.distribution.values().map(|s| ("distribution", s)));
        for (role, signer) in roles {
            if signer.network_passphrase() != self.network_passphrase {
                return Err(SigningError::NetworkMismatch {
                    signer: role,
                    expected: self.network_passphrase.clone(),
                    actual: signer.network_passphrase().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn channel_signer(&self) -> AppResult<&Arc<dyn SignatureClient>> {
        self.channel
            .as_ref()
            .ok_or_else(|| SigningError::MissingSigner { backend: "channel" }.into())
    }

    pub fn host_signer(&self) -> AppResult<&Arc<dyn SignatureClient>> {
        self.host
            .as_ref()
            .ok_or_else(|| SigningError::MissingSigner { backend: "host" }.into())
    }

    pub fn distribution_signer(&self, backend: SignerBackend) -> AppResult<&Arc<dyn SignatureClient>> {
        self.distribution.get(&backend).ok_or_else(|| {
            SigningError::MissingSigner {
                backend: backend.as_str(),
            }
            .into()
        })
    }

    /// Sign a payment: the channel account and distribution account sign the
    /// inner transaction, then the distribution account pays for it through a
    /// fee bump.
    pub async fn sign_payment(
        &self,
        tx: Transaction,
        channel_account: &str,
        distribution_account: &str,
        backend: SignerBackend,
        base_fee: u32,
    ) -> AppResult<SignedEnvelope> {
        let distribution = self.distribution_signer(backend)?;
        let inner_hash = transaction_hash(&tx, &self.network_id)?;

        let signatures = vec![
            self.channel_signer()?.sign(&inner_hash, channel_account).await?,
            distribution.sign(&inner_hash, distribution_account).await?,
        ];
        let inner = TransactionV1Envelope {
            tx,
            signatures: to_vecm(signatures)?,
        };

        let fee_bump = wrap_in_fee_bump(inner, distribution_account, base_fee)?;
        let outer_hash = fee_bump_hash(&fee_bump, &self.network_id)?;
        let fee_bump_signature = distribution.sign(&outer_hash, distribution_account).await?;

        let envelope = TransactionEnvelope::TxFeeBump(FeeBumpTransactionEnvelope {
            tx: fee_bump,
            signatures: to_vecm(vec![fee_bump_signature])?,
        });
        debug!(channel_account, distribution_account, backend = %backend, "signed payment envelope");

        Ok(SignedEnvelope {
            hash: hex::encode(outer_hash),
            xdr: encode_envelope(&envelope)?,
        })
    }

    /// Sign a pool-maintenance transaction with the host plus the given channel accounts
    pub async fn sign_with_host(
        &self,
        tx: Transaction,
        host_account: &str,
        channel_accounts: &[String],
    ) -> AppResult<SignedEnvelope> {
        let hash = transaction_hash(&tx, &self.network_id)?;

        let mut signatures = Vec::with_capacity(channel_accounts.len() + 1);
        signatures.push(self.host_signer()?.sign(&hash, host_account).await?);
        let channel = self.channel_signer()?;
        for account in channel_accounts {
            signatures.push(channel.sign(&hash, account).await?);
        }

        let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
            tx,
            signatures: to_vecm(signatures)?,
        });
        Ok(SignedEnvelope {
            hash: hex::encode(hash),
            xdr: encode_envelope(&envelope)?,
        })
    }
}

fn to_vecm(signatures: Vec<DecoratedSignature>) -> AppResult<VecM<DecoratedSignature, 20>> {
    signatures
        .try_into()
        .map_err(|_| AppError::Ledger(LedgerError::Build("Too many signatures".to_string())))
}
