use async_trait::async_trait;
use stellar_xdr::curr::DecoratedSignature;

use super::SignatureClient;
use crate::error::{AppResult, SigningError};
use crate::stellar::Keypair;
use crate::store::models::SignerBackend;

/// A single static key supplied through the environment. Nothing to provision,
/// so `batch_insert` and `delete` keep the trait's unsupported answer.
pub struct EnvSecretSigner {
    keypair: Keypair,
    network_passphrase: String,
}

impl EnvSecretSigner {
    pub fn new(keypair: Keypair, network_passphrase: impl Into<String>) -> Self {
        Self {
            keypair,
            network_passphrase: network_passphrase.into(),
        }
    }

    pub fn from_secret(secret: &str, network_passphrase: impl Into<String>) -> AppResult<Self> {
        Ok(Self::new(Keypair::from_secret(secret)?, network_passphrase))
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }
}

#[async_trait]
impl SignatureClient for EnvSecretSigner {
    fn backend(&self) -> SignerBackend {
        SignerBackend::EnvSecret
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    async fn sign(&self, hash: &[u8; 32], account: &str) -> AppResult<DecoratedSignature> {
        if account != self.keypair.address() {
            return Err(SigningError::UnknownAccount(account.to_string()).into());
        }
        Ok(self.keypair.sign_decorated(hash)?)
    }
}
