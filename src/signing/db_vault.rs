use async_trait::async_trait;
use stellar_xdr::curr::DecoratedSignature;
use tracing::{info, instrument};

use super::SignatureClient;
use crate::error::AppResult;
use crate::keystore::EncryptedKeyStore;
use crate::stellar::Keypair;
use crate::store::models::SignerBackend;

/// Keys encrypted at rest in the database, decrypted only for the duration of a signature
pub struct DbVaultSigner {
    keys: EncryptedKeyStore,
    network_passphrase: String,
}

impl DbVaultSigner {
    pub fn new(keys: EncryptedKeyStore, network_passphrase: impl Into<String>) -> Self {
        Self {
            keys,
            network_passphrase: network_passphrase.into(),
        }
    }
}

#[async_trait]
impl SignatureClient for DbVaultSigner {
    fn backend(&self) -> SignerBackend {
        SignerBackend::DbVault
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    async fn sign(&self, hash: &[u8; 32], account: &str) -> AppResult<DecoratedSignature> {
        let keypair = self.keys.keypair(account).await?;
        Ok(keypair.sign_decorated(hash)?)
    }

    #[instrument(skip(self))]
    async fn batch_insert(&self, count: usize) -> AppResult<Vec<String>> {
        let keypairs: Vec<Keypair> = (0..count).map(|_| Keypair::random()).collect();
        self.keys.store(&keypairs).await?;

        let addresses: Vec<String> = keypairs.iter().map(Keypair::address).collect();
        info!(count = addresses.len(), "Provisioned vault keys");
        Ok(addresses)
    }

    async fn delete(&self, public_key: &str) -> AppResult<()> {
        self.keys.delete(public_key).await
    }
}
