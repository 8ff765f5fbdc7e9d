pub mod crypto;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, AppResult, SigningError};
use crate::stellar::Keypair;

pub use crypto::{KdfParams, KeyEncryptor};

/// Persistence for encrypted private keys, keyed by public address
#[async_trait]
pub trait KeyVault: Send + Sync {
    /// Persist `(public_key, encrypted_private_key)` pairs atomically
    async fn store(&self, entries: &[(String, String)]) -> AppResult<()>;

    async fn load(&self, public_key: &str) -> AppResult<Option<String>>;

    async fn delete(&self, public_key: &str) -> AppResult<()>;
}

/// Encrypts keys before they reach a [`KeyVault`] and decrypts them just in time for signing.
/// Key derivation is memory-hard, so it runs on the blocking pool.
pub struct EncryptedKeyStore {
    vault: Arc<dyn KeyVault>,
    encryptor: KeyEncryptor,
}

impl EncryptedKeyStore {
    pub fn new(vault: Arc<dyn KeyVault>, encryptor: KeyEncryptor) -> Self {
        Self { vault, encryptor }
    }

    pub async fn store(&self, keypairs: &[Keypair]) -> AppResult<()> {
        let encryptor = self.encryptor.clone();
        let keypairs = keypairs.to_vec();
        let entries = blocking(move || {
            keypairs
                .iter()
                .map(|kp| Ok((kp.address(), encryptor.encrypt(&kp.secret())?)))
                .collect::<AppResult<Vec<_>>>()
        })
        .await?;
        self.vault.store(&entries).await?;
        debug!(count = entries.len(), "stored encrypted keys");
        Ok(())
    }

    pub async fn keypair(&self, public_key: &str) -> AppResult<Keypair> {
        let encrypted = self
            .vault
            .load(public_key)
            .await?
            .ok_or_else(|| SigningError::UnknownAccount(public_key.to_string()))?;
        let encryptor = self.encryptor.clone();
        let secret = blocking(move || encryptor.decrypt(&encrypted))
            .await
            .map_err(|_| SigningError::Decrypt(public_key.to_string()))?;
        let keypair = Keypair::from_secret(&secret)?;

        if keypair.address() != public_key {
            return Err(SigningError::Decrypt(public_key.to_string()).into());
        }
        Ok(keypair)
    }

    pub async fn delete(&self, public_key: &str) -> AppResult<()> {
        self.vault.delete(public_key).await
    }
}

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("Key encryption task failed: {}", e)))?
}
