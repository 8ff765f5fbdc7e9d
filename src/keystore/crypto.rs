//! Passphrase encryption for private keys at rest (Argon2id + XChaCha20-Poly1305).
//!
//! Layout, base64 encoded:
//! [ Version: u8 ][ m_cost: u32 ][ t_cost: u32 ][ p_cost: u32 ][ Salt: 16 ][ Nonce: 24 ][ Ciphertext + Tag ]
//!
//! The header is authenticated as associated data.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::error::{AppError, AppResult};

const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = 1 + 4 + 4 + 4 + SALT_LEN + NONCE_LEN;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests
    pub fn insecure_fast() -> Self {
        Self {
            m_cost: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

/// Encrypts and decrypts key material with a configured passphrase
#[derive(Clone)]
pub struct KeyEncryptor {
    passphrase: Zeroizing<String>,
    params: KdfParams,
}

impl std::fmt::Debug for KeyEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEncryptor")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl KeyEncryptor {
    pub fn new(passphrase: impl Into<String>, params: KdfParams) -> AppResult<Self> {
        let passphrase = Zeroizing::new(passphrase.into());
        if passphrase.is_empty() {
            return Err(AppError::Config("Encryption passphrase cannot be empty".to_string()));
        }
        Ok(Self { passphrase, params })
    }

    pub fn encrypt(&self, secret: &str) -> AppResult<String> {
        let salt: [u8; SALT_LEN] = rand::random();
        let nonce: [u8; NONCE_LEN] = rand::random();

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.push(FORMAT_VERSION);
        header.extend_from_slice(&self.params.m_cost.to_be_bytes());
        header.extend_from_slice(&self.params.t_cost.to_be_bytes());
        header.extend_from_slice(&self.params.p_cost.to_be_bytes());
        header.extend_from_slice(&salt);
        header.extend_from_slice(&nonce);

        let key = derive_key(&self.passphrase, &salt, &self.params)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: secret.as_bytes(),
                    aad: &header,
                },
            )
            .map_err(|e| AppError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut out = header;
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> AppResult<Zeroizing<String>> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| AppError::Crypto(format!("Invalid key encoding: {}", e)))?;

        if data.len() <= HEADER_LEN {
            return Err(AppError::Crypto("Encrypted key too short".to_string()));
        }
        if data[0] != FORMAT_VERSION {
            return Err(AppError::Crypto(format!(
                "Unsupported key format version: {}",
                data[0]
            )));
        }

        let (header, ciphertext) = data.split_at(HEADER_LEN);
        let params = KdfParams {
            m_cost: read_u32(&header[1..5])?,
            t_cost: read_u32(&header[5..9])?,
            p_cost: read_u32(&header[9..13])?,
        };
        let salt = &header[13..13 + SALT_LEN];
        let nonce = &header[13 + SALT_LEN..HEADER_LEN];

        let key = derive_key(&self.passphrase, salt, &params)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: header,
                    },
                )
                .map_err(|_| AppError::Crypto("Decryption failed (wrong passphrase?)".to_string()))?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| AppError::Crypto("Decrypted key is not valid UTF-8".to_string()))
    }
}

fn read_u32(bytes: &[u8]) -> AppResult<u32> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| AppError::Crypto("Invalid header".to_string()))?;
    Ok(u32::from_be_bytes(array))
}

fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> AppResult<Zeroizing<[u8; KEY_LEN]>> {
    let argon_params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_LEN))
        .map_err(|e| AppError::Crypto(format!("Invalid Argon2 parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| AppError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}
