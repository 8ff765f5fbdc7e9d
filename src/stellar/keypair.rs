use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use stellar_strkey::ed25519::{PrivateKey, PublicKey as StrkeyPublicKey};
use stellar_xdr::curr::{
    AccountId, BytesM, DecoratedSignature, MuxedAccount, PublicKey, Signature, SignatureHint,
    Uint256,
};
use zeroize::Zeroizing;

use crate::error::LedgerError;

/// Ed25519 ledger identity. Signing never mutates the key, so a keypair can be
/// shared across concurrent workers behind an `Arc`.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn random() -> Self {
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(rand::random());
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse an `S...` secret seed
    pub fn from_secret(secret: &str) -> Result<Self, LedgerError> {
        let private = PrivateKey::from_string(secret.trim()).map_err(|e| {
            LedgerError::InvalidAddress {
                address: "<secret>".to_string(),
                reason: format!("{:?}", e),
            }
        })?;
        Ok(Self::from_seed(&private.0))
    }

    /// The `S...` encoding of the seed
    pub fn secret(&self) -> Zeroizing<String> {
        Zeroizing::new(PrivateKey(self.signing_key.to_bytes()).to_string())
    }

    /// The `G...` account address
    pub fn address(&self) -> String {
        StrkeyPublicKey(self.public_key_bytes()).to_string()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn hint(&self) -> SignatureHint {
        signature_hint(&self.public_key_bytes())
    }

    /// Sign a 32-byte transaction hash and wrap the signature with its hint
    pub fn sign_decorated(&self, hash: &[u8; 32]) -> Result<DecoratedSignature, LedgerError> {
        let signature = self.signing_key.sign(hash);
        let bytes: BytesM<64> = signature
            .to_bytes()
            .to_vec()
            .try_into()
            .map_err(|_| LedgerError::Build("Invalid signature length".to_string()))?;

        Ok(DecoratedSignature {
            hint: self.hint(),
            signature: Signature(bytes),
        })
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish()
    }
}

pub fn signature_hint(public_key: &[u8; 32]) -> SignatureHint {
    let mut hint = [0u8; 4];
    hint.copy_from_slice(&public_key[28..32]);
    SignatureHint(hint)
}

/// Decode a `G...` address into raw key bytes
pub fn decode_address(address: &str) -> Result<[u8; 32], LedgerError> {
    StrkeyPublicKey::from_string(address)
        .map(|pk| pk.0)
        .map_err(|e| LedgerError::InvalidAddress {
            address: address.to_string(),
            reason: format!("{:?}", e),
        })
}

pub fn is_valid_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

pub fn account_id(address: &str) -> Result<AccountId, LedgerError> {
    let key = decode_address(address)?;
    Ok(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(key))))
}

pub fn muxed_account(address: &str) -> Result<MuxedAccount, LedgerError> {
    let key = decode_address(address)?;
    Ok(MuxedAccount::Ed25519(Uint256(key)))
}

pub fn address_of_muxed(account: &MuxedAccount) -> String {
    match account {
        MuxedAccount::Ed25519(Uint256(key)) => StrkeyPublicKey(*key).to_string(),
        MuxedAccount::MuxedEd25519(muxed) => StrkeyPublicKey(muxed.ed25519.0).to_string(),
    }
}

/// Check a decorated signature against an address. Used to validate
/// signatures returned by remote signers.
pub fn verify_decorated(address: &str, hash: &[u8; 32], signature: &DecoratedSignature) -> bool {
    let Ok(key) = decode_address(address) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key) else {
        return false;
    };
    let bytes: &[u8] = &signature.signature.0;
    let Ok(raw) = <[u8; 64]>::try_from(bytes) else {
        return false;
    };
    signature.hint == signature_hint(&key)
        && verifying_key
            .verify(hash, &ed25519_dalek::Signature::from_bytes(&raw))
            .is_ok()
}
