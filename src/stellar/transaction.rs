use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    AlphaNum12, AlphaNum4, Asset, AssetCode12, AssetCode4, BeginSponsoringFutureReservesOp,
    CreateAccountOp, Duration as XdrDuration, FeeBumpTransaction, FeeBumpTransactionExt,
    FeeBumpTransactionInnerTx, Hash, LedgerBounds, LedgerKey, LedgerKeyAccount, Limits, Memo,
    Operation, OperationBody, PaymentOp, Preconditions, PreconditionsV2, ReadXdr,
    RevokeSponsorshipOp, SequenceNumber, TimeBounds, TimePoint, Transaction, TransactionEnvelope,
    TransactionExt, TransactionSignaturePayload, TransactionSignaturePayloadTaggedTransaction,
    TransactionV1Envelope, VecM, WriteXdr,
};

use super::keypair::{account_id, address_of_muxed, muxed_account};
use crate::error::LedgerError;

/// Reserve sent to a sponsored channel account so it can pay for its own removal (1.5 XLM)
pub const REVOKE_SPONSORSHIP_RESERVE_STROOPS: i64 = 15_000_000;
/// Signature limit of a ledger transaction is 20: the host plus 19 new accounts
pub const MAX_CREATE_ACCOUNTS_PER_TX: usize = 19;
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(300);
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(15);

const STROOPS_PER_UNIT: i64 = 10_000_000;

pub fn network_id(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

/// Validity window attached to every transaction we build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxBounds {
    pub max_time: u64,
    pub max_ledger: u32,
}

impl TxBounds {
    pub fn with_timeout(timeout: Duration, max_ledger: u32) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            max_time: now + timeout.as_secs(),
            max_ledger,
        }
    }

    fn preconditions(&self) -> Preconditions {
        Preconditions::V2(PreconditionsV2 {
            time_bounds: Some(TimeBounds {
                min_time: TimePoint(0),
                max_time: TimePoint(self.max_time),
            }),
            ledger_bounds: Some(LedgerBounds {
                min_ledger: 0,
                max_ledger: self.max_ledger,
            }),
            min_seq_num: None,
            min_seq_age: XdrDuration(0),
            min_seq_ledger_gap: 0,
            extra_signers: VecM::default(),
        })
    }
}

/// Asset reference as stored on a payment row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub code: String,
    pub issuer: Option<String>,
}

impl AssetRef {
    pub fn native() -> Self {
        Self {
            code: "XLM".to_string(),
            issuer: None,
        }
    }

    pub fn to_xdr(&self) -> Result<Asset, LedgerError> {
        let Some(issuer) = &self.issuer else {
            if self.code.eq_ignore_ascii_case("xlm") || self.code.eq_ignore_ascii_case("native") {
                return Ok(Asset::Native);
            }
            return Err(LedgerError::Build(format!(
                "Asset {} requires an issuer",
                self.code
            )));
        };

        let code = self.code.as_bytes();
        let issuer = account_id(issuer)?;
        match code.len() {
            1..=4 => {
                let mut bytes = [0u8; 4];
                bytes[..code.len()].copy_from_slice(code);
                Ok(Asset::CreditAlphanum4(AlphaNum4 {
                    asset_code: AssetCode4(bytes),
                    issuer,
                }))
            }
            5..=12 => {
                let mut bytes = [0u8; 12];
                bytes[..code.len()].copy_from_slice(code);
                Ok(Asset::CreditAlphanum12(AlphaNum12 {
                    asset_code: AssetCode12(bytes),
                    issuer,
                }))
            }
            n => Err(LedgerError::Build(format!("Invalid asset code length: {}", n))),
        }
    }
}

/// Convert a decimal amount to stroops, rejecting precision the ledger cannot carry
pub fn amount_to_stroops(amount: Decimal) -> Result<i64, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Build(format!("Amount must be positive: {}", amount)));
    }
    if amount.normalize().scale() > 7 {
        return Err(LedgerError::Build(format!(
            "Amount {} has more than 7 decimal places",
            amount
        )));
    }
    (amount * Decimal::from(STROOPS_PER_UNIT))
        .to_i64()
        .ok_or_else(|| LedgerError::Build(format!("Amount out of range: {}", amount)))
}

pub struct PaymentParams<'a> {
    pub channel_account: &'a str,
    /// Current on-ledger sequence of the channel account
    pub channel_sequence: i64,
    pub distribution_account: &'a str,
    pub destination: &'a str,
    pub asset: &'a AssetRef,
    pub amount: Decimal,
    pub base_fee: u32,
    pub bounds: TxBounds,
}

/// Payment with the channel account as transaction source and the
/// distribution account as operation source
pub fn build_payment(params: &PaymentParams<'_>) -> Result<Transaction, LedgerError> {
    let op = Operation {
        source_account: Some(muxed_account(params.distribution_account)?),
        body: OperationBody::Payment(PaymentOp {
            destination: muxed_account(params.destination)?,
            asset: params.asset.to_xdr()?,
            amount: amount_to_stroops(params.amount)?,
        }),
    };

    build_transaction(
        params.channel_account,
        params.channel_sequence,
        vec![op],
        params.base_fee,
        params.bounds,
    )
}

pub fn build_create_channel_accounts(
    host: &str,
    host_sequence: i64,
    accounts: &[String],
    base_fee: u32,
    bounds: TxBounds,
) -> Result<Transaction, LedgerError> {
    if accounts.is_empty() || accounts.len() > MAX_CREATE_ACCOUNTS_PER_TX {
        return Err(LedgerError::Build(format!(
            "Cannot create {} accounts in one transaction",
            accounts.len()
        )));
    }

    let mut ops = Vec::with_capacity(accounts.len() * 3);
    for account in accounts {
        ops.push(Operation {
            source_account: None,
            body: OperationBody::BeginSponsoringFutureReserves(BeginSponsoringFutureReservesOp {
                sponsored_id: account_id(account)?,
            }),
        });
        ops.push(Operation {
            source_account: None,
            body: OperationBody::CreateAccount(CreateAccountOp {
                destination: account_id(account)?,
                starting_balance: 0,
            }),
        });
        ops.push(Operation {
            source_account: Some(muxed_account(account)?),
            body: OperationBody::EndSponsoringFutureReserves,
        });
    }

    build_transaction(host, host_sequence, ops, base_fee, bounds)
}

pub fn build_delete_channel_account(
    host: &str,
    host_sequence: i64,
    channel_account: &str,
    base_fee: u32,
    bounds: TxBounds,
) -> Result<Transaction, LedgerError> {
    let ops = vec![
        Operation {
            source_account: None,
            body: OperationBody::Payment(PaymentOp {
                destination: muxed_account(channel_account)?,
                asset: Asset::Native,
                amount: REVOKE_SPONSORSHIP_RESERVE_STROOPS,
            }),
        },
        Operation {
            source_account: None,
            body: OperationBody::RevokeSponsorship(RevokeSponsorshipOp::LedgerEntry(
                LedgerKey::Account(LedgerKeyAccount {
                    account_id: account_id(channel_account)?,
                }),
            )),
        },
        Operation {
            source_account: Some(muxed_account(channel_account)?),
            body: OperationBody::AccountMerge(muxed_account(host)?),
        },
    ];

    build_transaction(host, host_sequence, ops, base_fee, bounds)
}

fn build_transaction(
    source: &str,
    current_sequence: i64,
    ops: Vec<Operation>,
    base_fee: u32,
    bounds: TxBounds,
) -> Result<Transaction, LedgerError> {
    let fee = u32::try_from(ops.len())
        .ok()
        .and_then(|n| n.checked_mul(base_fee))
        .ok_or_else(|| LedgerError::Build("Fee overflow".to_string()))?;

    Ok(Transaction {
        source_account: muxed_account(source)?,
        fee,
        seq_num: SequenceNumber(current_sequence + 1),
        cond: bounds.preconditions(),
        memo: Memo::None,
        operations: ops
            .try_into()
            .map_err(|_| LedgerError::Build("Too many operations".to_string()))?,
        ext: TransactionExt::V0,
    })
}

pub fn wrap_in_fee_bump(
    inner: TransactionV1Envelope,
    fee_source: &str,
    base_fee: u32,
) -> Result<FeeBumpTransaction, LedgerError> {
    let fee = i64::from(base_fee) * (inner.tx.operations.len() as i64 + 1);
    Ok(FeeBumpTransaction {
        fee_source: muxed_account(fee_source)?,
        fee,
        inner_tx: FeeBumpTransactionInnerTx::Tx(inner),
        ext: FeeBumpTransactionExt::V0,
    })
}

pub fn transaction_hash(tx: &Transaction, network_id: &[u8; 32]) -> Result<[u8; 32], LedgerError> {
    signature_payload_hash(
        network_id,
        TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()),
    )
}

pub fn fee_bump_hash(
    tx: &FeeBumpTransaction,
    network_id: &[u8; 32],
) -> Result<[u8; 32], LedgerError> {
    signature_payload_hash(
        network_id,
        TransactionSignaturePayloadTaggedTransaction::TxFeeBump(tx.clone()),
    )
}

fn signature_payload_hash(
    network_id: &[u8; 32],
    tagged_transaction: TransactionSignaturePayloadTaggedTransaction,
) -> Result<[u8; 32], LedgerError> {
    let payload = TransactionSignaturePayload {
        network_id: Hash(*network_id),
        tagged_transaction,
    };
    let bytes = payload
        .to_xdr(Limits::none())
        .map_err(|e| LedgerError::Build(format!("Failed to encode payload: {}", e)))?;
    Ok(Sha256::digest(&bytes).into())
}

pub fn encode_envelope(envelope: &TransactionEnvelope) -> Result<String, LedgerError> {
    let bytes = envelope
        .to_xdr(Limits::none())
        .map_err(|e| LedgerError::Build(format!("Failed to encode envelope to xdr: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub fn decode_envelope(xdr: &str) -> Result<TransactionEnvelope, LedgerError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(xdr)
        .map_err(|e| LedgerError::Build(format!("Invalid base64 envelope: {}", e)))?;
    TransactionEnvelope::from_xdr(bytes, Limits::none())
        .map_err(|e| LedgerError::Build(format!("Invalid envelope xdr: {}", e)))
}

/// The sequence-consuming source of an envelope (the inner source for fee bumps)
pub fn envelope_source(envelope: &TransactionEnvelope) -> Option<String> {
    match envelope {
        TransactionEnvelope::Tx(env) => Some(address_of_muxed(&env.tx.source_account)),
        TransactionEnvelope::TxFeeBump(env) => match &env.tx.inner_tx {
            FeeBumpTransactionInnerTx::Tx(inner) => Some(address_of_muxed(&inner.tx.source_account)),
        },
        TransactionEnvelope::TxV0(_) => None,
    }
}

pub fn envelope_operations(envelope: &TransactionEnvelope) -> Vec<Operation> {
    match envelope {
        TransactionEnvelope::Tx(env) => env.tx.operations.to_vec(),
        TransactionEnvelope::TxFeeBump(env) => match &env.tx.inner_tx {
            FeeBumpTransactionInnerTx::Tx(inner) => inner.tx.operations.to_vec(),
        },
        TransactionEnvelope::TxV0(env) => env.tx.operations.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stellar::keypair::Keypair;
    use rust_decimal_macros::dec;
    use stellar_xdr::curr::{FeeBumpTransactionEnvelope, VecM};

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    #[test]
    fn test_amount_to_stroops() {
        assert_eq!(amount_to_stroops(dec!(1)).unwrap(), 10_000_000);
        assert_eq!(amount_to_stroops(dec!(0.0000001)).unwrap(), 1);
        assert_eq!(amount_to_stroops(dec!(12.50)).unwrap(), 125_000_000);
        assert!(amount_to_stroops(dec!(0.00000001)).is_err());
        assert!(amount_to_stroops(dec!(0)).is_err());
        assert!(amount_to_stroops(dec!(-3)).is_err());
    }

    #[test]
    fn test_asset_ref_to_xdr() {
        assert_eq!(AssetRef::native().to_xdr().unwrap(), Asset::Native);

        let issuer = Keypair::random().address();
        let usdc = AssetRef {
            code: "USDC".to_string(),
            issuer: Some(issuer.clone()),
        };
        assert!(matches!(usdc.to_xdr().unwrap(), Asset::CreditAlphanum4(_)));

        let long = AssetRef {
            code: "LONGASSET".to_string(),
            issuer: Some(issuer),
        };
        assert!(matches!(long.to_xdr().unwrap(), Asset::CreditAlphanum12(_)));

        let orphan = AssetRef {
            code: "USDC".to_string(),
            issuer: None,
        };
        assert!(orphan.to_xdr().is_err());
    }

    #[test]
    fn test_payment_shape_and_fee_bump() {
        let channel = Keypair::random();
        let distribution = Keypair::random();
        let destination = Keypair::random();
        let asset = AssetRef::native();

        let tx = build_payment(&PaymentParams {
            channel_account: &channel.address(),
            channel_sequence: 41,
            distribution_account: &distribution.address(),
            destination: &destination.address(),
            asset: &asset,
            amount: dec!(2.5),
            base_fee: 100,
            bounds: TxBounds::with_timeout(PAYMENT_TIMEOUT, 1010),
        })
        .unwrap();

        assert_eq!(tx.seq_num, SequenceNumber(42));
        assert_eq!(tx.fee, 100);
        match &tx.cond {
            Preconditions::V2(v2) => {
                assert_eq!(v2.ledger_bounds.as_ref().unwrap().max_ledger, 1010);
                assert!(v2.time_bounds.is_some());
            }
            other => panic!("unexpected preconditions {:?}", other),
        }

        let inner = TransactionV1Envelope {
            tx,
            signatures: VecM::default(),
        };
        let fee_bump = wrap_in_fee_bump(inner, &distribution.address(), 100).unwrap();
        assert_eq!(fee_bump.fee, 200);

        let network = network_id(PASSPHRASE);
        let hash = fee_bump_hash(&fee_bump, &network).unwrap();
        assert_ne!(hash, [0u8; 32]);

        let envelope = TransactionEnvelope::TxFeeBump(FeeBumpTransactionEnvelope {
            tx: fee_bump,
            signatures: VecM::default(),
        });
        let encoded = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(envelope_source(&decoded), Some(channel.address()));
        assert_eq!(envelope_operations(&decoded).len(), 1);
    }

    #[test]
    fn test_create_channel_accounts_operations() {
        let host = Keypair::random();
        let accounts: Vec<String> = (0..3).map(|_| Keypair::random().address()).collect();
        let tx = build_create_channel_accounts(
            &host.address(),
            7,
            &accounts,
            100,
            TxBounds::with_timeout(MAINTENANCE_TIMEOUT, 20),
        )
        .unwrap();

        assert_eq!(tx.operations.len(), 9);
        assert_eq!(tx.fee, 900);
        assert!(matches!(
            tx.operations[2].body,
            OperationBody::EndSponsoringFutureReserves
        ));

        let too_many: Vec<String> = (0..MAX_CREATE_ACCOUNTS_PER_TX + 1)
            .map(|_| Keypair::random().address())
            .collect();
        assert!(build_create_channel_accounts(
            &host.address(),
            7,
            &too_many,
            100,
            TxBounds::with_timeout(MAINTENANCE_TIMEOUT, 20),
        )
        .is_err());
    }

    #[test]
    fn test_delete_channel_account_operations() {
        let host = Keypair::random();
        let channel = Keypair::random();
        let tx = build_delete_channel_account(
            &host.address(),
            1,
            &channel.address(),
            100,
            TxBounds::with_timeout(MAINTENANCE_TIMEOUT, 20),
        )
        .unwrap();

        assert_eq!(tx.operations.len(), 3);
        assert!(matches!(tx.operations[0].body, OperationBody::Payment(_)));
        assert!(matches!(tx.operations[1].body, OperationBody::RevokeSponsorship(_)));
        assert!(matches!(tx.operations[2].body, OperationBody::AccountMerge(_)));
    }

    #[test]
    fn test_hash_depends_on_network() {
        let host = Keypair::random();
        let tx = build_delete_channel_account(
            &host.address(),
            1,
            &Keypair::random().address(),
            100,
            TxBounds {
                max_time: 1,
                max_ledger: 2,
            },
        )
        .unwrap();

        let a = transaction_hash(&tx, &network_id(PASSPHRASE)).unwrap();
        let b = transaction_hash(&tx, &network_id("Public Global Stellar Network ; September 2015"))
            .unwrap();
        assert_ne!(a, b);
    }
}
