//! Bitcoin key handling and raw-transaction signing for the fulfillment agent
//!
//! The ledger composes unsigned transactions; this crate turns them into
//! broadcastable hex. Every input is signed with the agent's single WIF key
//! and carries sequence `0xfffffffd` so replacements remain possible while
//! the transaction sits in the mempool.
//!
//! Key components:
//! - `WalletKey` — WIF decoding + the P2WPKH/P2PKH addresses it controls
//! - `sign_transaction` — per-input signing, absolute fee and vsize extraction
//! - `input_outpoints` — outpoints an unsigned transaction spends (for
//!   prevout resolution by the caller)

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, Network, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction, Witness,
};
use thiserror::Error;

/// BIP-125 opt-in sequence: replaceable, no relative locktime.
pub const RBF_SEQUENCE: u32 = 0xFFFF_FFFD;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid WIF key: {0}")]
    Wif(String),
    #[error("WIF key is for {actual} but agent is configured for {expected}")]
    WrongNetwork { expected: Network, actual: Network },
    #[error("invalid transaction hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("failed to decode transaction: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),
    #[error("transaction has {inputs} inputs but {prevouts} prevouts were supplied")]
    PrevoutMismatch { inputs: usize, prevouts: usize },
    #[error("input {0} spends an unsupported script type")]
    UnsupportedScript(usize),
    #[error("outputs ({outputs} sats) exceed inputs ({inputs} sats)")]
    NegativeFee { inputs: u64, outputs: u64 },
    #[error("sighash computation failed: {0}")]
    Sighash(String),
}

/// A previous output being spent, resolved by the caller from the chain.
#[derive(Debug, Clone)]
pub struct Prevout {
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

/// Result of signing: broadcastable hex plus the facts the controllers need.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hex: String,
    pub txid: String,
    pub vsize: u64,
    /// Absolute fee in sats (prevout values minus output values).
    pub fee: u64,
}

/// The agent's single signing key.
pub struct WalletKey {
    secp: Secp256k1<All>,
    private: PrivateKey,
    public: PublicKey,
    network: Network,
}

impl WalletKey {
    /// Decode a WIF key and verify it matches the configured network.
    pub fn from_wif(wif: &str, network: Network) -> Result<Self, SignError> {
        let private = PrivateKey::from_wif(wif).map_err(|e| SignError::Wif(e.to_string()))?;
        if private.network != network {
            return Err(SignError::WrongNetwork {
                expected: network,
                actual: private.network,
            });
        }
        let secp = Secp256k1::new();
        let public = private.public_key(&secp);
        Ok(Self {
            secp,
            private,
            public,
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Native segwit address for this key.
    pub fn p2wpkh_address(&self) -> Result<String, SignError> {
        Address::p2wpkh(&self.public, self.network)
            .map(|a| a.to_string())
            .map_err(|e| SignError::Wif(e.to_string()))
    }

    /// Legacy address for this key.
    pub fn p2pkh_address(&self) -> String {
        Address::p2pkh(&self.public, self.network).to_string()
    }

    /// Whether `address` is one of the encodings of this key.
    pub fn owns_address(&self, address: &str) -> bool {
        if self.p2pkh_address() == address {
            return true;
        }
        matches!(self.p2wpkh_address(), Ok(a) if a == address)
    }
}

impl std::fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletKey")
            .field("network", &self.network)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Outpoints spent by an unsigned transaction, as `(txid, vout)` pairs.
pub fn input_outpoints(raw_hex: &str) -> Result<Vec<(String, u32)>, SignError> {
    let tx: Transaction = deserialize(&hex::decode(raw_hex.trim())?)?;
    Ok(tx
        .input
        .iter()
        .map(|i| (i.previous_output.txid.to_string(), i.previous_output.vout))
        .collect())
}

/// Sign every input of a raw unsigned transaction.
///
/// Prevouts must be supplied in input order. P2WPKH inputs get a two-item
/// witness; P2PKH inputs get a classic scriptSig. All sequences are forced
/// to [`RBF_SEQUENCE`] before signing so the signatures commit to the
/// replaceable sequence value.
pub fn sign_transaction(
    raw_hex: &str,
    key: &WalletKey,
    prevouts: &[Prevout],
) -> Result<SignedTransaction, SignError> {
    let mut tx: Transaction = deserialize(&hex::decode(raw_hex.trim())?)?;

    if prevouts.len() != tx.input.len() {
        return Err(SignError::PrevoutMismatch {
            inputs: tx.input.len(),
            prevouts: prevouts.len(),
        });
    }

    for input in &mut tx.input {
        input.sequence = Sequence::from_consensus(RBF_SEQUENCE);
    }

    let total_in: u64 = prevouts.iter().map(|p| p.value).sum();
    let total_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    if total_out > total_in {
        return Err(SignError::NegativeFee {
            inputs: total_in,
            outputs: total_out,
        });
    }

    // Sighashes are computed over the sequence-adjusted transaction, then
    // the signatures are applied to the same transaction.
    let sighash_tx = tx.clone();
    let mut cache = SighashCache::new(&sighash_tx);

    for (index, prevout) in prevouts.iter().enumerate() {
        if prevout.script_pubkey.is_p2wpkh() {
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &prevout.script_pubkey,
                    Amount::from_sat(prevout.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| SignError::Sighash(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                sig: key.secp.sign_ecdsa(&message, &key.private.inner),
                hash_ty: EcdsaSighashType::All,
            };

            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            witness.push(key.public.to_bytes());
            tx.input[index].witness = witness;
            tx.input[index].script_sig = ScriptBuf::new();
        } else if prevout.script_pubkey.is_p2pkh() {
            let sighash = cache
                .legacy_signature_hash(
                    index,
                    &prevout.script_pubkey,
                    EcdsaSighashType::All.to_u32(),
                )
                .map_err(|e| SignError::Sighash(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                sig: key.secp.sign_ecdsa(&message, &key.private.inner),
                hash_ty: EcdsaSighashType::All,
            };

            let sig_push = PushBytesBuf::try_from(signature.to_vec())
                .map_err(|e| SignError::Sighash(e.to_string()))?;
            tx.input[index].script_sig = bitcoin::script::Builder::new()
                .push_slice(sig_push)
                .push_key(&key.public)
                .into_script();
            tx.input[index].witness = Witness::new();
        } else {
            return Err(SignError::UnsupportedScript(index));
        }
    }

    Ok(SignedTransaction {
        hex: hex::encode(serialize(&tx)),
        txid: tx.txid().to_string(),
        vsize: tx.vsize() as u64,
        fee: total_in - total_out,
    })
}
