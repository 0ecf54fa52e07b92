//! Transaction signing seam
//!
//! The controllers only see `TxSigner`; the production implementation
//! resolves each input's previous output through the chain client (compose
//! may spend outputs of our own still-unconfirmed transactions, which the
//! UTXO listing alone would miss) and signs with the agent's WIF key.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bitcoin::ScriptBuf;
use std::sync::Arc;

use btc_signer::{sign_transaction, Prevout, WalletKey};

use crate::chain::ChainApi;
use crate::types::SignedTx;

#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Sign a raw unsigned transaction; every input gets the RBF sequence.
    async fn sign(&self, raw_hex: &str) -> Result<SignedTx>;
}

/// WIF-key signer backed by a chain client for prevout resolution.
pub struct WalletSigner<C: ChainApi> {
    key: WalletKey,
    chain: Arc<C>,
}

impl<C: ChainApi> WalletSigner<C> {
    pub fn new(key: WalletKey, chain: Arc<C>) -> Self {
        Self { key, chain }
    }

    pub fn key(&self) -> &WalletKey {
        &self.key
    }
}

#[async_trait]
impl<C: ChainApi> TxSigner for WalletSigner<C> {
    async fn sign(&self, raw_hex: &str) -> Result<SignedTx> {
        let outpoints = btc_signer::input_outpoints(raw_hex)
            .context("Failed to parse unsigned transaction")?;

        let mut prevouts = Vec::with_capacity(outpoints.len());
        for (txid, vout) in &outpoints {
            let tx = self
                .chain
                .transaction(txid)
                .await
                .with_context(|| format!("Failed to fetch prevout tx {txid}"))?;
            let Some(tx) = tx else {
                bail!("Prevout transaction {txid} not found on chain");
            };
            let Some(output) = tx.outputs.get(*vout as usize) else {
                bail!("Prevout {txid}:{vout} out of range");
            };
            prevouts.push(Prevout {
                value: output.value,
                script_pubkey: ScriptBuf::from_hex(&output.script_pubkey_hex)
                    .with_context(|| format!("Bad script on prevout {txid}:{vout}"))?,
            });
        }

        let signed = sign_transaction(raw_hex, &self.key, &prevouts)
            .context("Failed to sign transaction")?;
        Ok(SignedTx {
            hex: signed.hex,
            txid: signed.txid,
            vsize: signed.vsize,
            fee: signed.fee,
        })
    }
}
