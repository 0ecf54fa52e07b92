//! Bitcoin chain REST client (esplora-compatible endpoints)
//!
//! Tip height, UTXOs, fee recommendations, mempool membership, and
//! broadcast with fallback across endpoints. "Already in mempool"
//! rejections are promoted to success here, with the txid recovered from
//! the error body, so the controllers never string-match broadcast errors
//! themselves.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::types::{ChainTransaction, FeeRates, TxOutput, Utxo};

/// Operations the controllers consume from the chain.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn block_height(&self) -> Result<u64, ApiError>;

    async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, ApiError>;

    async fn fee_rates(&self) -> Result<FeeRates, ApiError>;

    /// Next-block rate, whole sat/vB, at least 1. Used for new transfers.
    async fn optimal_fee_rate(&self) -> Result<u64, ApiError> {
        Ok((self.fee_rates().await?.fastest_fee.ceil() as u64).max(1))
    }

    /// True minimum usable rate; may be below 1 sat/vB. Used by
    /// maintenance, which is not latency-sensitive.
    async fn minimum_fee_rate(&self) -> Result<f64, ApiError> {
        Ok(self.fee_rates().await?.minimum_fee.max(0.1))
    }

    async fn unconfirmed_tx_count(&self, address: &str) -> Result<usize, ApiError>;

    /// Chain view of a transaction; `None` if unknown to the endpoint.
    async fn transaction(&self, txid: &str) -> Result<Option<ChainTransaction>, ApiError>;

    async fn is_in_mempool(&self, txid: &str) -> Result<bool, ApiError> {
        Ok(matches!(
            self.transaction(txid).await?,
            Some(ref tx) if !tx.confirmed
        ))
    }

    async fn is_confirmed(&self, txid: &str) -> Result<bool, ApiError> {
        Ok(matches!(
            self.transaction(txid).await?,
            Some(ref tx) if tx.confirmed
        ))
    }

    /// Broadcast signed hex, trying every configured endpoint in order.
    /// Returns the txid. An "already in mempool" rejection counts as
    /// success when a txid can be recovered from the response body.
    async fn broadcast(&self, signed_hex: &str) -> Result<String, ApiError>;
}

// ============================================================================
// REST implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct UtxoRow {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct AddressStats {
    mempool_stats: MempoolStats,
}

#[derive(Debug, Deserialize)]
struct MempoolStats {
    tx_count: usize,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    txid: String,
    vout: Vec<TxVoutRow>,
    status: TxStatusRow,
}

#[derive(Debug, Deserialize)]
struct TxVoutRow {
    scriptpubkey: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct TxStatusRow {
    confirmed: bool,
}

/// Esplora-compatible client over a primary endpoint plus broadcast
/// fallbacks.
pub struct BitcoinClient {
    primary: String,
    broadcast_endpoints: Vec<String>,
    client: reqwest::Client,
}

impl BitcoinClient {
    pub fn new(mempool_api: &str, blockstream_api: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let primary = mempool_api.trim_end_matches('/').to_string();
        let mut broadcast_endpoints = vec![primary.clone()];
        let secondary = blockstream_api.trim_end_matches('/').to_string();
        if !secondary.is_empty() && secondary != primary {
            broadcast_endpoints.push(secondary);
        }
        Ok(Self {
            primary,
            broadcast_endpoints,
            client,
        })
    }

    async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        let url = format!("{}{}", self.primary, path);
        debug!("chain GET {}", path);
        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Chain {
                status,
                message: body.trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// First 64-hex-character run in `body`, if any. "Already in mempool"
/// rejections usually quote the existing txid.
pub(crate) fn extract_txid(body: &str) -> Option<String> {
    let bytes = body.as_bytes();
    let mut start = 0usize;
    while start < bytes.len() {
        if bytes[start].is_ascii_hexdigit() {
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                end += 1;
            }
            if end - start == 64 {
                return Some(body[start..end].to_lowercase());
            }
            start = end;
        } else {
            start += 1;
        }
    }
    None
}

/// Whether a broadcast rejection means the transaction is already known.
pub(crate) fn is_already_in_mempool(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("already") && (lower.contains("mempool") || lower.contains("known"))
}

#[async_trait]
impl ChainApi for BitcoinClient {
    async fn block_height(&self) -> Result<u64, ApiError> {
        let body = self.get_text("/blocks/tip/height").await?;
        body.trim()
            .parse()
            .map_err(|_| ApiError::Decode(format!("bad tip height: {body}")))
    }

    async fn utxos(&self, address: &str) -> Result<Vec<Utxo>, ApiError> {
        let rows: Vec<UtxoRow> = self.get_json(&format!("/address/{address}/utxo")).await?;
        Ok(rows
            .into_iter()
            .map(|r| Utxo {
                txid: r.txid,
                vout: r.vout,
                value: r.value,
            })
            .collect())
    }

    async fn fee_rates(&self) -> Result<FeeRates, ApiError> {
        self.get_json("/v1/fees/recommended").await
    }

    async fn unconfirmed_tx_count(&self, address: &str) -> Result<usize, ApiError> {
        let stats: AddressStats = self.get_json(&format!("/address/{address}")).await?;
        Ok(stats.mempool_stats.tx_count)
    }

    async fn transaction(&self, txid: &str) -> Result<Option<ChainTransaction>, ApiError> {
        let url = format!("{}/tx/{}", self.primary, txid);
        let response = self.client.get(&url).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let status = response.status().as_u16();
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Chain {
                status,
                message: body.trim().to_string(),
            });
        }
        let row: TxRow =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(Some(ChainTransaction {
            txid: row.txid,
            outputs: row
                .vout
                .into_iter()
                .map(|v| TxOutput {
                    value: v.value,
                    script_pubkey_hex: v.scriptpubkey,
                })
                .collect(),
            confirmed: row.status.confirmed,
        }))
    }

    async fn broadcast(&self, signed_hex: &str) -> Result<String, ApiError> {
        let mut last_error = ApiError::Chain {
            status: 0,
            message: "no broadcast endpoints configured".to_string(),
        };

        for endpoint in &self.broadcast_endpoints {
            let url = format!("{endpoint}/tx");
            match self
                .client
                .post(&url)
                .body(signed_hex.to_string())
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    if (200..300).contains(&status) {
                        return Ok(body.trim().to_string());
                    }
                    if is_already_in_mempool(&body) {
                        if let Some(txid) = extract_txid(&body) {
                            info!("Broadcast already in mempool, recovered txid {}", txid);
                            return Ok(txid);
                        }
                        return Err(ApiError::AlreadyInMempool);
                    }
                    warn!("Broadcast via {} rejected ({}): {}", endpoint, status, body.trim());
                    last_error = ApiError::Chain {
                        status,
                        message: body.trim().to_string(),
                    };
                }
                Err(e) => {
                    warn!("Broadcast via {} failed: {}", endpoint, e);
                    last_error = ApiError::Http(e);
                }
            }
        }
        Err(last_error)
    }
}
