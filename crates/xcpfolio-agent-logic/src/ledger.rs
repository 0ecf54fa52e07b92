//! DEX/indexer (Counterparty) REST client
//!
//! Read side: filled orders, order matches, asset info, issuances, mempool
//! events, namespaced balances. Write side: compose transfer / compose
//! order (both return raw unsigned transactions; signing and broadcast
//! happen elsewhere).
//!
//! Every response is a `{ result, error? }` envelope; a present `error`
//! field fails the call with the upstream message preserved for the
//! controllers' retry heuristics.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::error::ApiError;
use crate::types::{
    AssetBalance, AssetInfo, ComposeResult, FilledOrder, Issuance, MempoolBuyOrder,
    MempoolTransfer, OrderMatchRecord, ASSET_NAMESPACE,
};

/// Page size for paginated listings.
const PAGE_LIMIT: usize = 100;

/// Compose parameters for a DEX sell order.
#[derive(Debug, Clone)]
pub struct ComposeOrderRequest {
    /// Long give-asset name (`XCPFOLIO.<ASSET>`).
    pub give_asset: String,
    pub give_quantity: u64,
    pub get_asset: String,
    pub get_quantity: u64,
    pub expiration: u32,
    pub fee_rate: f64,
    /// Pre-fetched UTXOs as `txid:vout` strings, when the caller wants to
    /// override the ledger's UTXO view.
    pub inputs_set: Option<Vec<String>>,
}

/// Operations the controllers consume from the ledger.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn current_block(&self) -> Result<u64, ApiError>;

    /// All filled orders for `address`, newest first.
    async fn filled_orders(&self, address: &str) -> Result<Vec<FilledOrder>, ApiError>;

    async fn order_matches(&self, order_hash: &str) -> Result<Vec<OrderMatchRecord>, ApiError>;

    async fn asset_info(&self, asset: &str) -> Result<AssetInfo, ApiError>;

    /// Issuance history including unconfirmed entries, newest first.
    async fn asset_issuances(&self, asset: &str) -> Result<Vec<Issuance>, ApiError>;

    /// Open orders in the ledger mempool buying `XCPFOLIO.*` listings.
    async fn mempool_buy_orders(&self) -> Result<Vec<MempoolBuyOrder>, ApiError>;

    /// In-mempool ownership transfers sent from `address`.
    async fn mempool_transfers(&self, address: &str) -> Result<Vec<MempoolTransfer>, ApiError>;

    /// Short names of `XCPFOLIO.*` assets `address` is listing in the
    /// ledger mempool.
    async fn mempool_order_assets(&self, address: &str) -> Result<HashSet<String>, ApiError>;

    /// Short names of `XCPFOLIO.*` assets with confirmed open orders.
    async fn open_order_assets(&self, address: &str) -> Result<HashSet<String>, ApiError>;

    /// Namespaced balances held by `address` (short names).
    async fn namespace_balances(&self, address: &str) -> Result<Vec<AssetBalance>, ApiError>;

    /// Whether ownership of `asset` has reached `to` (confirmed or via an
    /// in-mempool transfer from `from`). Monotone: once true, stays true.
    async fn is_asset_transferred_to(
        &self,
        asset: &str,
        to: &str,
        from: &str,
    ) -> Result<bool, ApiError>;

    /// Compose an ownership-transfer transaction (issuance with a transfer
    /// destination, quantity 0, empty description, auto encoding).
    async fn compose_transfer(
        &self,
        source: &str,
        asset: &str,
        destination: &str,
        fee_rate: f64,
        validate: bool,
    ) -> Result<ComposeResult, ApiError>;

    async fn compose_order(
        &self,
        source: &str,
        request: &ComposeOrderRequest,
    ) -> Result<ComposeResult, ApiError>;
}

// ============================================================================
// REST implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct Block {
    block_index: u64,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    #[allow(dead_code)]
    asset: String,
    #[serde(default)]
    asset_longname: Option<String>,
    quantity: u64,
}

#[derive(Debug, Deserialize)]
struct MempoolEventRow {
    tx_hash: String,
    #[serde(alias = "event")]
    category: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ComposeRow {
    rawtransaction: String,
}

/// Counterparty v2 REST client.
pub struct CounterpartyClient {
    base_url: String,
    client: reqwest::Client,
}

impl CounterpartyClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// GET a path, unwrap the `{ result, error }` envelope.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("ledger GET {}", path);
        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        let value: serde_json::Value = serde_json::from_str(&body).map_err(|_| {
            ApiError::Ledger {
                status,
                message: truncated(&body),
            }
        })?;
        if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
            return Err(ApiError::Ledger {
                status,
                message: err.to_string(),
            });
        }
        if !(200..300).contains(&status) {
            return Err(ApiError::Ledger {
                status,
                message: truncated(&body),
            });
        }
        let result = value
            .get("result")
            .cloned()
            .ok_or_else(|| ApiError::Decode("missing result field".to_string()))?;
        serde_json::from_value(result).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn mempool_events(&self, address: &str) -> Result<Vec<MempoolEventRow>, ApiError> {
        self.get(&format!(
            "/addresses/mempool?addresses={address}&verbose=true"
        ))
        .await
    }
}

fn truncated(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() > 300 {
        format!("{}...", &trimmed[..300])
    } else {
        trimmed.to_string()
    }
}

/// Short name of a namespaced asset from event params, if it is one of ours.
fn namespaced_short_name(params: &serde_json::Value, field: &str) -> Option<String> {
    let long = params.get(field)?.as_str()?;
    long.strip_prefix(ASSET_NAMESPACE).map(str::to_string)
}

#[async_trait]
impl LedgerApi for CounterpartyClient {
    async fn current_block(&self) -> Result<u64, ApiError> {
        let blocks: Vec<Block> = self.get("/blocks?limit=1").await?;
        blocks
            .first()
            .map(|b| b.block_index)
            .ok_or_else(|| ApiError::Decode("empty block list".to_string()))
    }

    async fn filled_orders(&self, address: &str) -> Result<Vec<FilledOrder>, ApiError> {
        let mut all = Vec::new();
        let mut offset = 0usize;
        loop {
            let page: Vec<FilledOrder> = self
                .get(&format!(
                    "/addresses/{address}/orders?status=filled&verbose=true&limit={PAGE_LIMIT}&offset={offset}&sort=block_index:desc"
                ))
                .await?;
            let len = page.len();
            all.extend(page);
            if len < PAGE_LIMIT {
                break;
            }
            offset += PAGE_LIMIT;
        }
        Ok(all)
    }

    async fn order_matches(&self, order_hash: &str) -> Result<Vec<OrderMatchRecord>, ApiError> {
        self.get(&format!(
            "/orders/{order_hash}/matches?verbose=true&show_unconfirmed=true"
        ))
        .await
    }

    async fn asset_info(&self, asset: &str) -> Result<AssetInfo, ApiError> {
        self.get(&format!("/assets/{asset}")).await
    }

    async fn asset_issuances(&self, asset: &str) -> Result<Vec<Issuance>, ApiError> {
        self.get(&format!(
            "/assets/{asset}/issuances?show_unconfirmed=true&limit={PAGE_LIMIT}"
        ))
        .await
    }

    async fn mempool_buy_orders(&self) -> Result<Vec<MempoolBuyOrder>, ApiError> {
        let rows: Vec<MempoolEventRow> =
            self.get("/mempool/events/OPEN_ORDER?verbose=true").await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let params = &row.params;
                let get_asset = params.get("get_asset")?.as_str()?;
                if !get_asset.starts_with(ASSET_NAMESPACE) {
                    return None;
                }
                Some(MempoolBuyOrder {
                    tx_hash: row.tx_hash.clone(),
                    source: params.get("source")?.as_str()?.to_string(),
                    get_asset: get_asset.to_string(),
                    give_quantity: params.get("give_quantity")?.as_u64()?,
                })
            })
            .collect())
    }

    async fn mempool_transfers(&self, address: &str) -> Result<Vec<MempoolTransfer>, ApiError> {
        let rows = self.mempool_events(address).await?;
        Ok(rows
            .iter()
            .filter(|row| row.category == "ISSUANCE")
            .filter_map(|row| {
                let params = &row.params;
                if !params.get("transfer")?.as_bool()? {
                    return None;
                }
                if params.get("source")?.as_str()? != address {
                    return None;
                }
                let asset = namespaced_short_name(params, "asset_longname")
                    .or_else(|| Some(params.get("asset")?.as_str()?.to_string()))?;
                Some(MempoolTransfer {
                    tx_hash: row.tx_hash.clone(),
                    asset,
                    destination: params.get("issuer")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn mempool_order_assets(&self, address: &str) -> Result<HashSet<String>, ApiError> {
        let rows = self.mempool_events(address).await?;
        Ok(rows
            .iter()
            .filter(|row| row.category == "OPEN_ORDER")
            .filter_map(|row| {
                if row.params.get("source")?.as_str()? != address {
                    return None;
                }
                namespaced_short_name(&row.params, "give_asset")
            })
            .collect())
    }

    async fn open_order_assets(&self, address: &str) -> Result<HashSet<String>, ApiError> {
        let orders: Vec<FilledOrder> = self
            .get(&format!(
                "/addresses/{address}/orders?status=open&verbose=true&limit={PAGE_LIMIT}"
            ))
            .await?;
        Ok(orders
            .iter()
            .filter_map(|o| o.subasset().map(str::to_string))
            .collect())
    }

    async fn namespace_balances(&self, address: &str) -> Result<Vec<AssetBalance>, ApiError> {
        let mut all = Vec::new();
        let mut offset = 0usize;
        loop {
            let page: Vec<BalanceRow> = self
                .get(&format!(
                    "/addresses/{address}/balances?verbose=true&limit={PAGE_LIMIT}&offset={offset}"
                ))
                .await?;
            let len = page.len();
            for row in page {
                let Some(long) = row.asset_longname.as_deref() else {
                    continue;
                };
                if let Some(short) = long.strip_prefix(ASSET_NAMESPACE) {
                    if row.quantity > 0 {
                        all.push(AssetBalance {
                            asset: short.to_string(),
                            quantity: row.quantity,
                        });
                    }
                }
            }
            if len < PAGE_LIMIT {
                break;
            }
            offset += PAGE_LIMIT;
        }
        Ok(all)
    }

    async fn is_asset_transferred_to(
        &self,
        asset: &str,
        to: &str,
        from: &str,
    ) -> Result<bool, ApiError> {
        let info = self.asset_info(asset).await?;
        if info.owner == to {
            return Ok(true);
        }
        // Not yet confirmed: look for an in-flight transfer in the
        // issuance history.
        let issuances = self.asset_issuances(asset).await?;
        Ok(issuances
            .iter()
            .any(|i| i.transfer && i.issuer == to && (i.source.is_empty() || i.source == from)))
    }

    async fn compose_transfer(
        &self,
        source: &str,
        asset: &str,
        destination: &str,
        fee_rate: f64,
        validate: bool,
    ) -> Result<ComposeResult, ApiError> {
        let row: ComposeRow = self
            .get(&format!(
                "/addresses/{source}/compose/issuance?asset={asset}&quantity=0&transfer_destination={destination}&description=&encoding=auto&sat_per_vbyte={fee_rate}&validate={validate}"
            ))
            .await?;
        Ok(ComposeResult {
            raw_transaction: row.rawtransaction,
        })
    }

    async fn compose_order(
        &self,
        source: &str,
        request: &ComposeOrderRequest,
    ) -> Result<ComposeResult, ApiError> {
        let mut path = format!(
            "/addresses/{source}/compose/order?give_asset={}&give_quantity={}&get_asset={}&get_quantity={}&expiration={}&sat_per_vbyte={}&validate=true",
            request.give_asset,
            request.give_quantity,
            request.get_asset,
            request.get_quantity,
            request.expiration,
            request.fee_rate,
        );
        if let Some(inputs) = &request.inputs_set {
            if !inputs.is_empty() {
                path.push_str(&format!("&inputs_set={}", inputs.join(",")));
            }
        }
        let row: ComposeRow = self.get(&path).await?;
        Ok(ComposeResult {
            raw_transaction: row.rawtransaction,
        })
    }
}
