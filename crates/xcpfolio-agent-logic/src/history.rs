//! Order-history side channel
//!
//! A key-value surface (one record per order plus a bounded index list)
//! written as a side effect of fulfillment state transitions and consumed
//! by a read-only status UI. Data flows one way: the controller publishes,
//! nothing here is read back for control decisions, and publish failures
//! never fail a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;
use crate::store::{get_json_fresh, set_json, StateStore};
use crate::types::MempoolBuyOrder;

/// TTL on history records and the index.
pub const HISTORY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Maximum entries retained in the index list.
pub const INDEX_MAX: usize = 100;

const INDEX_KEY: &str = "order-history:index";

fn record_key(order_hash: &str) -> String {
    format!("order-history:{order_hash}")
}

/// Delivery status shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Buy order seen in the ledger mempool, not yet filled on-chain.
    Pending,
    /// Transfer broadcast, awaiting confirmation.
    Delivering,
    Delivered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub order_hash: String,
    pub asset: String,
    #[serde(default)]
    pub buyer: Option<String>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub txid: Option<String>,
    /// Price paid, in base units of the counter-asset.
    #[serde(default)]
    pub price: Option<u64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Publisher for the history surface.
pub struct OrderHistory<S: StateStore + ?Sized> {
    store: Arc<S>,
}

impl<S: StateStore + ?Sized> Clone for OrderHistory<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: StateStore + ?Sized> OrderHistory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// A buy order appeared in the ledger mempool.
    pub async fn publish_buy_order(&self, order: &MempoolBuyOrder, asset: &str) {
        let record = HistoryRecord {
            order_hash: order.tx_hash.clone(),
            asset: asset.to_string(),
            buyer: Some(order.source.clone()),
            status: DeliveryStatus::Pending,
            txid: None,
            price: Some(order.give_quantity),
            updated_at: Utc::now(),
            delivered_at: None,
        };
        self.write_best_effort(record).await;
    }

    /// A transfer (or an RBF replacement) was broadcast for an order.
    pub async fn publish_broadcast(
        &self,
        order_hash: &str,
        asset: &str,
        buyer: &str,
        txid: &str,
        price: Option<u64>,
    ) {
        let record = HistoryRecord {
            order_hash: order_hash.to_string(),
            asset: asset.to_string(),
            buyer: Some(buyer.to_string()),
            status: DeliveryStatus::Delivering,
            txid: Some(txid.to_string()),
            price,
            updated_at: Utc::now(),
            delivered_at: None,
        };
        self.write_best_effort(record).await;
    }

    /// Delivery is complete (transfer confirmed, or buyer already owns).
    pub async fn publish_delivered(
        &self,
        order_hash: &str,
        asset: &str,
        buyer: &str,
        txid: Option<&str>,
    ) {
        let now = Utc::now();
        let record = HistoryRecord {
            order_hash: order_hash.to_string(),
            asset: asset.to_string(),
            buyer: Some(buyer.to_string()),
            status: DeliveryStatus::Delivered,
            txid: txid.map(str::to_string),
            price: None,
            updated_at: now,
            delivered_at: Some(now),
        };
        self.write_best_effort(record).await;
    }

    async fn write_best_effort(&self, record: HistoryRecord) {
        if let Err(e) = self.put(record).await {
            warn!("Order-history write failed (ignored): {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Direct access for the operational CLI (backfill, rebuild, fixes)
    // ------------------------------------------------------------------

    /// Upsert a record, preserving earlier fields the new write leaves
    /// unset, and maintain the bounded index.
    pub async fn put(&self, mut record: HistoryRecord) -> Result<(), ApiError> {
        if let Some(existing) = self.get(&record.order_hash).await? {
            if record.price.is_none() {
                record.price = existing.price;
            }
            if record.txid.is_none() {
                record.txid = existing.txid;
            }
            if record.delivered_at.is_none() {
                record.delivered_at = existing.delivered_at;
            }
            if record.buyer.is_none() {
                record.buyer = existing.buyer;
            }
        }
        set_json(
            &*self.store,
            &record_key(&record.order_hash),
            &record,
            Some(HISTORY_TTL),
        )
        .await?;
        self.index_insert(&record.order_hash).await
    }

    pub async fn get(&self, order_hash: &str) -> Result<Option<HistoryRecord>, ApiError> {
        get_json_fresh(&*self.store, &record_key(order_hash)).await
    }

    /// Most-recent-first order hashes, at most [`INDEX_MAX`].
    pub async fn index(&self) -> Result<Vec<String>, ApiError> {
        Ok(get_json_fresh(&*self.store, INDEX_KEY).await?.unwrap_or_default())
    }

    pub async fn delete(&self, order_hash: &str) -> Result<(), ApiError> {
        self.store.del(&record_key(order_hash)).await?;
        let mut index = self.index().await?;
        index.retain(|h| h != order_hash);
        set_json(&*self.store, INDEX_KEY, &index, Some(HISTORY_TTL)).await
    }

    /// Rewrite the index from a caller-supplied hash list (rebuild script).
    pub async fn replace_index(&self, mut hashes: Vec<String>) -> Result<(), ApiError> {
        hashes.dedup();
        hashes.truncate(INDEX_MAX);
        set_json(&*self.store, INDEX_KEY, &hashes, Some(HISTORY_TTL)).await
    }

    async fn index_insert(&self, order_hash: &str) -> Result<(), ApiError> {
        let mut index = self.index().await?;
        index.retain(|h| h != order_hash);
        index.insert(0, order_hash.to_string());
        index.truncate(INDEX_MAX);
        set_json(&*self.store, INDEX_KEY, &index, Some(HISTORY_TTL)).await
    }
}
