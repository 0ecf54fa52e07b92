//! Durable state: key-value store trait, backends, and envelopes
//!
//! The controllers survive restarts and serverless invocations through a
//! single external key-value store holding JSON envelopes with TTLs. The
//! REST backend speaks the command-array protocol of URL+token hosted
//! stores; the in-memory backend serves tests and dry runs.
//!
//! Reads of the envelope keys go through a short (~5 s) per-process cache;
//! duplicate-prevention checks use the `_fresh` variants to bypass it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ApiError;

/// Durable state key for the fulfillment controller envelope.
pub const FULFILLMENT_STATE_KEY: &str = "fulfillment-state";
/// Durable state key for the maintenance controller envelope.
pub const MAINTENANCE_STATE_KEY: &str = "xcpfolio:maintenance:state";
/// Distributed lock key for maintenance runs.
pub const MAINTENANCE_LOCK_KEY: &str = "xcpfolio:maintenance:lock";

/// TTL on the fulfillment envelope.
pub const FULFILLMENT_STATE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// TTL on a maintenance active-order marker.
pub const ACTIVE_ORDER_TTL: Duration = Duration::from_secs(2 * 3600);
/// TTL on the maintenance distributed lock.
pub const MAINTENANCE_LOCK_TTL: Duration = Duration::from_secs(300);

/// Processed-order set hard bound.
pub const PROCESSED_ORDERS_MAX: usize = 1000;
/// Size the processed-order set is trimmed to during periodic cleanup.
pub const PROCESSED_ORDERS_TRIM: usize = 100;
/// Blocks between periodic cleanups.
pub const CLEANUP_BLOCK_INTERVAL: u64 = 100;

/// How long a cached read stays valid in the REST backend.
const READ_CACHE_TTL: Duration = Duration::from_secs(5);

/// Key-value store with TTLs and an atomic set-if-absent lock primitive.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key, possibly serving a recent cached value.
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError>;

    /// Read a key, bypassing any read cache.
    async fn get_fresh_raw(&self, key: &str) -> Result<Option<String>, ApiError>;

    async fn set_raw(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), ApiError>;

    /// Set only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, ApiError>;

    async fn del(&self, key: &str) -> Result<(), ApiError>;
}

/// Typed read through the cache.
pub async fn get_json<T, S>(store: &S, key: &str) -> Result<Option<T>, ApiError>
where
    T: DeserializeOwned,
    S: StateStore + ?Sized,
{
    decode_opt(store.get_raw(key).await?)
}

/// Typed read bypassing the cache.
pub async fn get_json_fresh<T, S>(store: &S, key: &str) -> Result<Option<T>, ApiError>
where
    T: DeserializeOwned,
    S: StateStore + ?Sized,
{
    decode_opt(store.get_fresh_raw(key).await?)
}

/// Typed full-object overwrite.
pub async fn set_json<T, S>(
    store: &S,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), ApiError>
where
    T: Serialize,
    S: StateStore + ?Sized,
{
    let raw = serde_json::to_string(value).map_err(|e| ApiError::Decode(e.to_string()))?;
    store.set_raw(key, raw, ttl).await
}

fn decode_opt<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| ApiError::Decode(format!("stored value: {e}"))),
    }
}

// ============================================================================
// REST backend (URL + token)
// ============================================================================

#[derive(Debug, Deserialize)]
struct CommandReply {
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Hosted key-value store client speaking the `["SET", key, value, ...]`
/// command-array REST protocol with bearer-token auth.
pub struct RestStore {
    base_url: String,
    token: String,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, (Instant, Option<String>)>>,
}

impl RestStore {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn command(&self, cmd: &[serde_json::Value]) -> Result<Option<serde_json::Value>, ApiError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(cmd)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Store(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let reply: CommandReply = serde_json::from_str(&body)
            .map_err(|e| ApiError::Store(format!("bad reply: {e}")))?;
        if let Some(err) = reply.error {
            return Err(ApiError::Store(err));
        }
        Ok(reply.result)
    }

    fn cache_put(&self, key: &str, value: Option<String>) {
        let mut cache = self.cache.lock().expect("store cache poisoned");
        cache.insert(key.to_string(), (Instant::now(), value));
    }

    fn cache_get(&self, key: &str) -> Option<Option<String>> {
        let cache = self.cache.lock().expect("store cache poisoned");
        cache.get(key).and_then(|(at, value)| {
            (at.elapsed() < READ_CACHE_TTL).then(|| value.clone())
        })
    }

    fn cache_invalidate(&self, key: &str) {
        let mut cache = self.cache.lock().expect("store cache poisoned");
        cache.remove(key);
    }
}

#[async_trait]
impl StateStore for RestStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        if let Some(cached) = self.cache_get(key) {
            return Ok(cached);
        }
        self.get_fresh_raw(key).await
    }

    async fn get_fresh_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        let result = self
            .command(&[serde_json::json!("GET"), serde_json::json!(key)])
            .await?;
        let value = match result {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        self.cache_put(key, value.clone());
        Ok(value)
    }

    async fn set_raw(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), ApiError> {
        let mut cmd = vec![
            serde_json::json!("SET"),
            serde_json::json!(key),
            serde_json::json!(value),
        ];
        if let Some(ttl) = ttl {
            cmd.push(serde_json::json!("EX"));
            cmd.push(serde_json::json!(ttl.as_secs().max(1)));
        }
        self.command(&cmd).await?;
        self.cache_put(key, Some(value));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, ApiError> {
        let cmd = [
            serde_json::json!("SET"),
            serde_json::json!(key),
            serde_json::json!(value),
            serde_json::json!("EX"),
            serde_json::json!(ttl.as_secs().max(1)),
            serde_json::json!("NX"),
        ];
        let result = self.command(&cmd).await?;
        let acquired = !matches!(result, None | Some(serde_json::Value::Null));
        if acquired {
            self.cache_put(key, Some(value));
        } else {
            self.cache_invalidate(key);
        }
        Ok(acquired)
    }

    async fn del(&self, key: &str) -> Result<(), ApiError> {
        self.command(&[serde_json::json!("DEL"), serde_json::json!(key)])
            .await?;
        self.cache_invalidate(key);
        Ok(())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory store for tests and local dry runs. TTLs are honored.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Option<Instant>, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("memory store poisoned");
        match entries.get(key) {
            Some((Some(deadline), _)) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((_, value)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        Ok(self.live_value(key))
    }

    async fn get_fresh_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        Ok(self.live_value(key))
    }

    async fn set_raw(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), ApiError> {
        let deadline = ttl.map(|t| Instant::now() + t);
        self.entries
            .lock()
            .expect("memory store poisoned")
            .insert(key.to_string(), (deadline, value));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, ApiError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.set_raw(key, value, Some(ttl)).await?;
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), ApiError> {
        self.entries
            .lock()
            .expect("memory store poisoned")
            .remove(key);
        Ok(())
    }
}

// ============================================================================
// Durable envelopes
// ============================================================================

/// Fulfillment controller snapshot, overwritten as a whole each run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FulfillmentEnvelope {
    #[serde(default)]
    pub last_block: u64,
    #[serde(default)]
    pub last_order_hash: Option<String>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    /// Order hashes that reached successful broadcast, oldest first.
    #[serde(default)]
    pub processed_orders: Vec<String>,
    #[serde(default)]
    pub failed_orders: Vec<String>,
    /// Block height of the last processed-set cleanup.
    #[serde(default)]
    pub last_cleanup: u64,
}

impl FulfillmentEnvelope {
    pub fn is_processed(&self, order_hash: &str) -> bool {
        self.processed_orders.iter().any(|h| h == order_hash)
    }

    /// Append to the processed set, keeping at most [`PROCESSED_ORDERS_MAX`]
    /// most-recent entries. Membership is permanent for the retained window.
    pub fn mark_processed(&mut self, order_hash: &str) {
        if self.is_processed(order_hash) {
            return;
        }
        self.processed_orders.push(order_hash.to_string());
        if self.processed_orders.len() > PROCESSED_ORDERS_MAX {
            let excess = self.processed_orders.len() - PROCESSED_ORDERS_MAX;
            self.processed_orders.drain(..excess);
        }
    }

    /// Monotone non-decreasing block cursor.
    pub fn advance_block(&mut self, block: u64) {
        if block > self.last_block {
            self.last_block = block;
        }
    }

    /// Periodic cleanup: every [`CLEANUP_BLOCK_INTERVAL`] blocks, trim the
    /// processed set to its most-recent [`PROCESSED_ORDERS_TRIM`] entries.
    /// Returns whether a trim happened.
    pub fn maybe_cleanup(&mut self, current_block: u64) -> bool {
        if current_block.saturating_sub(self.last_cleanup) < CLEANUP_BLOCK_INTERVAL {
            return false;
        }
        if self.processed_orders.len() > PROCESSED_ORDERS_TRIM {
            let excess = self.processed_orders.len() - PROCESSED_ORDERS_TRIM;
            self.processed_orders.drain(..excess);
        }
        self.last_cleanup = current_block;
        true
    }
}

/// A re-listing reserved or broadcast by the maintenance controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOrderEntry {
    pub asset: String,
    /// Real txid, or `"pending"` while the compose/sign/broadcast is racing.
    pub txid: String,
    pub broadcast_time: DateTime<Utc>,
    pub price: f64,
}

/// Placeholder txid used to seal the race window before composing.
pub const PENDING_TXID: &str = "pending";

impl ActiveOrderEntry {
    /// Whether this marker has outlived [`ACTIVE_ORDER_TTL`].
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.broadcast_time);
        age.num_seconds() >= ACTIVE_ORDER_TTL.as_secs() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetFailure {
    pub count: u32,
    pub last_error: String,
    pub last_attempt: DateTime<Utc>,
}

/// Maintenance controller durable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceEnvelope {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_orders: BTreeMap<String, ActiveOrderEntry>,
    #[serde(default)]
    pub failed_assets: BTreeMap<String, AssetFailure>,
}

impl MaintenanceEnvelope {
    /// Whether `asset` currently holds a live (unexpired) active marker.
    ///
    /// Expiry is the *only* clearing mechanism for these markers; a failed
    /// run deliberately leaves its marker in place.
    pub fn has_live_marker(&self, asset: &str, now: DateTime<Utc>) -> bool {
        self.active_orders
            .get(asset)
            .map(|entry| !entry.expired(now))
            .unwrap_or(false)
    }

    /// Drop markers past their TTL. Called on load, never mid-run.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.active_orders.retain(|_, entry| !entry.expired(now));
    }
}
