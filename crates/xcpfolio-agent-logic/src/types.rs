//! Shared types for the fulfillment agent
//!
//! Wire records from the ledger/chain APIs, the per-order pipeline stages,
//! and the in-process tracking records for active transfers and
//! pre-broadcast failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace prefix every fulfillable order must carry.
pub const ASSET_NAMESPACE: &str = "XCPFOLIO.";

// ============================================================================
// Ledger wire records
// ============================================================================

/// A DEX sell order as returned by the ledger order listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledOrder {
    pub tx_hash: String,
    pub tx_index: u64,
    pub block_index: u64,
    #[serde(default)]
    pub block_time: u64,
    pub source: String,
    /// Long name, e.g. `XCPFOLIO.PEPECASH`.
    pub give_asset: String,
    pub give_quantity: u64,
    pub get_asset: String,
    /// Price in base units of the counter-asset.
    pub get_quantity: u64,
    pub status: String,
}

impl FilledOrder {
    /// The short asset name after the `XCPFOLIO.` prefix, if namespaced.
    pub fn subasset(&self) -> Option<&str> {
        self.give_asset.strip_prefix(ASSET_NAMESPACE)
    }
}

/// An order match record; the counterparty of tx0/tx1 is the buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMatchRecord {
    pub id: String,
    pub tx0_hash: String,
    pub tx0_address: String,
    pub tx1_hash: String,
    pub tx1_address: String,
    pub status: String,
}

impl OrderMatchRecord {
    /// Resolve the counterparty of `ours` in this match.
    pub fn counterparty_of(&self, ours: &str) -> Option<&str> {
        if self.tx0_address == ours {
            Some(&self.tx1_address)
        } else if self.tx1_address == ours {
            Some(&self.tx0_address)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetInfo {
    pub asset: String,
    #[serde(default)]
    pub asset_longname: Option<String>,
    pub owner: String,
    pub locked: bool,
}

/// An issuance event; `transfer == true` marks an ownership transfer and
/// `issuer` is the receiving owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuance {
    pub tx_hash: String,
    pub asset: String,
    /// Prior owner of the asset for a transfer issuance.
    #[serde(default)]
    pub source: String,
    /// New owner once a transfer issuance is applied.
    pub issuer: String,
    #[serde(default)]
    pub transfer: bool,
    pub status: String,
    #[serde(default)]
    pub confirmed: bool,
}

/// An in-mempool ownership transfer from our address.
#[derive(Debug, Clone)]
pub struct MempoolTransfer {
    pub tx_hash: String,
    /// Short asset name.
    pub asset: String,
    pub destination: String,
}

/// An open order observed in the ledger mempool that buys one of our
/// listings. Recorded in the order-history surface for UI visibility only.
#[derive(Debug, Clone)]
pub struct MempoolBuyOrder {
    pub tx_hash: String,
    pub source: String,
    /// Long give-asset name of the matching sell listing.
    pub get_asset: String,
    pub give_quantity: u64,
}

/// A namespaced balance held by our address.
#[derive(Debug, Clone)]
pub struct AssetBalance {
    /// Short asset name.
    pub asset: String,
    pub quantity: u64,
}

// ============================================================================
// Chain wire records
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeRates {
    #[serde(rename = "fastestFee")]
    pub fastest_fee: f64,
    #[serde(rename = "halfHourFee")]
    pub half_hour_fee: f64,
    #[serde(rename = "hourFee")]
    pub hour_fee: f64,
    #[serde(rename = "economyFee")]
    pub economy_fee: f64,
    #[serde(rename = "minimumFee")]
    pub minimum_fee: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
}

impl Utxo {
    /// `txid:vout` form used for compose `inputs_set` parameters.
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// A previous output of a known transaction.
#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey_hex: String,
}

/// Chain view of a transaction: outputs plus confirmation status.
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub txid: String,
    pub outputs: Vec<TxOutput>,
    pub confirmed: bool,
}

// ============================================================================
// Compose / sign results
// ============================================================================

/// Raw unsigned transaction from a ledger compose call.
#[derive(Debug, Clone)]
pub struct ComposeResult {
    pub raw_transaction: String,
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub hex: String,
    pub txid: String,
    pub vsize: u64,
    pub fee: u64,
}

// ============================================================================
// Pipeline stages and outcomes
// ============================================================================

/// Stage of the transfer pipeline an order reached (or failed at).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validation,
    Compose,
    Sign,
    Broadcast,
    /// Asset already with the buyer; nothing was broadcast.
    Confirmed,
    /// Soft failure: still inside the progressive-retry wait window.
    Backoff,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Validation => "validation",
            Stage::Compose => "compose",
            Stage::Sign => "sign",
            Stage::Broadcast => "broadcast",
            Stage::Confirmed => "confirmed",
            Stage::Backoff => "backoff",
        };
        write!(f, "{name}")
    }
}

/// Per-order result of a fulfillment run.
#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentOutcome {
    pub order_hash: String,
    pub asset: String,
    pub buyer: String,
    pub success: bool,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_rbf: bool,
}

impl FulfillmentOutcome {
    pub fn success(order_hash: &str, asset: &str, buyer: &str, stage: Stage, txid: &str) -> Self {
        Self {
            order_hash: order_hash.to_string(),
            asset: asset.to_string(),
            buyer: buyer.to_string(),
            success: true,
            stage,
            txid: Some(txid.to_string()),
            error: None,
            is_rbf: false,
        }
    }

    pub fn failure(order_hash: &str, asset: &str, buyer: &str, stage: Stage, error: String) -> Self {
        Self {
            order_hash: order_hash.to_string(),
            asset: asset.to_string(),
            buyer: buyer.to_string(),
            success: false,
            stage,
            txid: None,
            error: Some(error),
            is_rbf: false,
        }
    }
}

/// Per-asset result of a maintenance run.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceOutcome {
    pub asset: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skipped: bool,
}

// ============================================================================
// In-process tracking records
// ============================================================================

/// An asset transfer that has been broadcast and is not yet known confirmed.
///
/// Invariants: `txids.last() == Some(&txid)`, `rbf_count == txids.len() - 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTransfer {
    pub order_hash: String,
    pub asset: String,
    pub buyer: String,
    /// Current (most recent) txid.
    pub txid: String,
    pub original_txid: String,
    /// All txids emitted for this order, in broadcast order.
    pub txids: Vec<String>,
    pub broadcast_time: DateTime<Utc>,
    pub broadcast_block: u64,
    /// Effective fee rate in sat/vB.
    pub fee_rate: u64,
    pub rbf_count: u32,
    pub needs_rbf: bool,
    pub dropped_from_mempool: bool,
}

impl ActiveTransfer {
    pub fn new(
        order_hash: &str,
        asset: &str,
        buyer: &str,
        txid: &str,
        broadcast_block: u64,
        fee_rate: u64,
    ) -> Self {
        Self {
            order_hash: order_hash.to_string(),
            asset: asset.to_string(),
            buyer: buyer.to_string(),
            txid: txid.to_string(),
            original_txid: txid.to_string(),
            txids: vec![txid.to_string()],
            broadcast_time: Utc::now(),
            broadcast_block,
            fee_rate,
            rbf_count: 0,
            needs_rbf: false,
            dropped_from_mempool: false,
        }
    }

    /// Record a successful RBF replacement.
    pub fn apply_replacement(&mut self, txid: &str, fee_rate: u64, block: u64) {
        self.txid = txid.to_string();
        self.txids.push(txid.to_string());
        self.fee_rate = fee_rate;
        self.rbf_count += 1;
        self.needs_rbf = false;
        self.dropped_from_mempool = false;
        self.broadcast_block = block;
        self.broadcast_time = Utc::now();
    }
}

/// Progressive-retry tier: `(max_retries, min_wait)` chosen by failure count.
pub fn retry_tier(count: u32) -> (u32, std::time::Duration) {
    use std::time::Duration;
    match count {
        c if c < 10 => (10, Duration::from_secs(5)),
        c if c < 25 => (25, Duration::from_secs(30)),
        c if c < 50 => (50, Duration::from_secs(60)),
        _ => (100, Duration::from_secs(300)),
    }
}

/// Failure counts at which a critical alert is raised.
pub const ALERT_THRESHOLDS: [u32; 3] = [10, 25, 50];

/// Record of pre-broadcast failures for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFailure {
    pub count: u32,
    pub last_error: String,
    pub stage: Stage,
    pub first_failure: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

impl PendingFailure {
    pub fn new(stage: Stage, error: &str) -> Self {
        let now = Utc::now();
        Self {
            count: 1,
            last_error: error.to_string(),
            stage,
            first_failure: now,
            last_attempt: now,
        }
    }

    pub fn record(&mut self, stage: Stage, error: &str) {
        self.count += 1;
        self.stage = stage;
        self.last_error = error.to_string();
        self.last_attempt = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_subasset_prefix() {
        let mut order = sample_order();
        assert_eq!(order.subasset(), Some("RAREPEPE"));
        order.give_asset = "PEPECASH".to_string();
        assert_eq!(order.subasset(), None);
    }

    #[test]
    fn test_counterparty_resolution() {
        let m = OrderMatchRecord {
            id: "a_b".to_string(),
            tx0_hash: "a".to_string(),
            tx0_address: "seller".to_string(),
            tx1_hash: "b".to_string(),
            tx1_address: "buyer".to_string(),
            status: "completed".to_string(),
        };
        assert_eq!(m.counterparty_of("seller"), Some("buyer"));
        assert_eq!(m.counterparty_of("buyer"), Some("seller"));
        assert_eq!(m.counterparty_of("stranger"), None);
    }

    #[test]
    fn test_retry_tiers() {
        assert_eq!(retry_tier(0), (10, Duration::from_secs(5)));
        assert_eq!(retry_tier(9), (10, Duration::from_secs(5)));
        assert_eq!(retry_tier(10), (25, Duration::from_secs(30)));
        assert_eq!(retry_tier(24), (25, Duration::from_secs(30)));
        assert_eq!(retry_tier(25), (50, Duration::from_secs(60)));
        assert_eq!(retry_tier(49), (50, Duration::from_secs(60)));
        assert_eq!(retry_tier(50), (100, Duration::from_secs(300)));
        assert_eq!(retry_tier(99), (100, Duration::from_secs(300)));
    }

    #[test]
    fn test_active_transfer_invariants() {
        let mut active = ActiveTransfer::new("order1", "RAREPEPE", "buyer", "tx1", 800_000, 10);
        assert_eq!(active.txids.last(), Some(&active.txid));
        assert_eq!(active.rbf_count as usize, active.txids.len() - 1);

        active.needs_rbf = true;
        active.apply_replacement("tx2", 20, 800_003);
        assert_eq!(active.txid, "tx2");
        assert_eq!(active.original_txid, "tx1");
        assert_eq!(active.txids, vec!["tx1", "tx2"]);
        assert_eq!(active.rbf_count, 1);
        assert!(!active.needs_rbf);
        assert_eq!(active.broadcast_block, 800_003);
        assert_eq!(active.txids.last(), Some(&active.txid));
        assert_eq!(active.rbf_count as usize, active.txids.len() - 1);
    }

    #[test]
    fn test_fee_rates_deserialize_camel_case() {
        let json = r#"{"fastestFee":21.5,"halfHourFee":15,"hourFee":10,"economyFee":4,"minimumFee":0.75}"#;
        let rates: FeeRates = serde_json::from_str(json).unwrap();
        assert_eq!(rates.fastest_fee, 21.5);
        assert_eq!(rates.minimum_fee, 0.75);
    }

    fn sample_order() -> FilledOrder {
        FilledOrder {
            tx_hash: "deadbeef".to_string(),
            tx_index: 7,
            block_index: 800_000,
            block_time: 1_700_000_000,
            source: "seller".to_string(),
            give_asset: "XCPFOLIO.RAREPEPE".to_string(),
            give_quantity: 1,
            get_asset: "XCP".to_string(),
            get_quantity: 500_000_000,
            status: "filled".to_string(),
        }
    }
}
