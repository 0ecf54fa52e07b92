//! Maintenance controller
//!
//! Re-creates expired DEX sell orders for `XCPFOLIO.*` subassets we still
//! hold. An active order escrows the give-side balance, so "balance > 0"
//! means "not currently listed"; everything already listed (confirmed
//! orders, mempool orders, tracked markers) is subtracted before any
//! compose.
//!
//! Duplicate listings are the unrecoverable failure here, so the controller
//! reserves a durable `pending` marker *before* composing and never clears
//! markers on failure — their TTL is the only clearing mechanism.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::ChainApi;
use crate::config::{price_to_base_units, AgentConfig};
use crate::ledger::{ComposeOrderRequest, LedgerApi};
use crate::notify::Notifier;
use crate::signer::TxSigner;
use crate::store::{
    get_json_fresh, set_json, ActiveOrderEntry, AssetFailure, MaintenanceEnvelope, StateStore,
    MAINTENANCE_LOCK_KEY, MAINTENANCE_LOCK_TTL, MAINTENANCE_STATE_KEY, PENDING_TXID,
};
use crate::types::{MaintenanceOutcome, ASSET_NAMESPACE};

use crate::lock::DistributedLock;

/// Identical stale-outpoint compose failures tolerated before aborting a run.
const STALE_OUTPOINT_ABORT: u32 = 3;

/// Read-only status for the CLI / status surface.
#[derive(Debug, Clone)]
pub struct MaintenanceStatus {
    pub is_running: bool,
    pub prices_loaded: usize,
    pub last_run: Option<chrono::DateTime<Utc>>,
    pub active_orders: BTreeMap<String, ActiveOrderEntry>,
    pub failed_assets: BTreeMap<String, AssetFailure>,
}

pub struct MaintenanceController<L, C, S, G>
where
    L: LedgerApi,
    C: ChainApi,
    S: StateStore + ?Sized,
    G: TxSigner,
{
    config: AgentConfig,
    ledger: Arc<L>,
    chain: Arc<C>,
    store: Arc<S>,
    signer: Arc<G>,
    notifier: Arc<Notifier>,
    prices: std::sync::Mutex<BTreeMap<String, f64>>,
    run_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
}

enum RunControl {
    Continue,
    Abort,
}

impl<L, C, S, G> MaintenanceController<L, C, S, G>
where
    L: LedgerApi,
    C: ChainApi,
    S: StateStore + ?Sized,
    G: TxSigner,
{
    pub fn new(
        config: AgentConfig,
        ledger: Arc<L>,
        chain: Arc<C>,
        store: Arc<S>,
        signer: Arc<G>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            ledger,
            chain,
            store,
            signer,
            notifier,
            prices: std::sync::Mutex::new(BTreeMap::new()),
            run_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    /// Replace the price table (asset short name → price in XCP).
    pub fn set_prices(&self, prices: BTreeMap<String, f64>) {
        *self.prices.lock().expect("price table poisoned") = prices;
    }

    /// Resolves once no run is in progress.
    pub async fn wait_until_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    pub async fn status(&self) -> Result<MaintenanceStatus> {
        let envelope: MaintenanceEnvelope =
            get_json_fresh(&*self.store, MAINTENANCE_STATE_KEY)
                .await
                .context("Failed to load maintenance state")?
                .unwrap_or_default();
        Ok(MaintenanceStatus {
            is_running: self.running.load(Ordering::SeqCst),
            prices_loaded: self.prices.lock().expect("price table poisoned").len(),
            last_run: envelope.last_run,
            active_orders: envelope.active_orders,
            failed_assets: envelope.failed_assets,
        })
    }

    /// One maintenance run. Held to a single runner per process and, via
    /// the distributed lock, a single runner across all replicas.
    pub async fn run(&self) -> Result<Vec<MaintenanceOutcome>> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Maintenance already running in this process");
                return Ok(Vec::new());
            }
        };

        let lock = match DistributedLock::acquire(
            &*self.store,
            MAINTENANCE_LOCK_KEY,
            MAINTENANCE_LOCK_TTL,
        )
        .await
        .context("Failed to contact state store for maintenance lock")?
        {
            Some(lock) => lock,
            None => {
                info!("Maintenance lock held elsewhere, skipping run");
                return Ok(Vec::new());
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let result = self.run_locked().await;
        self.running.store(false, Ordering::SeqCst);
        // The lock is released on every exit path; its TTL bounds a crash.
        lock.release(&*self.store).await;
        result
    }

    async fn run_locked(&self) -> Result<Vec<MaintenanceOutcome>> {
        let address = self.config.address.clone();
        let now = Utc::now();

        let mut envelope: MaintenanceEnvelope =
            get_json_fresh(&*self.store, MAINTENANCE_STATE_KEY)
                .await
                .context("Failed to load maintenance state")?
                .unwrap_or_default();
        envelope.prune_expired(now);
        envelope.last_run = Some(now);
        self.persist(&envelope).await?;

        let unconfirmed = self
            .chain
            .unconfirmed_tx_count(&address)
            .await
            .context("Failed to query unconfirmed transaction count")?;
        if unconfirmed >= self.config.max_mempool_txs {
            warn!(
                "Mempool at capacity ({} >= {}), skipping maintenance",
                unconfirmed, self.config.max_mempool_txs
            );
            return Ok(Vec::new());
        }

        // Maintenance is not latency-sensitive: use the true minimum rate,
        // which may be below 1 sat/vB.
        let fee_rate = self
            .chain
            .minimum_fee_rate()
            .await
            .context("Failed to fetch minimum fee rate")?;

        // Pre-fetched UTXOs passed into compose, so the ledger's possibly
        // stale UTXO view cannot pick spent inputs.
        let inputs_set: Vec<String> = self
            .chain
            .utxos(&address)
            .await
            .context("Failed to fetch UTXOs")?
            .iter()
            .map(|u| u.outpoint())
            .collect();

        let balances = self
            .ledger
            .namespace_balances(&address)
            .await
            .context("Failed to fetch namespaced balances")?;

        let confirmed_listed = self
            .ledger
            .open_order_assets(&address)
            .await
            .context("Failed to fetch open orders")?;
        let mempool_listed = self
            .ledger
            .mempool_order_assets(&address)
            .await
            .context("Failed to fetch mempool orders")?;

        let mut already_listed: HashSet<String> = confirmed_listed;
        already_listed.extend(mempool_listed);
        for (asset, entry) in &envelope.active_orders {
            if !entry.expired(now) {
                already_listed.insert(asset.clone());
            }
        }

        let prices = self.prices.lock().expect("price table poisoned").clone();
        let to_process: Vec<(String, f64)> = balances
            .iter()
            .filter(|b| b.quantity > 0)
            .filter(|b| !already_listed.contains(&b.asset))
            .filter_map(|b| {
                let price = prices.get(&b.asset).copied()?;
                (price > 0.0).then(|| (b.asset.clone(), price))
            })
            .collect();

        if to_process.is_empty() {
            debug!(
                "Nothing to re-list ({} balances, {} already listed)",
                balances.len(),
                already_listed.len()
            );
            return Ok(Vec::new());
        }
        info!(
            "Re-listing {} asset(s) at {} sat/vB: {:?}",
            to_process.len(),
            fee_rate,
            to_process.iter().map(|(a, _)| a.as_str()).collect::<Vec<_>>()
        );

        if self.config.dry_run {
            for (asset, price) in &to_process {
                info!("[dry-run] would list {} at {} XCP", asset, price);
            }
            return Ok(to_process
                .into_iter()
                .map(|(asset, _)| MaintenanceOutcome {
                    asset,
                    success: true,
                    txid: Some("dry-run".to_string()),
                    error: None,
                    skipped: false,
                })
                .collect());
        }

        let mut outcomes = Vec::new();
        let mut done_this_run: HashSet<String> = HashSet::new();
        // Same stale outpoint failing repeatedly poisons every compose in
        // the run (the inputs_set is shared); count and bail.
        let mut stale_streak: Option<(String, u32)> = None;

        for (asset, price) in to_process {
            if done_this_run.contains(&asset) {
                continue;
            }

            // Re-check everything that can have changed since the plan was
            // built: the durable markers (fresh read) and the mempool.
            let fresh: MaintenanceEnvelope =
                get_json_fresh(&*self.store, MAINTENANCE_STATE_KEY)
                    .await
                    .context("Failed to re-read maintenance state")?
                    .unwrap_or_default();
            if fresh.has_live_marker(&asset, Utc::now()) {
                debug!("{} reserved since planning, skipping", asset);
                outcomes.push(skipped(&asset));
                continue;
            }
            match self.ledger.mempool_order_assets(&self.config.address).await {
                Ok(mempool) if mempool.contains(&asset) => {
                    debug!("{} listed in mempool since planning, skipping", asset);
                    outcomes.push(skipped(&asset));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Mempool re-check failed for {}: {}", asset, e);
                }
            }

            // Seal the race window before composing.
            envelope.active_orders.insert(
                asset.clone(),
                ActiveOrderEntry {
                    asset: asset.clone(),
                    txid: PENDING_TXID.to_string(),
                    broadcast_time: Utc::now(),
                    price,
                },
            );
            self.persist(&envelope).await?;

            let (outcome, control) = self
                .relist_asset(&asset, price, fee_rate, &inputs_set, &mut envelope)
                .await;
            let failed = !outcome.success;
            outcomes.push(outcome);
            done_this_run.insert(asset.clone());

            match control {
                RunControl::Abort => break,
                RunControl::Continue => {}
            }

            if failed {
                if let Some(last_error) = envelope
                    .failed_assets
                    .get(&asset)
                    .map(|f| f.last_error.clone())
                {
                    if let Some(outpoint) = extract_outpoint(&last_error) {
                        stale_streak = match stale_streak.take() {
                            Some((prev, count)) if prev == outpoint => Some((prev, count + 1)),
                            _ => Some((outpoint, 1)),
                        };
                        if let Some((outpoint, count)) = &stale_streak {
                            if *count >= STALE_OUTPOINT_ABORT {
                                warn!(
                                    "Outpoint {} failed {} composes in a row; a prior \
                                     transaction must confirm first, aborting run",
                                    outpoint, count
                                );
                                break;
                            }
                        }
                    } else {
                        stale_streak = None;
                    }
                }
            } else {
                stale_streak = None;
                tokio::time::sleep(self.config.wait_after_broadcast).await;
            }
        }

        self.persist(&envelope).await?;
        Ok(outcomes)
    }

    /// Compose → sign → broadcast → verify for one asset. The durable
    /// marker is already in place when this is called.
    async fn relist_asset(
        &self,
        asset: &str,
        price: f64,
        fee_rate: f64,
        inputs_set: &[String],
        envelope: &mut MaintenanceEnvelope,
    ) -> (MaintenanceOutcome, RunControl) {
        let request = ComposeOrderRequest {
            give_asset: format!("{ASSET_NAMESPACE}{asset}"),
            give_quantity: 1,
            get_asset: "XCP".to_string(),
            get_quantity: price_to_base_units(price),
            expiration: self.config.order_expiration,
            fee_rate,
            inputs_set: (!inputs_set.is_empty()).then(|| inputs_set.to_vec()),
        };

        let broadcast_result: Result<String> = async {
            let composed = self
                .ledger
                .compose_order(&self.config.address, &request)
                .await
                .map_err(|e| anyhow::anyhow!(e.message()))?;
            let signed = self
                .signer
                .sign(&composed.raw_transaction)
                .await
                .context("sign failed")?;
            let txid = self
                .chain
                .broadcast(&signed.hex)
                .await
                .map_err(|e| anyhow::anyhow!(e.message()))?;
            Ok(txid)
        }
        .await;

        match broadcast_result {
            Ok(txid) => {
                info!("Re-listed {} at {} XCP: {}", asset, price, txid);
                if let Some(entry) = envelope.active_orders.get_mut(asset) {
                    entry.txid = txid.clone();
                    entry.broadcast_time = Utc::now();
                }
                envelope.failed_assets.remove(asset);
                if let Err(e) = self.persist(envelope).await {
                    warn!("Failed to persist marker for {}: {}", asset, e);
                }

                // Give the ledger a moment, then confirm the order shows up.
                tokio::time::sleep(self.config.verify_delay).await;
                match self.ledger.mempool_order_assets(&self.config.address).await {
                    Ok(mempool) if mempool.contains(asset) => {
                        debug!("Order for {} visible in mempool", asset);
                    }
                    Ok(_) => warn!("Order for {} not yet visible in mempool", asset),
                    Err(e) => warn!("Verification fetch for {} failed: {}", asset, e),
                }

                self.notifier
                    .info("order re-listed", json!({"asset": asset, "price": price, "txid": txid}))
                    .await;
                (
                    MaintenanceOutcome {
                        asset: asset.to_string(),
                        success: true,
                        txid: Some(txid),
                        error: None,
                        skipped: false,
                    },
                    RunControl::Continue,
                )
            }
            Err(e) => {
                let message = format!("{e:#}");

                // The broadcast may have landed even though the response
                // was lost; check before counting this as a failure.
                tokio::time::sleep(self.config.verify_delay).await;
                if let Ok(mempool) =
                    self.ledger.mempool_order_assets(&self.config.address).await
                {
                    if mempool.contains(asset) {
                        info!(
                            "Order for {} visible in mempool despite error ({})",
                            asset, message
                        );
                        return (
                            MaintenanceOutcome {
                                asset: asset.to_string(),
                                success: true,
                                txid: None,
                                error: None,
                                skipped: false,
                            },
                            RunControl::Continue,
                        );
                    }
                }

                // Leave the marker in place: the TTL is the only safe
                // clearing mechanism against duplicate listings.
                warn!("Re-listing {} failed: {}", asset, message);
                let entry = envelope
                    .failed_assets
                    .entry(asset.to_string())
                    .or_insert(AssetFailure {
                        count: 0,
                        last_error: String::new(),
                        last_attempt: Utc::now(),
                    });
                entry.count += 1;
                entry.last_error = message.clone();
                entry.last_attempt = Utc::now();
                if let Err(e) = self.persist(envelope).await {
                    warn!("Failed to persist failure for {}: {}", asset, e);
                }

                let control = if is_insufficient_funds(&message) {
                    self.notifier
                        .critical(
                            "maintenance out of funds",
                            json!({"asset": asset, "error": message}),
                        )
                        .await;
                    RunControl::Abort
                } else {
                    RunControl::Continue
                };

                (
                    MaintenanceOutcome {
                        asset: asset.to_string(),
                        success: false,
                        txid: None,
                        error: Some(message),
                        skipped: false,
                    },
                    control,
                )
            }
        }
    }

    async fn persist(&self, envelope: &MaintenanceEnvelope) -> Result<()> {
        set_json(&*self.store, MAINTENANCE_STATE_KEY, envelope, None)
            .await
            .context("Failed to persist maintenance state")
    }
}

fn skipped(asset: &str) -> MaintenanceOutcome {
    MaintenanceOutcome {
        asset: asset.to_string(),
        success: true,
        txid: None,
        error: None,
        skipped: true,
    }
}

/// The error families that mean "no compose can succeed until funding
/// changes": abort the rest of the run.
fn is_insufficient_funds(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["insufficient", "not enough", "no utxos", "balance"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// A `txid:vout` outpoint quoted in a compose error, if any.
fn extract_outpoint(message: &str) -> Option<String> {
    let bytes = message.as_bytes();
    let mut start = 0usize;
    while start < bytes.len() {
        if bytes[start].is_ascii_hexdigit() {
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                end += 1;
            }
            if end - start == 64 && end < bytes.len() && bytes[end] == b':' {
                let mut vout_end = end + 1;
                while vout_end < bytes.len() && bytes[vout_end].is_ascii_digit() {
                    vout_end += 1;
                }
                if vout_end > end + 1 {
                    return Some(message[start..vout_end].to_lowercase());
                }
            }
            start = end;
        } else {
            start += 1;
        }
    }
    None
}
