//! XCPFOLIO fulfillment agent — CLI entry point
//!
//! `run` starts the long-running agent (fulfillment + maintenance loops,
//! SIGINT/SIGTERM honored). The remaining subcommands are one-shot
//! operational tasks against the state store and order-history surface.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use btc_signer::WalletKey;
use xcpfolio_agent_logic::chain::BitcoinClient;
use xcpfolio_agent_logic::config::{load_price_table, AgentConfig};
use xcpfolio_agent_logic::fulfillment::FulfillmentController;
use xcpfolio_agent_logic::history::{DeliveryStatus, OrderHistory};
use xcpfolio_agent_logic::ledger::{CounterpartyClient, LedgerApi};
use xcpfolio_agent_logic::logging::init_logging;
use xcpfolio_agent_logic::maintenance::MaintenanceController;
use xcpfolio_agent_logic::notify::Notifier;
use xcpfolio_agent_logic::runner::run_agent;
use xcpfolio_agent_logic::signer::WalletSigner;
use xcpfolio_agent_logic::store::{
    get_json_fresh, set_json, FulfillmentEnvelope, MaintenanceEnvelope, MemoryStore, RestStore,
    StateStore, FULFILLMENT_STATE_KEY, FULFILLMENT_STATE_TTL, MAINTENANCE_STATE_KEY,
};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "xcpfolio-agent")]
#[command(about = "Automated fulfillment agent for XCPFOLIO DEX orders")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Compose nothing; log what would happen
    #[arg(long, global = true)]
    dry_run: bool,

    /// Path to the maintenance price table
    #[arg(long, default_value = "prices.toml")]
    prices: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default): fulfillment + maintenance loops
    Run,
    /// Print durable controller state
    Status,
    /// Rebuild order-history records from recent filled orders
    BackfillHistory {
        /// How many recent filled orders to backfill
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Overwrite the fulfillment block cursor
    ResetLastBlock {
        height: u64,
    },
    /// Empty the processed-order set
    ClearProcessed,
    /// Rewrite the order-history index from existing records
    RebuildHistory,
    /// Clamp future-dated history timestamps
    FixTimestamps,
    /// Fill in missing delivery times on delivered records
    UpdateDeliveryTimes,
    /// Drop duplicate entries from the order-history index
    FixDuplicates,
}

// ============================================================================
// Shared setup
// ============================================================================

struct Components {
    config: AgentConfig,
    store: Arc<dyn StateStore>,
    ledger: Arc<CounterpartyClient>,
    chain: Arc<BitcoinClient>,
    signer: Arc<WalletSigner<BitcoinClient>>,
}

fn build_components(cli: &Cli) -> Result<Components> {
    let mut config = AgentConfig::from_env().context("Invalid configuration")?;
    if cli.dry_run {
        config.dry_run = true;
    }

    let key = WalletKey::from_wif(&config.private_key_wif, config.network.as_bitcoin())
        .context("XCPFOLIO_PRIVATE_KEY is not a usable WIF key")?;
    if !config.dry_run && !key.owns_address(&config.address) {
        bail!(
            "XCPFOLIO_ADDRESS {} is not derived from the configured private key",
            config.address
        );
    }

    let store: Arc<dyn StateStore> = match (&config.store_url, &config.store_token) {
        (Some(url), Some(token)) => {
            Arc::new(RestStore::new(url, token).context("Failed to create state store client")?)
        }
        _ if config.dry_run => {
            warn!("No state store configured; dry run uses in-memory state");
            Arc::new(MemoryStore::new())
        }
        _ => bail!("STATE_STORE_URL and STATE_STORE_TOKEN are required"),
    };

    let ledger = Arc::new(
        CounterpartyClient::new(&config.counterparty_api)
            .context("Failed to create ledger client")?,
    );
    let chain = Arc::new(
        BitcoinClient::new(&config.mempool_api, &config.blockstream_api)
            .context("Failed to create chain client")?,
    );
    let signer = Arc::new(WalletSigner::new(key, chain.clone()));

    Ok(Components {
        config,
        store,
        ledger,
        chain,
        signer,
    })
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(
        cli.verbose,
        &["xcpfolio_agent", "xcpfolio_agent_logic", "btc_signer"],
    );

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => cmd_run(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::BackfillHistory { limit } => cmd_backfill(&cli, *limit).await,
        Commands::ResetLastBlock { height } => cmd_reset_last_block(&cli, *height).await,
        Commands::ClearProcessed => cmd_clear_processed(&cli).await,
        Commands::RebuildHistory => cmd_rebuild_history(&cli).await,
        Commands::FixTimestamps => cmd_fix_timestamps(&cli).await,
        Commands::UpdateDeliveryTimes => cmd_update_delivery_times(&cli).await,
        Commands::FixDuplicates => cmd_fix_duplicates(&cli).await,
    }
}

async fn cmd_run(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let notifier = Arc::new(Notifier::new(parts.config.webhook_url.clone()));

    let fulfillment = Arc::new(FulfillmentController::new(
        parts.config.clone(),
        parts.ledger.clone(),
        parts.chain.clone(),
        parts.store.clone(),
        parts.signer.clone(),
        notifier.clone(),
    ));
    let maintenance = Arc::new(MaintenanceController::new(
        parts.config.clone(),
        parts.ledger.clone(),
        parts.chain.clone(),
        parts.store.clone(),
        parts.signer.clone(),
        notifier.clone(),
    ));

    match load_price_table(&cli.prices) {
        Ok(prices) => {
            info!("Loaded {} price(s) from {}", prices.len(), cli.prices.display());
            maintenance.set_prices(prices);
        }
        Err(e) => warn!(
            "Price table unavailable ({:#}); maintenance will not re-list anything",
            e
        ),
    }

    notifier
        .info(
            "agent starting",
            serde_json::json!({
                "address": parts.config.address,
                "dry_run": parts.config.dry_run,
            }),
        )
        .await;

    run_agent(parts.config, fulfillment, maintenance).await
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let fulfillment: FulfillmentEnvelope =
        get_json_fresh(&*parts.store, FULFILLMENT_STATE_KEY)
            .await?
            .unwrap_or_default();
    let maintenance: MaintenanceEnvelope =
        get_json_fresh(&*parts.store, MAINTENANCE_STATE_KEY)
            .await?
            .unwrap_or_default();
    let history = OrderHistory::new(parts.store.clone());
    let index = history.index().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "fulfillment": fulfillment,
            "maintenance": maintenance,
            "history_index_len": index.len(),
        }))?
    );
    Ok(())
}

async fn cmd_backfill(cli: &Cli, limit: usize) -> Result<()> {
    let parts = build_components(cli)?;
    let history = OrderHistory::new(parts.store.clone());
    let address = parts.config.address.clone();

    let orders = parts.ledger.filled_orders(&address).await?;
    let mut written = 0usize;
    for order in orders.iter().take(limit) {
        let Some(asset) = order.give_asset.strip_prefix("XCPFOLIO.") else {
            continue;
        };
        let matches = parts.ledger.order_matches(&order.tx_hash).await?;
        let Some(buyer) = matches
            .iter()
            .find_map(|m| m.counterparty_of(&address))
            .map(str::to_string)
        else {
            warn!("No match for {}, skipping", order.tx_hash);
            continue;
        };

        let delivered = parts
            .ledger
            .is_asset_transferred_to(asset, &buyer, &address)
            .await?;
        if delivered {
            let txid = parts
                .ledger
                .asset_issuances(asset)
                .await?
                .iter()
                .find(|i| i.transfer && i.issuer == buyer)
                .map(|i| i.tx_hash.clone());
            history
                .publish_delivered(&order.tx_hash, asset, &buyer, txid.as_deref())
                .await;
        } else {
            history
                .publish_broadcast(&order.tx_hash, asset, &buyer, "", Some(order.get_quantity))
                .await;
        }
        written += 1;
    }
    info!("Backfilled {} order(s) into history", written);
    Ok(())
}

async fn cmd_reset_last_block(cli: &Cli, height: u64) -> Result<()> {
    let parts = build_components(cli)?;
    let mut envelope: FulfillmentEnvelope =
        get_json_fresh(&*parts.store, FULFILLMENT_STATE_KEY)
            .await?
            .unwrap_or_default();
    let previous = envelope.last_block;
    envelope.last_block = height;
    set_json(
        &*parts.store,
        FULFILLMENT_STATE_KEY,
        &envelope,
        Some(FULFILLMENT_STATE_TTL),
    )
    .await?;
    info!("last_block: {} -> {}", previous, height);
    Ok(())
}

async fn cmd_clear_processed(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let mut envelope: FulfillmentEnvelope =
        get_json_fresh(&*parts.store, FULFILLMENT_STATE_KEY)
            .await?
            .unwrap_or_default();
    let count = envelope.processed_orders.len();
    envelope.processed_orders.clear();
    set_json(
        &*parts.store,
        FULFILLMENT_STATE_KEY,
        &envelope,
        Some(FULFILLMENT_STATE_TTL),
    )
    .await?;
    info!("Cleared {} processed order(s)", count);
    Ok(())
}

async fn cmd_rebuild_history(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let history = OrderHistory::new(parts.store.clone());

    // Keep only index entries whose record still exists, newest first.
    let index = history.index().await?;
    let mut kept = Vec::new();
    for hash in index {
        if history.get(&hash).await?.is_some() {
            kept.push(hash);
        }
    }
    let count = kept.len();
    history.replace_index(kept).await?;
    info!("History index rebuilt with {} entr(ies)", count);
    Ok(())
}

async fn cmd_fix_timestamps(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let history = OrderHistory::new(parts.store.clone());
    let now = chrono::Utc::now();

    let mut fixed = 0usize;
    for hash in history.index().await? {
        let Some(mut record) = history.get(&hash).await? else {
            continue;
        };
        let mut dirty = false;
        if record.updated_at > now {
            record.updated_at = now;
            dirty = true;
        }
        if matches!(record.delivered_at, Some(at) if at > now) {
            record.delivered_at = Some(now);
            dirty = true;
        }
        if dirty {
            history.put(record).await?;
            fixed += 1;
        }
    }
    info!("Fixed timestamps on {} record(s)", fixed);
    Ok(())
}

async fn cmd_update_delivery_times(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let history = OrderHistory::new(parts.store.clone());

    let mut updated = 0usize;
    for hash in history.index().await? {
        let Some(mut record) = history.get(&hash).await? else {
            continue;
        };
        if record.status == DeliveryStatus::Delivered && record.delivered_at.is_none() {
            record.delivered_at = Some(record.updated_at);
            history.put(record).await?;
            updated += 1;
        }
    }
    info!("Updated delivery time on {} record(s)", updated);
    Ok(())
}

async fn cmd_fix_duplicates(cli: &Cli) -> Result<()> {
    let parts = build_components(cli)?;
    let history = OrderHistory::new(parts.store.clone());

    let index = history.index().await?;
    let before = index.len();
    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<String> = index
        .into_iter()
        .filter(|h| seen.insert(h.clone()))
        .collect();
    let removed = before - deduped.len();
    history.replace_index(deduped).await?;
    info!("Removed {} duplicate index entr(ies)", removed);
    Ok(())
}
