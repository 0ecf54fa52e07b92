//! Agent configuration
//!
//! Assembled from two sources:
//! 1. environment variables — addresses, keys, API endpoints, tuning knobs
//! 2. `prices.toml` — the asset price table for maintenance re-listing
//!
//! Everything the controllers need travels in one explicit `AgentConfig`
//! record; nothing is read from the environment after startup.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Bitcoin network the agent operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            other => Err(anyhow!("NETWORK must be mainnet or testnet, got '{other}'")),
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Our seller address (owner of every XCPFOLIO.* subasset).
    pub address: String,
    /// Signing key in WIF form.
    pub private_key_wif: String,
    pub network: Network,
    pub dry_run: bool,

    // Fulfillment tuning
    pub max_mempool_txs: usize,
    pub compose_cooldown: Duration,
    pub max_retries: u32,
    pub rbf_enabled: bool,
    pub stuck_tx_threshold: u64,
    pub max_total_fee_sats: u64,
    /// Ceiling on the market rate for brand-new transfers, sat/vB.
    pub max_fee_rate_for_new_tx: u64,

    // Maintenance tuning
    pub order_expiration: u32,
    pub wait_after_broadcast: Duration,
    pub verify_delay: Duration,

    // Scheduling
    pub check_interval: Duration,
    pub maintenance_interval: Duration,

    // Endpoints
    pub counterparty_api: String,
    pub mempool_api: String,
    pub blockstream_api: String,

    // State store (URL + token REST backend)
    pub store_url: Option<String>,
    pub store_token: Option<String>,

    // Notifications
    pub webhook_url: Option<String>,
}

impl AgentConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let address = std::env::var("XCPFOLIO_ADDRESS")
            .map_err(|_| anyhow!("XCPFOLIO_ADDRESS env var is required"))?;
        let private_key_wif = std::env::var("XCPFOLIO_PRIVATE_KEY")
            .map_err(|_| anyhow!("XCPFOLIO_PRIVATE_KEY env var is required"))?;

        let network = match std::env::var("NETWORK") {
            Ok(v) => v.parse()?,
            Err(_) => Network::Mainnet,
        };

        let check_interval = parse_check_interval(
            &std::env::var("CHECK_INTERVAL").unwrap_or_else(|_| "* * * * *".to_string()),
        );

        Ok(Self {
            address,
            private_key_wif,
            network,
            dry_run: env_flag("DRY_RUN"),
            max_mempool_txs: env_parsed("MAX_MEMPOOL_TXS", default_max_mempool_txs()),
            compose_cooldown: Duration::from_millis(env_parsed(
                "COMPOSE_COOLDOWN",
                default_compose_cooldown_ms(),
            )),
            max_retries: env_parsed("MAX_RETRIES", default_max_retries()),
            rbf_enabled: std::env::var("RBF_ENABLED")
                .map(|v| v != "false")
                .unwrap_or(true),
            stuck_tx_threshold: env_parsed("STUCK_TX_THRESHOLD", default_stuck_tx_threshold()),
            max_total_fee_sats: env_parsed("MAX_TOTAL_FEE_SATS", default_max_total_fee_sats()),
            max_fee_rate_for_new_tx: env_parsed(
                "MAX_FEE_RATE_FOR_NEW_TX",
                default_max_fee_rate(),
            ),
            order_expiration: env_parsed("ORDER_EXPIRATION", default_order_expiration()),
            wait_after_broadcast: Duration::from_millis(env_parsed(
                "WAIT_AFTER_BROADCAST",
                default_wait_after_broadcast_ms(),
            )),
            verify_delay: Duration::from_millis(env_parsed(
                "VERIFY_DELAY",
                default_verify_delay_ms(),
            )),
            check_interval,
            maintenance_interval: Duration::from_secs(env_parsed(
                "MAINTENANCE_INTERVAL_SECS",
                default_maintenance_interval_secs(),
            )),
            counterparty_api: std::env::var("COUNTERPARTY_API")
                .unwrap_or_else(|_| default_counterparty_api()),
            mempool_api: std::env::var("MEMPOOL_API").unwrap_or_else(|_| default_mempool_api()),
            blockstream_api: std::env::var("BLOCKSTREAM_API")
                .unwrap_or_else(|_| default_blockstream_api()),
            store_url: std::env::var("STATE_STORE_URL").ok(),
            store_token: std::env::var("STATE_STORE_TOKEN").ok(),
            webhook_url: std::env::var("NOTIFY_WEBHOOK_URL").ok(),
        })
    }
}

/// Parse the `CHECK_INTERVAL` cron expression into a tick period.
///
/// Scheduling proper lives outside the agent; only the minute field is
/// interpreted here: `* * * * *` means every minute, `*/N * * * *` every N
/// minutes. Anything else falls back to one minute with a warning.
pub fn parse_check_interval(expr: &str) -> Duration {
    let minute_field = expr.split_whitespace().next().unwrap_or("*");
    if minute_field == "*" {
        return Duration::from_secs(60);
    }
    if let Some(step) = minute_field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u64>() {
            if n >= 1 {
                return Duration::from_secs(n * 60);
            }
        }
    }
    tracing::warn!(
        "Unsupported CHECK_INTERVAL '{}', falling back to every minute",
        expr
    );
    Duration::from_secs(60)
}

// ============================================================================
// Price table (prices.toml)
// ============================================================================

#[derive(Debug, Deserialize)]
struct PriceToml {
    #[serde(default)]
    prices: BTreeMap<String, f64>,
}

/// Load the maintenance price table: asset short name → price in XCP.
///
/// Entries with a non-positive price are dropped (a zero price means
/// "do not re-list").
pub fn load_price_table<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, f64>> {
    let contents = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let parsed: PriceToml = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;

    let total = parsed.prices.len();
    let prices: BTreeMap<String, f64> = parsed
        .prices
        .into_iter()
        .filter(|(_, price)| *price > 0.0)
        .collect();
    if prices.len() < total {
        tracing::warn!(
            "Dropped {} non-positive price entries from {}",
            total - prices.len(),
            path.as_ref().display()
        );
    }
    Ok(prices)
}

/// Convert an XCP price to integer base units (1 XCP = 10^8 units).
pub fn price_to_base_units(price_xcp: f64) -> u64 {
    (price_xcp * 100_000_000.0).round() as u64
}

// ============================================================================
// Helpers and defaults
// ============================================================================

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true").unwrap_or(false)
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_max_mempool_txs() -> usize {
    25
}

fn default_compose_cooldown_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_stuck_tx_threshold() -> u64 {
    3
}

fn default_max_total_fee_sats() -> u64 {
    10_000
}

fn default_max_fee_rate() -> u64 {
    100
}

fn default_order_expiration() -> u32 {
    8064
}

fn default_wait_after_broadcast_ms() -> u64 {
    10_000
}

fn default_verify_delay_ms() -> u64 {
    2_000
}

fn default_maintenance_interval_secs() -> u64 {
    3_600
}

fn default_counterparty_api() -> String {
    "https://api.counterparty.io:4000/v2".to_string()
}

fn default_mempool_api() -> String {
    "https://mempool.space/api".to_string()
}

fn default_blockstream_api() -> String {
    "https://blockstream.info/api".to_string()
}

#[cfg(test)]
impl AgentConfig {
    /// A config with all documented defaults, for controller tests.
    pub fn for_tests(address: &str) -> Self {
        Self {
            address: address.to_string(),
            private_key_wif: String::new(),
            network: Network::Mainnet,
            dry_run: false,
            max_mempool_txs: default_max_mempool_txs(),
            compose_cooldown: Duration::from_millis(0),
            max_retries: default_max_retries(),
            rbf_enabled: true,
            stuck_tx_threshold: default_stuck_tx_threshold(),
            max_total_fee_sats: default_max_total_fee_sats(),
            max_fee_rate_for_new_tx: default_max_fee_rate(),
            order_expiration: default_order_expiration(),
            wait_after_broadcast: Duration::from_millis(0),
            verify_delay: Duration::from_millis(0),
            check_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(3600),
            counterparty_api: String::new(),
            mempool_api: String::new(),
            blockstream_api: String::new(),
            store_url: None,
            store_token: None,
            webhook_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_interval_forms() {
        assert_eq!(parse_check_interval("* * * * *"), Duration::from_secs(60));
        assert_eq!(
            parse_check_interval("*/5 * * * *"),
            Duration::from_secs(300)
        );
        assert_eq!(
            parse_check_interval("something weird"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("Testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("regtest".parse::<Network>().is_err());
    }

    #[test]
    fn test_price_table_parse_and_filter() {
        let dir = std::env::temp_dir().join("xcpfolio-test-config");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("prices.toml");
        std::fs::write(
            &path,
            "[prices]\nRAREPEPE = 12.5\nPEPECASH = 0.0\nDANKMEME = 3.0\n",
        )
        .unwrap();

        let prices = load_price_table(&path).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["RAREPEPE"], 12.5);
        assert!(!prices.contains_key("PEPECASH"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_price_base_units() {
        assert_eq!(price_to_base_units(1.0), 100_000_000);
        assert_eq!(price_to_base_units(12.5), 1_250_000_000);
        assert_eq!(price_to_base_units(0.00000001), 1);
    }
}
