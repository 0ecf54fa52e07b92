//! Long-running agent loop — timers, signals, graceful shutdown
//!
//! Drives the fulfillment controller on the configured check interval and
//! the maintenance controller on its (hourly) interval. SIGINT/SIGTERM set
//! the cooperative stop flag and the loop drains the in-flight run for up
//! to 30 seconds; a second Ctrl-C forces immediate exit.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::chain::ChainApi;
use crate::config::AgentConfig;
use crate::fulfillment::FulfillmentController;
use crate::ledger::LedgerApi;
use crate::maintenance::MaintenanceController;
use crate::signer::TxSigner;
use crate::store::StateStore;

/// Ceiling on a single fulfillment tick.
const FULFILLMENT_TICK_TIMEOUT: Duration = Duration::from_secs(300);
/// Ceiling on a single maintenance tick.
const MAINTENANCE_TICK_TIMEOUT: Duration = Duration::from_secs(900);
/// How long shutdown waits for an in-flight run.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Run both controllers until SIGINT/SIGTERM.
pub async fn run_agent<L, C, S, G>(
    config: AgentConfig,
    fulfillment: Arc<FulfillmentController<L, C, S, G>>,
    maintenance: Arc<MaintenanceController<L, C, S, G>>,
) -> Result<()>
where
    L: LedgerApi + 'static,
    C: ChainApi + 'static,
    S: StateStore + ?Sized + 'static,
    G: TxSigner + 'static,
{
    // Timers use Skip so a long tick doesn't cause a burst afterwards.
    let mut fulfillment_timer = interval(config.check_interval);
    fulfillment_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut maintenance_timer = interval(config.maintenance_interval);
    maintenance_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut heartbeat_timer = interval(Duration::from_secs(300));
    heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Dedicated signal task so a signal is seen even while a tick is busy.
    // The first signal requests a graceful stop; the second forces exit.
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_notify = Arc::new(Notify::new());
    {
        let flag = shutdown_flag.clone();
        let notify = shutdown_notify.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            warn!("Shutdown signal received, stopping gracefully...");
            flag.store(true, Ordering::SeqCst);
            notify.notify_one();

            wait_for_signal().await;
            warn!("Second shutdown signal, forcing immediate exit");
            std::process::exit(1);
        });
    }

    info!(
        "Agent started (fulfillment every {:?}, maintenance every {:?})",
        config.check_interval, config.maintenance_interval
    );

    loop {
        tokio::select! {
            _ = fulfillment_timer.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    continue;
                }
                match tokio::time::timeout(FULFILLMENT_TICK_TIMEOUT, fulfillment.process()).await {
                    Ok(Ok(outcomes)) => {
                        if !outcomes.is_empty() {
                            let ok = outcomes.iter().filter(|o| o.success).count();
                            info!(
                                "Fulfillment tick: {} outcome(s), {} successful",
                                outcomes.len(),
                                ok
                            );
                        }
                    }
                    // Fatal infrastructure error: record it and let the
                    // next tick retry.
                    Ok(Err(e)) => error!("Fulfillment run failed: {:#}", e),
                    Err(_) => warn!(
                        "Fulfillment run timed out after {:?}",
                        FULFILLMENT_TICK_TIMEOUT
                    ),
                }
            }

            _ = maintenance_timer.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    continue;
                }
                match tokio::time::timeout(MAINTENANCE_TICK_TIMEOUT, maintenance.run()).await {
                    Ok(Ok(outcomes)) => {
                        if !outcomes.is_empty() {
                            info!("Maintenance tick: {} outcome(s)", outcomes.len());
                        }
                    }
                    Ok(Err(e)) => error!("Maintenance run failed: {:#}", e),
                    Err(_) => warn!(
                        "Maintenance run timed out after {:?}",
                        MAINTENANCE_TICK_TIMEOUT
                    ),
                }
            }

            _ = heartbeat_timer.tick() => {
                let snapshot = fulfillment.state_snapshot();
                if !snapshot.active.is_empty() || !snapshot.failures.is_empty() {
                    info!(
                        "Heartbeat: {} active transfer(s), {} order(s) in retry",
                        snapshot.active.len(),
                        snapshot.failures.len()
                    );
                }
            }

            _ = shutdown_notify.notified() => {
                break;
            }
        }
    }

    // Graceful drain: stop between orders, then wait for the run to end.
    info!("Draining in-flight work (up to {:?})...", SHUTDOWN_DRAIN);
    fulfillment.request_stop();
    let drain = async {
        fulfillment.wait_until_idle().await;
        maintenance.wait_until_idle().await;
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("In-flight run did not finish within {:?}", SHUTDOWN_DRAIN);
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
