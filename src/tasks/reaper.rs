//! Background loops: lease reaper, retry promotion and the running re-check.
//!
//! Each loop talks to the store only through `TaskManager`, the same API
//! foreign callers use. The reaper returns an error when the store fails;
//! the daemon treats that as fatal. The re-check loop logs its failures and
//! keeps going: a ledger write it could not make has already raised the
//! fatal signal through `TaskManager`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CoordinationError;
use crate::tasks::manager::TaskManager;

/// Spawn the lease reaper. Each tick requeues lapsed leases, then promotes
/// failed tasks whose retry backoff has elapsed.
pub fn spawn_lease_reaper(
    manager: Arc<TaskManager>,
    interval: Duration,
) -> JoinHandle<Result<(), CoordinationError>> {
    tokio::spawn(async move {
        info!("Lease reaper started (interval: {:?})", interval);
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Err(e) = run_reaper_cycle(&manager).await {
                error!(error = %e, "Lease reaper failed");
                return Err(e);
            }
        }
    })
}

/// One reaper cycle: expired leases, then due retries.
pub async fn run_reaper_cycle(manager: &TaskManager) -> Result<(), CoordinationError> {
    let reaped = manager.reap_expired().await?;
    let promoted = manager.promote_retries().await?;
    debug!(reaped = reaped.len(), promoted = promoted.len(), "Reaper cycle");
    Ok(())
}

/// Spawn the mid-execution policy re-check. Runs until aborted.
pub fn spawn_recheck_loop(manager: Arc<TaskManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Running re-check started (interval: {:?})", interval);
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing is running yet.
        tick.tick().await;

        loop {
            tick.tick().await;
            match manager.recheck_running().await {
                Ok(revoked) if !revoked.is_empty() => {
                    info!(count = revoked.len(), "Running tasks revoked by policy");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Running re-check failed, retrying next tick"),
            }
        }
    })
}

/// Resolve once the fatal signal fires. Never resolves if the sender is
/// gone without having fired.
pub async fn wait_for_fatal(mut fatal: watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = fatal.borrow_and_update().clone() {
            return reason;
        }
        if fatal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
