use crate::pipeline::Shards;
use crate::router::DeviceDirectory;
use chrono::Utc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodic connectivity and missing-data sweep, followed by a check that
/// every live session still belongs to a registered device.
pub async fn run_sweeper(
    shards: Shards,
    directory: DeviceDirectory,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; nothing can be stale yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shards.broadcast_sweep(Utc::now()).await;
                if let Err(err) = reconcile(&shards, &directory).await {
                    tracing::warn!(error = %err, "device registry reconciliation failed");
                }
            }
        }
    }
    tracing::debug!("sweeper stopped");
}

/// Drops sessions of devices that disappeared from the device table.
pub async fn reconcile(shards: &Shards, directory: &DeviceDirectory) -> Result<usize, sqlx::Error> {
    let live = shards.device_ids();
    if live.is_empty() {
        return Ok(0);
    }
    let registered = directory.registered_among(&live).await?;
    let mut removed = 0;
    for device_id in live.iter().filter(|id| !registered.contains(*id)) {
        if shards.deregister(device_id).await {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(removed, "dropped sessions of deregistered devices");
    }
    Ok(removed)
}
