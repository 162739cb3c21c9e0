use crate::client::ControlApi;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::watch;

/// Periodic liveness signal. Failures are logged and ignored: the control
/// plane tracks liveness through `last_seen` staleness, so a missed beat
/// costs nothing beyond aging.
pub async fn run<C: ControlApi>(api: C, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match api.heartbeat().await {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(e) => warn!("Heartbeat failed: {e}"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
