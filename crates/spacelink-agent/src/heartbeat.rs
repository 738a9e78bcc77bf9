use spacelink_status::HeartbeatClient;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Post a heartbeat every `interval` until `cancel` fires
///
/// The first heartbeat goes out immediately. Failures are logged and ignored.
pub async fn run_heartbeat(client: HeartbeatClient, interval: Duration, cancel: CancellationToken) {
    info!(
        url = %client.url(),
        interval_secs = interval.as_secs(),
        "💓 Heartbeat enabled"
    );

    // tokio::time::interval panics on a zero period
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.send() => result,
        };

        match result {
            Ok(reply) => debug!(updated_at = %reply.updated_at, "Heartbeat accepted"),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    debug!("Heartbeat stopped");
}
