use crate::payments::registry::ChannelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Reloads routing configuration on a fixed interval. A failed reload keeps
/// the previous snapshot serving traffic.
pub struct RouteRefreshWorker {
    registry: Arc<ChannelRegistry>,
    interval: Duration,
}

impl RouteRefreshWorker {
    pub fn new(registry: Arc<ChannelRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "route refresh worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.registry.refresh().await {
                        warn!(error = %e, "route refresh failed, keeping previous routes");
                    }
                }
            }
        }

        info!("route refresh worker stopped");
    }
}
