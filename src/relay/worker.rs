//! Background relay loop

use super::{MessageHandler, RelayService};

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

/// Drains the relay into its destination handler on a fixed interval
pub struct RelayWorker {
    relay: Arc<dyn RelayService>,
    handler: Arc<dyn MessageHandler>,
    poll_interval: Duration,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl RelayWorker {
    pub fn new(
        relay: Arc<dyn RelayService>,
        handler: Arc<dyn MessageHandler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            relay,
            handler,
            poll_interval,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main delivery loop
    pub async fn run(&self) {
        let mut ticker = interval(self.poll_interval);
        info!("Relay worker started");

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }

            let stats = self.relay.deliver_pending(self.handler.as_ref()).await;
            if !stats.is_idle() {
                debug!(
                    delivered = stats.delivered,
                    duplicates = stats.duplicates,
                    blocked = stats.blocked,
                    "Relay pass complete"
                );
            }
        }

        info!("Relay worker stopped");
    }

    /// Stop the loop after its current pass
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
