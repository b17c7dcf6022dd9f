//! Connectivity signal that parked uploads wait on.
//!
//! The flag is flipped externally (platform network callbacks, the
//! `/connectivity` endpoint) and by uploads that observe the store as
//! unreachable. Waiters are woken by the change itself, never by polling.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            tracing::info!(online, "connectivity changed");
        }
    }

    /// Wait until the monitor reports online, for at most `limit`.
    ///
    /// Returns false if the limit elapsed first.
    pub async fn wait_online(&self, limit: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let result = tokio::time::timeout(limit, rx.wait_for(|online| *online)).await;
        matches!(result, Ok(Ok(_)))
    }
}
