//! Network connectivity observation

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Online/offline state source
#[async_trait]
pub trait ConnectivityService: Send + Sync {
    /// Current connectivity
    async fn is_online(&self) -> bool;

    /// Begin observing the network
    async fn start_monitoring(&self);

    /// Stop observing the network
    async fn stop_monitoring(&self);

    /// Receiver that sees every online/offline change
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven explicitly through [`set_online`](Self::set_online)
///
/// Useful for tests and for hosts that learn about the network elsewhere.
#[derive(Debug)]
pub struct ManualConnectivity {
    state: watch::Sender<bool>,
    monitoring: AtomicBool,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            monitoring: AtomicBool::new(false),
        }
    }

    /// Change connectivity, notifying subscribers on a real change
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ConnectivityService for ManualConnectivity {
    async fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    async fn start_monitoring(&self) {
        self.monitoring.store(true, Ordering::SeqCst);
    }

    async fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
