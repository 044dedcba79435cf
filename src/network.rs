//! Connectivity observer
//!
//! The platform layer (or an operator through the API) reports link changes
//! with [`NetworkMonitor::set`]. The scheduler subscribes and re-evaluates
//! eligibility whenever the link type changes.

use tokio::sync::watch;
use tracing::info;

use crate::task::LinkType;

#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<LinkType>,
}

impl NetworkMonitor {
    pub fn new(initial: LinkType) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> LinkType {
        *self.tx.borrow()
    }

    /// Report the current link type. Returns true if it changed.
    pub fn set(&self, link: LinkType) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == link {
                false
            } else {
                *current = link;
                true
            }
        });
        if changed {
            info!(link = %link, "Network link changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkType> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(LinkType::Unmetered)
    }
}
