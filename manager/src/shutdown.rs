//! Shutdown barrier across all running services.
//!
//! `begin` broadcasts termination to every instance with a live
//! subprocess and stores a notifier that fires exactly once when the
//! completion predicate holds: no installed instance has a pid.

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::registry::SharedRegistry;

#[derive(Default)]
pub struct ShutdownCoordinator {
    /// Pending shutdown target. Storing a new notifier overwrites any
    /// previous one: at most one shutdown is in flight.
    pending: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin shutting down: signal every running service and arm the
    /// barrier. The immediate re-check covers the case where nothing
    /// was running to begin with.
    pub async fn begin(&self, registry: &SharedRegistry, notify: oneshot::Sender<()>) {
        {
            let mut pending = self.pending.lock().await;
            *pending = Some(notify);
        }

        {
            let reg = registry.lock().await;
            for service in reg.installed.values() {
                if !service.is_running() {
                    continue;
                }
                match &service.term {
                    Some(token) => {
                        info!("Terminating {}", service.id);
                        token.cancel();
                    }
                    // Delivery failure is swallowed: the exit event
                    // will still clear the pid.
                    None => debug!("No termination handle for {}", service.id),
                }
            }
        }

        self.check(registry).await;
    }

    /// Re-evaluate the completion predicate. Called on every
    /// subprocess exit; once it fires the stored notifier, later
    /// calls are no-ops.
    pub async fn check(&self, registry: &SharedRegistry) {
        let mut pending = self.pending.lock().await;
        if pending.is_none() {
            return;
        }

        {
            let reg = registry.lock().await;
            if reg.installed.values().any(|s| s.is_running()) {
                return;
            }
        }

        if let Some(notify) = pending.take() {
            info!("All services have stopped, completing shutdown");
            let _ = notify.send(());
        }
    }
}
