//! Timed loop that feeds inventory snapshots into the reconciler.

use crate::inventory::Inventory;
use crate::overlay::Overlay;
use crate::reconcile::{ProxySet, ReconcileResult};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct Poller<I: Inventory, O: Overlay> {
    inventory: I,
    proxies: ProxySet<O>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<I: Inventory, O: Overlay> Poller<I, O> {
    pub fn new(
        inventory: I,
        proxies: ProxySet<O>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inventory,
            proxies,
            interval,
            shutdown_rx,
        }
    }

    pub fn proxies(&self) -> &ProxySet<O> {
        &self.proxies
    }

    /// Fetch one snapshot and reconcile against it. A failed fetch leaves
    /// every endpoint as it was and returns `None`.
    pub async fn tick(&mut self) -> Option<ReconcileResult> {
        let services = match self.inventory.fetch().await {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "Error fetching apps");
                return None;
            }
        };

        let result = self.proxies.reconcile(&services).await;
        if result.is_unchanged() {
            debug!(services = services.len(), exposed = self.proxies.len(), "Proxies up to date");
        } else {
            info!(
                added = result.added.len(),
                updated = result.updated.len(),
                removed = result.removed.len(),
                failed = result.failed.len(),
                exposed = self.proxies.len(),
                "Proxies reconciled"
            );
        }
        Some(result)
    }

    /// Poll until shutdown is signalled, then close every endpoint.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Inventory poller started");

        loop {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(exposed = self.proxies.len(), "Inventory poller shutting down");
        self.proxies.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;
    use crate::error::InventoryError;
    use crate::inventory::{Service, ServiceState};
    use crate::overlay::LocalOverlay;
    use crate::pool::{ConnectionPool, PoolConfig};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Arc;

    /// Replays queued snapshots; `None` entries fail the fetch
    #[derive(Default, Clone)]
    struct ScriptedInventory {
        snapshots: Arc<Mutex<VecDeque<Option<Vec<Service>>>>>,
        fetches: Arc<Mutex<usize>>,
    }

    impl ScriptedInventory {
        fn push(&self, snapshot: Option<Vec<Service>>) {
            self.snapshots.lock().push_back(snapshot);
        }

        fn fetch_count(&self) -> usize {
            *self.fetches.lock()
        }
    }

    impl Inventory for ScriptedInventory {
        fn fetch(&self) -> impl Future<Output = Result<Vec<Service>, InventoryError>> + Send {
            *self.fetches.lock() += 1;
            let next = self.snapshots.lock().pop_front().flatten();
            async move { next.ok_or_else(|| InventoryError::Unexpected("scripted failure".into())) }
        }
    }

    fn poller(
        inventory: ScriptedInventory,
        interval: Duration,
    ) -> (Poller<ScriptedInventory, LocalOverlay>, watch::Sender<bool>) {
        let overlay = LocalOverlay::new(OverlayConfig {
            bind: "127.0.0.1".to_string(),
            tls: false,
            ..OverlayConfig::default()
        })
        .unwrap();
        let proxies = ProxySet::new(
            Arc::new(overlay),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            "127.0.0.1",
            Duration::from_secs(5),
        );
        let (tx, rx) = watch::channel(false);
        (Poller::new(inventory, proxies, interval, rx), tx)
    }

    fn minio(state: ServiceState) -> Service {
        Service::new("minio", state).with_port("web", 9002)
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_endpoints_unchanged() {
        let inventory = ScriptedInventory::default();
        inventory.push(Some(vec![minio(ServiceState::Running)]));
        inventory.push(None);

        let (mut poller, _tx) = poller(inventory, Duration::from_secs(10));

        let first = poller.tick().await.unwrap();
        assert_eq!(first.added, vec!["minio"]);

        assert!(poller.tick().await.is_none());
        assert_eq!(poller.proxies().names(), vec!["minio"]);
    }

    #[tokio::test]
    async fn test_run_polls_and_closes_on_shutdown() {
        let inventory = ScriptedInventory::default();
        inventory.push(Some(vec![minio(ServiceState::Running)]));
        inventory.push(Some(vec![minio(ServiceState::Running)]));

        let (poller, tx) = poller(inventory.clone(), Duration::from_millis(20));
        let handle = tokio::spawn(poller.run());

        let start = std::time::Instant::now();
        while inventory.fetch_count() < 3 && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inventory.fetch_count() >= 3);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller should stop")
            .unwrap();
    }
}
