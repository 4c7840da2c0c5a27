//! Converge the set of running endpoints onto an inventory snapshot.
//!
//! `ProxySet` is the only owner of the endpoint registry. Each call to
//! `reconcile` derives the desired name -> target mapping from scratch, so a
//! failed create or a skipped service is simply retried on the next snapshot.

use crate::endpoint::{ProxyEndpoint, Target};
use crate::error::TargetError;
use crate::inventory::Service;
use crate::overlay::Overlay;
use crate::pool::ConnectionPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Target a service should be proxied to, or `None` when it must not be
/// exposed. Only the first port of a running service is used.
pub fn desired_target(
    service: &Service,
    backend_host: &str,
) -> Option<Result<Target, TargetError>> {
    if !service.state.is_running() {
        return None;
    }
    let port = service.first_port()?;
    Some(Target::from_host_port(backend_host, port))
}

/// What a reconcile pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Endpoints created
    pub added: Vec<String>,
    /// Endpoints whose target changed
    pub updated: Vec<String>,
    /// Endpoints closed and removed
    pub removed: Vec<String>,
    /// Services skipped because their endpoint could not be created or
    /// their target could not be built
    pub failed: Vec<String>,
}

impl ReconcileResult {
    /// True when nothing was created, updated or removed
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Registry of exposed endpoints keyed by service name
pub struct ProxySet<O: Overlay> {
    overlay: Arc<O>,
    pool: Arc<ConnectionPool>,
    backend_host: String,
    request_timeout: Duration,
    endpoints: HashMap<String, ProxyEndpoint>,
}

impl<O: Overlay> ProxySet<O> {
    pub fn new(
        overlay: Arc<O>,
        pool: Arc<ConnectionPool>,
        backend_host: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            overlay,
            pool,
            backend_host: backend_host.into(),
            request_timeout,
            endpoints: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ProxyEndpoint> {
        self.endpoints.get(name)
    }

    /// Exposed names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create, retarget and remove endpoints so that exactly the running
    /// services with a port are exposed.
    pub async fn reconcile(&mut self, services: &[Service]) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        let mut seen = HashSet::new();

        for service in services {
            if !seen.insert(service.name.as_str()) {
                warn!(service = %service.name, "Duplicate service in snapshot, ignoring");
                continue;
            }

            let target = match desired_target(service, &self.backend_host) {
                None => continue,
                Some(Ok(target)) => target,
                Some(Err(e)) => {
                    warn!(
                        service = %service.name,
                        error = %e,
                        "Skipping service with invalid target"
                    );
                    result.failed.push(service.name.clone());
                    continue;
                }
            };

            // A listener that died on its own is replaced like a missing one
            if self.endpoints.get(&service.name).is_some_and(|e| e.is_stopped()) {
                warn!(service = %service.name, "Proxy listener stopped, recreating");
                self.endpoints.remove(&service.name);
            }

            if let Some(endpoint) = self.endpoints.get(&service.name) {
                let current = endpoint.target();
                if *current != target {
                    info!(
                        service = %service.name,
                        from = %current,
                        to = %target,
                        "Updating proxy target"
                    );
                    endpoint.set_target(target);
                    result.updated.push(service.name.clone());
                }
                continue;
            }

            match ProxyEndpoint::create(
                &service.name,
                target.clone(),
                self.overlay.as_ref(),
                Arc::clone(&self.pool),
                self.request_timeout,
            )
            .await
            {
                Ok(endpoint) => {
                    info!(
                        service = %service.name,
                        fqdn = %endpoint.fqdn(),
                        target = %target,
                        "Registering proxy"
                    );
                    self.endpoints.insert(service.name.clone(), endpoint);
                    result.added.push(service.name.clone());
                }
                Err(e) => {
                    error!(
                        service = %service.name,
                        target = %target,
                        error = %e,
                        "Failed to create proxy"
                    );
                    result.failed.push(service.name.clone());
                }
            }
        }

        let mut by_name: HashMap<&str, &Service> = HashMap::new();
        for service in services {
            by_name.entry(service.name.as_str()).or_insert(service);
        }

        let mut stale: Vec<String> = self
            .endpoints
            .keys()
            .filter(|name| match by_name.get(name.as_str()) {
                None => true,
                Some(service) => !service.state.is_running() || service.ports.is_empty(),
            })
            .cloned()
            .collect();
        stale.sort();

        for name in stale {
            match by_name.get(name.as_str()) {
                None => info!(service = %name, "Service removed, removing proxy"),
                Some(service) if !service.state.is_running() => {
                    info!(
                        service = %name,
                        state = %service.state,
                        "Service not running, removing proxy"
                    )
                }
                Some(_) => info!(service = %name, "Service has no ports, removing proxy"),
            }

            if let Some(endpoint) = self.endpoints.remove(&name) {
                endpoint.shutdown().await;
            }
            result.removed.push(name);
        }

        result
    }

    /// Close every endpoint and wait for their listeners to be released
    pub async fn close_all(&mut self) {
        for (name, endpoint) in self.endpoints.drain() {
            info!(service = %name, "Closing proxy");
            endpoint.shutdown().await;
        }
    }
}
