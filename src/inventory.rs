//! Inventory service client and the typed view of its app listing.
//!
//! The inventory answers which services exist, what state they are in and on
//! which portals they can be reached. Only `GET /app`, `GET /system/info` and
//! `GET /core/ping` are consumed.

use crate::error::InventoryError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle state reported for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Crashed,
    Deploying,
    Running,
    Stopped,
    Stopping,
    /// Any state this client does not know about
    #[serde(other)]
    Unknown,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        match self {
            ServiceState::Running => true,
            ServiceState::Crashed
            | ServiceState::Deploying
            | ServiceState::Stopped
            | ServiceState::Stopping
            | ServiceState::Unknown => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Crashed => "CRASHED",
            ServiceState::Deploying => "DEPLOYING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopped => "STOPPED",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A labelled port a service is reachable on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub label: String,
    pub port: u16,
}

/// One service as reported by the inventory.
///
/// Ports are ordered by label so that "first port" means the same thing on
/// every poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawService")]
pub struct Service {
    pub name: String,
    pub state: ServiceState,
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn new(name: &str, state: ServiceState) -> Self {
        Self {
            name: name.to_string(),
            state,
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, label: &str, port: u16) -> Self {
        self.ports.push(ServicePort {
            label: label.to_string(),
            port,
        });
        self
    }

    /// The port used for proxying, if any
    pub fn first_port(&self) -> Option<u16> {
        self.ports.first().map(|p| p.port)
    }
}

#[derive(Deserialize)]
struct RawService {
    name: String,
    state: ServiceState,
    #[serde(default)]
    portals: Option<BTreeMap<String, String>>,
}

impl From<RawService> for Service {
    fn from(raw: RawService) -> Self {
        let ports = raw
            .portals
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(label, url)| match portal_port(&url) {
                Some(port) => Some(ServicePort { label, port }),
                None => {
                    warn!(
                        service = %raw.name,
                        label = %label,
                        url = %url,
                        "Ignoring portal with unusable URL"
                    );
                    None
                }
            })
            .collect();

        Self {
            name: raw.name,
            state: raw.state,
            ports,
        }
    }
}

/// Extract the port from a portal URL, falling back to the scheme default.
fn portal_port(url: &str) -> Option<u16> {
    let uri: hyper::Uri = url.parse().ok()?;
    uri.authority()?;
    uri.port_u16().or(match uri.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    #[serde(alias = "Hostname")]
    hostname: String,
}

/// Source of service snapshots for the poller
pub trait Inventory: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<Vec<Service>, InventoryError>> + Send;
}

/// Retry behaviour for inventory requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.wait_min.saturating_mul(factor).min(self.wait_max)
    }
}

/// HTTP client for the inventory REST API
pub struct InventoryClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl InventoryClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, InventoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| InventoryError::Transport {
                endpoint: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List all apps and their portals
    pub async fn apps(&self) -> Result<Vec<Service>, InventoryError> {
        self.get("/app").await
    }

    /// Hostname of the inventory host
    pub async fn hostname(&self) -> Result<String, InventoryError> {
        let info: SystemInfo = self.get("/system/info").await?;
        Ok(info.hostname)
    }

    pub async fn ping(&self) -> Result<(), InventoryError> {
        let pong: String = self.get("/core/ping").await?;
        if pong != "pong" {
            return Err(InventoryError::Unexpected(pong));
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, InventoryError> {
        if self.api_key.is_empty() {
            return Err(InventoryError::MissingApiKey);
        }

        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt = 0;

        let response = loop {
            let result = self.http.get(&url).bearer_auth(&self.api_key).send().await;

            let retryable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
                }
                Err(_) => true,
            };

            if !retryable || attempt >= self.retry.max_retries {
                break result.map_err(|source| InventoryError::Transport {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            }

            let wait = self.retry.backoff(attempt);
            let wait_ms = wait.as_millis() as u64;
            match &result {
                Ok(resp) => warn!(
                    endpoint,
                    status = %resp.status(),
                    attempt,
                    wait_ms,
                    "Inventory request failed, retrying"
                ),
                Err(e) => warn!(
                    endpoint,
                    error = %e,
                    attempt,
                    wait_ms,
                    "Inventory request failed, retrying"
                ),
            }
            tokio::time::sleep(wait).await;
            attempt += 1;
        };

        let status = response.status();
        if !status.is_success() {
            return Err(InventoryError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("application/json") {
            return Err(InventoryError::ContentType(content_type));
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| InventoryError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        debug!(endpoint, bytes = body.len(), "Inventory response received");

        serde_json::from_slice(&body).map_err(|source| InventoryError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

impl Inventory for InventoryClient {
    fn fetch(&self) -> impl Future<Output = Result<Vec<Service>, InventoryError>> + Send {
        self.apps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarshal_app() {
        let app: Service = serde_json::from_str(
            r#"{"name":"minio", "state": "RUNNING", "portals": {"webUI": "http://127.0.0.1:9002"}}"#,
        )
        .unwrap();

        assert_eq!(app.name, "minio");
        assert_eq!(app.state, ServiceState::Running);
        assert_eq!(
            app.ports,
            vec![ServicePort {
                label: "webUI".to_string(),
                port: 9002
            }]
        );
    }

    #[test]
    fn test_all_states_parse() {
        for (raw, state) in [
            ("CRASHED", ServiceState::Crashed),
            ("DEPLOYING", ServiceState::Deploying),
            ("RUNNING", ServiceState::Running),
            ("STOPPED", ServiceState::Stopped),
            ("STOPPING", ServiceState::Stopping),
            ("SOMETHING_NEW", ServiceState::Unknown),
        ] {
            let json = format!(r#"{{"name":"a","state":"{}"}}"#, raw);
            let app: Service = serde_json::from_str(&json).unwrap();
            assert_eq!(app.state, state);
            assert_eq!(app.state.is_running(), raw == "RUNNING");
        }
    }

    #[test]
    fn test_ports_sorted_by_label() {
        let app: Service = serde_json::from_str(
            r#"{"name":"a","state":"RUNNING","portals":{"web":"http://h:8080","admin":"http://h:9000"}}"#,
        )
        .unwrap();

        assert_eq!(app.ports[0].label, "admin");
        assert_eq!(app.first_port(), Some(9000));
        assert_eq!(app.ports[1].port, 8080);
    }

    #[test]
    fn test_missing_and_null_portals() {
        let app: Service = serde_json::from_str(r#"{"name":"a","state":"STOPPED"}"#).unwrap();
        assert!(app.ports.is_empty());

        let app: Service =
            serde_json::from_str(r#"{"name":"a","state":"RUNNING","portals":null}"#).unwrap();
        assert_eq!(app.first_port(), None);
    }

    #[test]
    fn test_unusable_portal_skipped() {
        let app: Service = serde_json::from_str(
            r#"{"name":"a","state":"RUNNING","portals":{"a":"not a url","b":"http://h:81"}}"#,
        )
        .unwrap();
        assert_eq!(app.ports.len(), 1);
        assert_eq!(app.first_port(), Some(81));
    }

    #[test]
    fn test_portal_default_ports() {
        assert_eq!(portal_port("http://host/ui"), Some(80));
        assert_eq!(portal_port("https://host"), Some(443));
        assert_eq!(portal_port("http://host:1234"), Some(1234));
        assert_eq!(portal_port("/relative"), None);
    }

    #[test]
    fn test_retry_backoff_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            wait_min: Duration::from_millis(100),
            wait_max: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_fast() {
        let client = InventoryClient::new(
            "http://127.0.0.1:1",
            "",
            RetryPolicy::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(
            client.apps().await,
            Err(InventoryError::MissingApiKey)
        ));
    }
}
