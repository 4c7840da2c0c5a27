use crate::endpoint::Target;
use crate::inventory::RetryPolicy;
use crate::pool::PoolConfig;
use clap::Parser;
use hyper::http::uri::Authority;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Expose TrueNAS apps as TLS endpoints on a private overlay network
#[derive(Parser, Debug, Default)]
#[command(name = "tailgate", version, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "TAILGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// TrueNAS API key
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    pub truenas_api_key: Option<String>,

    /// TrueNAS hostname or IP, optionally with the HTTP port [default: 127.0.0.1]
    #[arg(long, env = "TRUENAS_HOSTNAME")]
    pub truenas_hostname: Option<String>,

    /// Hostname to use on the overlay network. Defaults to the hostname configured in TrueNAS
    #[arg(long, env = "TS_HOSTNAME")]
    pub hostname: Option<String>,

    /// Seconds between inventory polls [default: 10]
    #[arg(long, env = "TAILGATE_POLL_INTERVAL")]
    pub poll_interval_secs: Option<u64>,
}

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub poller: PollerConfig,
}

/// Where and how to reach the inventory API
#[derive(Debug, Deserialize, Clone)]
pub struct InventoryConfig {
    /// Hostname or IP, with an optional port (default: 127.0.0.1)
    #[serde(default = "default_inventory_hostname")]
    pub hostname: String,

    /// Bearer token for the REST API
    pub api_key: Option<String>,

    /// Path prefix of the REST API (default: /api/v2.0)
    #[serde(default = "default_api_path")]
    pub api_path: String,

    /// Retries for failed requests (default: 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial wait between retries in milliseconds (default: 1000)
    #[serde(default = "default_retry_wait_min")]
    pub retry_wait_min_ms: u64,

    /// Maximum wait between retries in milliseconds (default: 30000)
    #[serde(default = "default_retry_wait_max")]
    pub retry_wait_max_ms: u64,

    /// Timeout of a single request in seconds (default: 30)
    #[serde(default = "default_inventory_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            hostname: default_inventory_hostname(),
            api_key: None,
            api_path: default_api_path(),
            max_retries: default_max_retries(),
            retry_wait_min_ms: default_retry_wait_min(),
            retry_wait_max_ms: default_retry_wait_max(),
            request_timeout_secs: default_inventory_timeout(),
        }
    }
}

impl InventoryConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}{}", self.hostname, self.api_path)
    }

    /// The inventory host's own web UI
    pub fn web_target(&self) -> anyhow::Result<Target> {
        format!("http://{}", self.hostname)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!("could not parse inventory hostname {}: {}", self.hostname, e)
            })
    }

    /// Host that app ports are reached on, without any port
    pub fn backend_host(&self) -> anyhow::Result<String> {
        let authority: Authority = self.hostname.parse().map_err(|e| {
            anyhow::anyhow!("could not parse inventory hostname {}: {}", self.hostname, e)
        })?;
        Ok(authority.host().to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            wait_min: Duration::from_millis(self.retry_wait_min_ms),
            wait_max: Duration::from_millis(self.retry_wait_max_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Overlay listener settings
#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    /// Name of the primary endpoint (default: hostname reported by the inventory)
    pub hostname: Option<String>,

    /// Local address endpoints bind on (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Domain appended to endpoint names to form their FQDN
    #[serde(default)]
    pub domain: String,

    /// Port for names without an entry in `ports` (default: 0, any free port)
    #[serde(default)]
    pub default_port: u16,

    /// Fixed ports per exposed name
    #[serde(default)]
    pub ports: HashMap<String, u16>,

    /// Terminate TLS on endpoints (default: true)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format). Self-signed when unset.
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            bind: default_bind_address(),
            domain: String::new(),
            default_port: 0,
            ports: HashMap::new(),
            tls: true,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Max time to wait for a backend response in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    /// Seconds between inventory polls (default: 10)
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_inventory_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_api_path() -> String {
    "/api/v2.0".to_string()
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_wait_min() -> u64 {
    1000
}

fn default_retry_wait_max() -> u64 {
    30_000
}

fn default_inventory_timeout() -> u64 {
    30
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_poll_interval() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: file (if any), then CLI/env overrides
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path).map_err(|e| {
                anyhow::anyhow!("Failed to load configuration {}: {}", path.display(), e)
            })?,
            None => Self::default(),
        };
        config.apply_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(key) = &cli.truenas_api_key {
            self.inventory.api_key = Some(key.clone());
        }
        if let Some(hostname) = &cli.truenas_hostname {
            self.inventory.hostname = hostname.clone();
        }
        if let Some(hostname) = &cli.hostname {
            self.overlay.hostname = Some(hostname.clone());
        }
        if let Some(interval) = cli.poll_interval_secs {
            self.poller.interval_secs = interval;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.poller.interval_secs == 0 {
            errors.push("poller.interval_secs must be greater than 0".to_string());
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }
        if self.inventory.request_timeout_secs == 0 {
            errors.push("inventory.request_timeout_secs must be greater than 0".to_string());
        }
        if self.inventory.retry_wait_min_ms > self.inventory.retry_wait_max_ms {
            errors.push(
                "inventory.retry_wait_min_ms must not exceed retry_wait_max_ms".to_string(),
            );
        }
        if let Err(e) = self.inventory.web_target() {
            errors.push(e.to_string());
        }
        if self.overlay.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("overlay.bind '{}' is not an IP address", self.overlay.bind));
        }
        if self.overlay.tls_cert.is_some() != self.overlay.tls_key.is_some() {
            errors.push("overlay.tls_cert and overlay.tls_key must be set together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
