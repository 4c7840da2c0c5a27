//! Shared HTTP client that endpoints use to reach their backends.
//!
//! Every endpoint forwards through the same pooled client, so keep-alive
//! connections to a backend survive target swaps that land on the same
//! address.

use crate::endpoint::Target;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, InvalidHeaderValue, HOST};
use hyper::{Request, Response, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Why a request could not be relayed to its backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("backend unreachable: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("cannot address backend: {0}")]
    Uri(#[from] hyper::http::Error),
    #[error("cannot set host header: {0}")]
    Host(#[from] InvalidHeaderValue),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections kept per backend
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend client ready"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Relay `req` to `target` and hand back the backend's response as is.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        target: &Target,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let response = self.client.request(retarget(req, target)?).await?;
        Ok(response.map(BodyExt::boxed))
    }
}

/// Point a client request at `target`.
///
/// Method, path, query, headers and body are kept. The URI gains the
/// target's scheme and authority, and `Host` names the target.
pub fn retarget<B>(req: Request<B>, target: &Target) -> Result<Request<B>, ForwardError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = target.uri_for(path_and_query)?;
    // Backends are always spoken to over HTTP/1.1, whatever the client used
    parts.version = Version::HTTP_11;
    parts.headers.insert(HOST, HeaderValue::from_str(target.host())?);

    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    #[test]
    fn test_retarget_keeps_request() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("https://minio.tail.example/bucket/key?versionId=3")
            .version(Version::HTTP_2)
            .header(HOST, "minio.tail.example")
            .header("x-amz-meta", "kept")
            .body("payload")
            .unwrap();
        let target = Target::from_host_port("10.0.0.2", 9002).unwrap();

        let req = retarget(req, &target).unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "http://10.0.0.2:9002/bucket/key?versionId=3");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers()[HOST], "10.0.0.2:9002");
        assert_eq!(req.headers()["x-amz-meta"], "kept");
        assert_eq!(*req.body(), "payload");
    }

    #[test]
    fn test_retarget_origin_form() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let target: Target = "http://nas.local".parse().unwrap();

        let req = retarget(req, &target).unwrap();
        assert_eq!(req.uri(), "http://nas.local/");
        assert_eq!(req.headers()[HOST], "nas.local");
    }

    #[test]
    fn test_pool_config() {
        let defaults = PoolConfig::default();
        assert_eq!(defaults.max_idle_per_host, 10);
        assert_eq!(defaults.idle_timeout, Duration::from_secs(90));

        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 2,
            idle_timeout: Duration::from_secs(5),
        });
        assert_eq!(pool.config().max_idle_per_host, 2);
    }
}
