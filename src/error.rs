//! Error types and JSON error responses for proxy endpoints

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;

/// Header naming the proxy failure on error responses
pub const PROXY_ERROR_HEADER: HeaderName = HeaderName::from_static("x-proxy-error");

/// Errors talking to the inventory service
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("api key not set")]
    MissingApiKey,
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("unexpected content-type {0:?}")]
    ContentType(String),
    #[error("failed to decode {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Errors raised by an overlay network provider
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("failed to bind {addr} for {hostname}: {source}")]
    Bind {
        hostname: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("getting fqdn for {hostname}: {reason}")]
    Identity { hostname: String, reason: String },
    #[error("tls setup for {hostname}: {reason}")]
    Tls { hostname: String, reason: String },
}

/// Errors creating a proxy endpoint
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// A backend target that cannot be expressed as a URI
#[derive(Debug, thiserror::Error)]
#[error("invalid target {value:?}: {reason}")]
pub struct TargetError {
    pub value: String,
    pub reason: String,
}

/// Failure reported to a client in place of a backend response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend did not answer within the request timeout
    RequestTimeout,
    ConnectionFailed,
    /// The request could not be addressed to the backend
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(self) -> StatusCode {
        match self {
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `X-Proxy-Error` header
    pub fn as_header_value(self) -> &'static str {
        match self {
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// JSON response `{"code", "message", "status"}` tagged with
    /// `X-Proxy-Error`
    pub fn into_response(
        self,
        message: impl Into<String>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self,
            "message": message.into(),
            "status": status.as_u16(),
        })
        .to_string();

        let body = Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed();
        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(PROXY_ERROR_HEADER, HeaderValue::from_static(self.as_header_value()));
        response
    }
}
