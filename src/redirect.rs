//! Fix redirects that leak a backend's own address.
//!
//! Backends frequently answer a `302 Found` with a `Location` built from the
//! host header they received, which after proxying is the backend address
//! rather than the name the client used. Such locations are rewritten to the
//! public name of the endpoint.

use hyper::header::{HeaderValue, LOCATION};
use hyper::{Response, StatusCode};
use tracing::debug;

/// Replace the first occurrence of `backend_host` in a 302 `Location` header
/// with `public_host`. Any other response is left untouched.
pub fn rewrite_redirect<B>(response: &mut Response<B>, backend_host: &str, public_host: &str) {
    if response.status() != StatusCode::FOUND || backend_host.is_empty() {
        return;
    }

    let Some(location) = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
    else {
        return;
    };

    if location.is_empty() || !location.contains(backend_host) {
        return;
    }

    let rewritten = location.replacen(backend_host, public_host, 1);
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        debug!(from = location, to = %rewritten, "Rewriting redirect location");
        response.headers_mut().insert(LOCATION, value);
    }
}
