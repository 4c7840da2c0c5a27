//! A single exposed proxy endpoint.
//!
//! Each endpoint owns one overlay listener and one accept loop task. Every
//! accepted connection is served on its own task and forwards requests to the
//! endpoint's current target. The target can be swapped while requests are
//! in flight; readers take a snapshot of the whole value, never a partial one.

use crate::error::{EndpointError, ProxyErrorCode, TargetError};
use crate::overlay::{Overlay, OverlayListener};
use crate::pool::{ConnectionPool, ForwardError};
use crate::redirect::rewrite_redirect;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::http::uri::{Authority, Scheme};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Where an endpoint forwards its traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    authority: Authority,
}

impl Target {
    /// Build an `http://host:port` target
    pub fn from_host_port(host: &str, port: u16) -> Result<Self, TargetError> {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        format!("http://{}:{}", host, port).parse()
    }

    /// `host[:port]` as it appears in URLs and Host headers
    pub fn host(&self) -> &str {
        self.authority.as_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.authority.port_u16()
    }

    /// URI for `path_and_query` on this target
    pub fn uri_for(&self, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let error = |reason: &str| TargetError {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = value
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| error(&e.to_string()))?;
        let parts = uri.into_parts();
        let scheme = parts.scheme.ok_or_else(|| error("missing scheme"))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(error("scheme must be http or https"));
        }
        let authority = parts.authority.ok_or_else(|| error("missing host"))?;
        if let Some(pq) = parts.path_and_query {
            if pq.as_str() != "/" && !pq.as_str().is_empty() {
                return Err(error("target must not carry a path"));
            }
        }

        Ok(Self { scheme, authority })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// State shared between an endpoint handle and its connection tasks
struct Forwarder {
    name: String,
    fqdn: String,
    /// Authority that replaces the backend's in rewritten redirects
    public_host: String,
    target: RwLock<Arc<Target>>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl Forwarder {
    fn current_target(&self) -> Arc<Target> {
        self.target.read().clone()
    }

    async fn forward(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let target = self.current_target();
        debug!(
            endpoint = %self.name,
            method = %req.method(),
            uri = %req.uri(),
            target = %target,
            "Forwarding request"
        );

        let sent = self.pool.send_request(req, &target);
        match tokio::time::timeout(self.request_timeout, sent).await {
            Ok(Ok(mut response)) => {
                rewrite_redirect(&mut response, target.host(), &self.public_host);
                response
            }
            Ok(Err(ForwardError::Connect(e))) => {
                warn!(
                    endpoint = %self.name,
                    target = %target,
                    error = %e,
                    "Failed to forward request"
                );
                ProxyErrorCode::ConnectionFailed.into_response("Failed to connect to backend")
            }
            Ok(Err(e)) => {
                error!(
                    endpoint = %self.name,
                    target = %target,
                    error = %e,
                    "Failed to build backend request"
                );
                ProxyErrorCode::InternalError.into_response("Failed to build backend request")
            }
            Err(_) => {
                warn!(
                    endpoint = %self.name,
                    target = %target,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                ProxyErrorCode::RequestTimeout.into_response(format!(
                    "Request timed out after {:?}",
                    self.request_timeout
                ))
            }
        }
    }
}

/// Handle to a running endpoint. Dropping it closes the endpoint.
pub struct ProxyEndpoint {
    forwarder: Arc<Forwarder>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    /// Sender side lives in the accept loop; it closes when the loop exits
    stopped_rx: watch::Receiver<()>,
}

impl ProxyEndpoint {
    /// Bind `name` on the overlay and start serving it, forwarding to `target`.
    pub async fn create<O: Overlay>(
        name: &str,
        target: Target,
        overlay: &O,
        pool: Arc<ConnectionPool>,
        request_timeout: Duration,
    ) -> Result<Self, EndpointError> {
        let OverlayListener {
            listener,
            tls,
            fqdn,
            public_host,
        } = overlay.listen(name).await?;
        let local_addr = listener.local_addr().map_err(EndpointError::LocalAddr)?;

        let forwarder = Arc::new(Forwarder {
            name: name.to_string(),
            fqdn,
            public_host,
            target: RwLock::new(Arc::new(target)),
            pool,
            request_timeout,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(());

        tokio::spawn(accept_loop(
            listener,
            tls,
            Arc::clone(&forwarder),
            shutdown_rx,
            stopped_tx,
        ));

        Ok(Self {
            forwarder,
            local_addr,
            shutdown_tx,
            stopped_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.forwarder.name
    }

    /// Fully qualified name clients reach this endpoint by
    pub fn fqdn(&self) -> &str {
        &self.forwarder.fqdn
    }

    /// `fqdn[:port]` clients reach this endpoint at
    pub fn public_host(&self) -> &str {
        &self.forwarder.public_host
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> Arc<Target> {
        self.forwarder.current_target()
    }

    /// Replace the forwarding target. In-flight requests keep the target they
    /// started with.
    pub fn set_target(&self, target: Target) {
        *self.forwarder.target.write() = Arc::new(target);
    }

    /// Forward one request to the current target
    pub async fn serve(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.forwarder.forward(req).await
    }

    /// Stop accepting connections and release the listener. Idempotent.
    pub fn close(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!(endpoint = %self.forwarder.name, "Closing endpoint");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// True once the accept loop has exited and the listener is gone
    pub fn is_stopped(&self) -> bool {
        self.stopped_rx.has_changed().is_err()
    }

    /// Resolves once the accept loop has exited, whether closed or failed
    pub async fn stopped(&self) {
        let mut rx = self.stopped_rx.clone();
        while rx.changed().await.is_ok() {}
    }

    /// Close and wait for the accept loop to release the listener
    pub async fn shutdown(&self) {
        self.close();
        self.stopped().await;
    }
}

impl Drop for ProxyEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("name", &self.forwarder.name)
            .field("fqdn", &self.forwarder.fqdn)
            .field("local_addr", &self.local_addr)
            .field("target", &self.target())
            .finish()
    }
}

/// Pause after an accept error that is not tied to one connection
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept errors that concern a single connection rather than the listener
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    forwarder: Arc<Forwarder>,
    mut shutdown_rx: watch::Receiver<bool>,
    _stopped_tx: watch::Sender<()>,
) {
    let protocol = if tls.is_some() { "HTTPS" } else { "HTTP" };
    info!(
        endpoint = %forwarder.name,
        fqdn = %forwarder.fqdn,
        addr = ?listener.local_addr().ok(),
        protocol,
        "Endpoint listening"
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            tls.clone(),
                            Arc::clone(&forwarder),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) if is_connection_error(&e) => {
                        debug!(
                            endpoint = %forwarder.name,
                            error = %e,
                            "Failed to accept connection"
                        );
                    }
                    Err(e) => {
                        // Typically fd exhaustion; give it time to clear
                        error!(
                            endpoint = %forwarder.name,
                            error = %e,
                            "Failed to accept connection"
                        );
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Release the port before `_stopped_tx` is dropped and waiters wake up
    drop(listener);
    info!(endpoint = %forwarder.name, "Endpoint stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    forwarder: Arc<Forwarder>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let Some(acceptor) = tls else {
        if let Err(e) = serve_connection(stream, forwarder, shutdown_rx).await {
            debug!(addr = %addr, error = %e, "Connection error");
        }
        return;
    };

    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            if let Err(e) = serve_connection(tls_stream, forwarder, shutdown_rx).await {
                debug!(addr = %addr, error = %e, "TLS connection error");
            }
        }
        Err(e) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
    }
}

/// Resolves once the endpoint is closed or its handle is gone
async fn wait_closed(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    forwarder: Arc<Forwarder>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = Arc::clone(&forwarder);
        async move { Ok::<_, hyper::Error>(forwarder.forward(req).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = wait_closed(&mut shutdown_rx) => {
            debug!("Dropping connection, endpoint closed");
        }
    }

    Ok(())
}
