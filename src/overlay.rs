//! Overlay network provider.
//!
//! An overlay hands out listeners bound to a name on the private network and
//! knows the fully qualified name that clients use to reach it. Proxy
//! endpoints own what `listen` returns; dropping it releases the name.
//!
//! `LocalOverlay` is the bundled provider: it binds on a local address, one
//! port per exposed name, and terminates TLS with either configured PEM files
//! or a self-signed certificate issued for the endpoint's FQDN.

use crate::config::OverlayConfig;
use crate::error::OverlayError;
use anyhow::Context;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// A listener bound to one exposed name
pub struct OverlayListener {
    pub listener: TcpListener,
    /// Present when connections must be TLS terminated
    pub tls: Option<TlsAcceptor>,
    /// Name clients use to reach this listener
    pub fqdn: String,
    /// `fqdn[:port]` as clients put it in URLs. The port is omitted only
    /// when it is the default for the listener's scheme.
    pub public_host: String,
}

pub trait Overlay: Send + Sync + 'static {
    /// Bind a listener for `hostname` and resolve its fully qualified name.
    fn listen(
        &self,
        hostname: &str,
    ) -> impl Future<Output = Result<OverlayListener, OverlayError>> + Send;
}

type CertChain = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

pub struct LocalOverlay {
    config: OverlayConfig,
    bind_ip: IpAddr,
    certificate: Option<CertChain>,
}

impl LocalOverlay {
    pub fn new(config: OverlayConfig) -> anyhow::Result<Self> {
        let bind_ip: IpAddr = config
            .bind
            .parse()
            .with_context(|| format!("invalid overlay bind address '{}'", config.bind))?;

        let certificate = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some(load_pem_identity(cert, key)?),
            _ => None,
        };

        Ok(Self {
            config,
            bind_ip,
            certificate,
        })
    }

    pub fn resolve_fqdn(&self, hostname: &str) -> Result<String, OverlayError> {
        validate_label(hostname).map_err(|reason| OverlayError::Identity {
            hostname: hostname.to_string(),
            reason,
        })?;

        let hostname = hostname.to_ascii_lowercase();
        let domain = self.config.domain.trim_matches('.');
        if domain.is_empty() {
            Ok(hostname)
        } else {
            Ok(format!("{}.{}", hostname, domain.to_ascii_lowercase()))
        }
    }

    fn tls_acceptor(&self, hostname: &str, fqdn: &str) -> Result<TlsAcceptor, OverlayError> {
        let tls_error = |reason: String| OverlayError::Tls {
            hostname: hostname.to_string(),
            reason,
        };

        let (certs, key) = match &self.certificate {
            Some((certs, key)) => (certs.clone(), key.clone_key()),
            None => self_signed_identity(vec![fqdn.to_string(), hostname.to_string()])
                .map_err(|e| tls_error(e.to_string()))?,
        };

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error(e.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl Overlay for LocalOverlay {
    async fn listen(&self, hostname: &str) -> Result<OverlayListener, OverlayError> {
        let port = self
            .config
            .ports
            .get(hostname)
            .copied()
            .unwrap_or(self.config.default_port);
        let addr = SocketAddr::new(self.bind_ip, port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| OverlayError::Bind {
                hostname: hostname.to_string(),
                addr,
                source,
            })?;

        // On failure below the listener is dropped with this frame.
        let fqdn = self.resolve_fqdn(hostname)?;
        let tls = if self.config.tls {
            Some(self.tls_acceptor(hostname, &fqdn)?)
        } else {
            None
        };

        let bound = listener.local_addr().map_err(|source| OverlayError::Bind {
            hostname: hostname.to_string(),
            addr,
            source,
        })?;
        let public_host = public_authority(&fqdn, bound.port(), tls.is_some());

        debug!(
            hostname,
            public_host = %public_host,
            addr = %bound,
            tls = tls.is_some(),
            "Overlay listener bound"
        );

        Ok(OverlayListener {
            listener,
            tls,
            fqdn,
            public_host,
        })
    }
}

fn public_authority(fqdn: &str, port: u16, tls: bool) -> String {
    let default_port = if tls { 443 } else { 80 };
    if port == default_port {
        fqdn.to_string()
    } else {
        format!("{}:{}", fqdn, port)
    }
}

fn validate_label(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("empty hostname".to_string());
    }
    if hostname.len() > MAX_LABEL_LEN {
        return Err(format!("hostname longer than {} characters", MAX_LABEL_LEN));
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err("hostname must contain only letters, digits and '-'".to_string());
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err("hostname must not start or end with '-'".to_string());
    }
    Ok(())
}

/// Certificate chain and key from PEM files
fn load_pem_identity(cert_path: &str, key_path: &str) -> anyhow::Result<CertChain> {
    let mut reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("opening certificate {}", cert_path))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {}", cert_path))?;
    if certs.is_empty() {
        anyhow::bail!("{} holds no certificate", cert_path);
    }

    let mut reader =
        BufReader::new(File::open(key_path).with_context(|| format!("opening key {}", key_path))?);
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("reading private key from {}", key_path))?
        .ok_or_else(|| anyhow::anyhow!("{} holds no private key", key_path))?;

    Ok((certs, key))
}

/// Self-signed certificate valid for every name in `names`
fn self_signed_identity(names: Vec<String>) -> anyhow::Result<CertChain> {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names).context("generating self-signed certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overlay(domain: &str, tls: bool) -> LocalOverlay {
        LocalOverlay::new(OverlayConfig {
            hostname: None,
            bind: "127.0.0.1".to_string(),
            domain: domain.to_string(),
            default_port: 0,
            ports: HashMap::new(),
            tls,
            tls_cert: None,
            tls_key: None,
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_fqdn() {
        assert_eq!(
            overlay("tail1234.ts.net", false).resolve_fqdn("Minio").unwrap(),
            "minio.tail1234.ts.net"
        );
        assert_eq!(overlay("", false).resolve_fqdn("minio").unwrap(), "minio");
        assert_eq!(
            overlay(".lan.", false).resolve_fqdn("minio").unwrap(),
            "minio.lan"
        );
    }

    #[test]
    fn test_resolve_fqdn_rejects_invalid_names() {
        let overlay = overlay("lan", false);
        for name in ["", "-minio", "minio-", "my app", "a.b", &"x".repeat(64)] {
            assert!(
                matches!(overlay.resolve_fqdn(name), Err(OverlayError::Identity { .. })),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_invalid_bind_address() {
        let config = OverlayConfig {
            bind: "not-an-ip".to_string(),
            ..OverlayConfig::default()
        };
        assert!(LocalOverlay::new(config).is_err());
    }

    #[tokio::test]
    async fn test_listen_plain() {
        let overlay = overlay("lan", false);
        let bound = overlay.listen("minio").await.unwrap();
        assert_eq!(bound.fqdn, "minio.lan");
        assert!(bound.tls.is_none());

        let port = bound.listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(bound.public_host, format!("minio.lan:{}", port));
    }

    #[test]
    fn test_public_host_omits_default_port() {
        assert_eq!(public_authority("minio.lan", 443, true), "minio.lan");
        assert_eq!(public_authority("minio.lan", 80, false), "minio.lan");
        assert_eq!(public_authority("minio.lan", 80, true), "minio.lan:80");
        assert_eq!(public_authority("minio.lan", 443, false), "minio.lan:443");
        assert_eq!(public_authority("minio.lan", 8443, true), "minio.lan:8443");
    }

    #[tokio::test]
    async fn test_listen_tls_self_signed() {
        let overlay = overlay("lan", true);
        let bound = overlay.listen("minio").await.unwrap();
        assert!(bound.tls.is_some());
    }

    #[tokio::test]
    async fn test_listen_fails_on_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut ports = HashMap::new();
        ports.insert("minio".to_string(), port);
        let overlay = LocalOverlay::new(OverlayConfig {
            bind: "127.0.0.1".to_string(),
            ports,
            tls: false,
            ..OverlayConfig::default()
        })
        .unwrap();

        assert!(matches!(
            overlay.listen("minio").await,
            Err(OverlayError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_listen_identity_failure_releases_port() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut ports = HashMap::new();
        ports.insert("bad name".to_string(), port);
        let overlay = LocalOverlay::new(OverlayConfig {
            bind: "127.0.0.1".to_string(),
            ports,
            tls: false,
            ..OverlayConfig::default()
        })
        .unwrap();

        assert!(matches!(
            overlay.listen("bad name").await,
            Err(OverlayError::Identity { .. })
        ));
        // The port must be free again
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_with_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["minio.lan".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let overlay = LocalOverlay::new(OverlayConfig {
            bind: "127.0.0.1".to_string(),
            domain: "lan".to_string(),
            tls_cert: Some(cert_path.to_string_lossy().into_owned()),
            tls_key: Some(key_path.to_string_lossy().into_owned()),
            ..OverlayConfig::default()
        })
        .unwrap();

        let bound = overlay.listen("minio").await.unwrap();
        assert!(bound.tls.is_some());
    }

    #[test]
    fn test_pem_files_without_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let result = LocalOverlay::new(OverlayConfig {
            bind: "127.0.0.1".to_string(),
            tls_cert: Some(cert_path.to_string_lossy().into_owned()),
            tls_key: Some(key_path.to_string_lossy().into_owned()),
            ..OverlayConfig::default()
        });
        assert!(result.is_err());
    }
}
