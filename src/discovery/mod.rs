//! Proxy discovery: find which advertised address reaches the proxy, and
//! prove it is the proxy we were told about before using it.

pub mod certificate;
pub mod http;
pub mod setup_uri;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use certificate::ProxyCertificate;
pub use setup_uri::{parse_setup_uri, ProxyInfo};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("invalid setup link: {0}")]
    InvalidSetupUri(String),

    #[error("timed out waiting for the proxy")]
    Timeout,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("proxy unreachable: {0}")]
    Unreachable(String),

    #[error("proxy answered with HTTP {status}")]
    BadResponse { status: u16 },

    #[error("invalid proxy certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate fingerprint mismatch: expected {expected}, got {found}")]
    CertificateMismatch { expected: String, found: String },

    #[error("no proxy addresses to try")]
    NoCandidates,
}

impl DiscoveryError {
    #[must_use]
    pub fn is_certificate_mismatch(&self) -> bool {
        matches!(self, DiscoveryError::CertificateMismatch { .. })
    }
}

/// A proxy whose certificate matched the pinned fingerprint.
///
/// Only [`discover`] and [`ValidatedProxy::restore`] produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedProxy {
    addr: SocketAddr,
    certificate: ProxyCertificate,
}

/// Serialized form of a [`ValidatedProxy`], as stored or handed across FFI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProxy {
    pub ip: IpAddr,
    pub port: u16,
    pub certificate: String,
}

impl ValidatedProxy {
    /// Rebuild a proxy validated earlier, checking its PEM against the pin
    /// from the setup link it was discovered with. No network access.
    pub fn restore(stored: &StoredProxy, info: &ProxyInfo) -> Result<Self, DiscoveryError> {
        let expected = info.cert_fingerprint.as_str();
        let certificate = ProxyCertificate::from_pem(&stored.certificate)?;
        if certificate.fingerprint() != expected {
            return Err(DiscoveryError::CertificateMismatch {
                expected: expected.to_string(),
                found: certificate.fingerprint().to_string(),
            });
        }
        Ok(ValidatedProxy {
            addr: SocketAddr::new(stored.ip, stored.port),
            certificate,
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn certificate(&self) -> &ProxyCertificate {
        &self.certificate
    }

    #[must_use]
    pub fn to_stored(&self) -> StoredProxy {
        StoredProxy {
            ip: self.addr.ip(),
            port: self.addr.port(),
            certificate: self.certificate.pem().to_string(),
        }
    }
}

impl StoredProxy {
    /// Candidate description that re-probes this proxy under its own pin.
    pub fn to_proxy_info(&self) -> Result<ProxyInfo, DiscoveryError> {
        let certificate = ProxyCertificate::from_pem(&self.certificate)?;
        Ok(ProxyInfo {
            addresses: vec![self.ip.to_string()],
            port: self.port,
            local_tunnel_port: None,
            cert_fingerprint: certificate.fingerprint().to_string(),
        })
    }
}

/// Find and validate the proxy described by `info`.
pub async fn discover(info: &ProxyInfo) -> Result<ValidatedProxy, DiscoveryError> {
    discover_with_timeout(info, http::PROBE_TIMEOUT).await
}

pub async fn discover_with_timeout(
    info: &ProxyInfo,
    timeout: Duration,
) -> Result<ValidatedProxy, DiscoveryError> {
    let expected: Arc<str> = Arc::from(info.cert_fingerprint.as_str());
    let port = info.port;

    let raced = race_first_success(info.addresses.clone(), |address| {
        validate(address, port, Arc::clone(&expected), timeout)
    })
    .await;

    let result = match raced {
        Ok(proxy) => Ok(proxy),
        Err(err) => match info.local_tunnel_port {
            Some(tunnel_port) => {
                info!(port = tunnel_port, error = %err, "proxy_trying_local_tunnel");
                validate(
                    Ipv4Addr::LOCALHOST.to_string(),
                    tunnel_port,
                    expected,
                    timeout,
                )
                .await
                .map_err(|fallback| prefer_mismatch(Some(err), fallback))
            }
            None => Err(err),
        },
    };

    match &result {
        Ok(proxy) => info!(
            proxy = %proxy.addr(),
            subject = proxy.certificate().subject(),
            "proxy_validated"
        ),
        Err(e) => warn!(error = %e, "proxy_discovery_failed"),
    }
    result
}

/// Run `probe` for every candidate concurrently. The first success wins and
/// every other attempt is aborted and reaped before returning.
pub async fn race_first_success<C, T, F, Fut>(
    candidates: Vec<C>,
    probe: F,
) -> Result<T, DiscoveryError>
where
    C: Send + 'static,
    T: Send + 'static,
    F: Fn(C) -> Fut,
    Fut: Future<Output = Result<T, DiscoveryError>> + Send + 'static,
{
    if candidates.is_empty() {
        return Err(DiscoveryError::NoCandidates);
    }

    let mut attempts = JoinSet::new();
    for candidate in candidates {
        attempts.spawn(probe(candidate));
    }

    let mut failure = None;
    while let Some(joined) = attempts.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(DiscoveryError::Unreachable(format!("probe task failed: {e}"))),
        };
        match outcome {
            Ok(winner) => {
                attempts.abort_all();
                while attempts.join_next().await.is_some() {}
                return Ok(winner);
            }
            Err(e) => failure = Some(prefer_mismatch(failure, e)),
        }
    }
    Err(failure.unwrap_or(DiscoveryError::NoCandidates))
}

/// A fingerprint mismatch is never hidden behind a later network error.
fn prefer_mismatch(previous: Option<DiscoveryError>, next: DiscoveryError) -> DiscoveryError {
    match previous {
        Some(prev) if prev.is_certificate_mismatch() && !next.is_certificate_mismatch() => prev,
        _ => next,
    }
}

async fn validate(
    address: String,
    port: u16,
    expected: Arc<str>,
    timeout: Duration,
) -> Result<ValidatedProxy, DiscoveryError> {
    let addr = resolve(&address, port, timeout).await?;
    debug!(proxy = %addr, "proxy_probe_started");

    let client = http::client_via(addr, timeout)?;
    let pem = match http::fetch_certificate(&client).await {
        Ok(pem) => pem,
        Err(e) => {
            debug!(proxy = %addr, error = %e, "proxy_probe_failed");
            return Err(e);
        }
    };
    let certificate = ProxyCertificate::from_pem(&pem)?;
    if certificate.fingerprint() != &*expected {
        warn!(
            proxy = %addr,
            expected = &*expected,
            found = certificate.fingerprint(),
            "proxy_certificate_mismatch"
        );
        return Err(DiscoveryError::CertificateMismatch {
            expected: expected.to_string(),
            found: certificate.fingerprint().to_string(),
        });
    }
    Ok(ValidatedProxy { addr, certificate })
}

async fn resolve(address: &str, port: u16, timeout: Duration) -> Result<SocketAddr, DiscoveryError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut found = tokio::time::timeout(timeout, tokio::net::lookup_host((address, port)))
        .await
        .map_err(|_| DiscoveryError::Timeout)?
        .map_err(|e| DiscoveryError::Unreachable(format!("{address}: {e}")))?;
    found
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| DiscoveryError::Unreachable(format!("{address}: no IPv4 address")))
}

#[cfg(test)]
mod tests {
    use super::certificate::fixtures::{TEST_CA_FINGERPRINT, TEST_CA_PEM};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves the discovery endpoints the way the proxy does when used as an
    /// HTTP proxy: requests arrive in absolute form.
    async fn fake_proxy(config_status: u16, pem: String) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let pem = pem.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&request);
                    let (status, body) = if request.starts_with(&format!("GET {}", http::CONFIG_URL)) {
                        if config_status == 200 {
                            (200, serde_json::json!({ "certificate": pem }).to_string())
                        } else {
                            (config_status, String::new())
                        }
                    } else if request.starts_with(&format!("GET {}", http::CERTIFICATE_URL)) {
                        (200, pem)
                    } else {
                        (404, String::new())
                    };
                    let response = format!(
                        "HTTP/1.1 {status} Status\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn info(addresses: &[&str], port: u16, fallback: Option<u16>, fingerprint: &str) -> ProxyInfo {
        ProxyInfo {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            port,
            local_tunnel_port: fallback,
            cert_fingerprint: fingerprint.to_string(),
        }
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_race_returns_winner_and_cancels_the_rest() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped);
        let result = race_first_success(vec![0u32, 1, 2], move |candidate| {
            let guard = DropCounter(Arc::clone(&counter));
            async move {
                let _guard = guard;
                match candidate {
                    0 => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(DiscoveryError::Timeout)
                    }
                    1 => {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(candidate)
                    }
                    _ => std::future::pending().await,
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
        // Every attempt, including the one that would never finish, is gone.
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mismatch_outranks_later_failures() {
        let result: Result<(), _> = race_first_success(vec![0u64, 40], |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if delay == 0 {
                Err(DiscoveryError::CertificateMismatch {
                    expected: "F".into(),
                    found: "G".into(),
                })
            } else {
                Err(DiscoveryError::Timeout)
            }
        })
        .await;
        assert!(result.expect_err("all fail").is_certificate_mismatch());
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let result: Result<(), _> =
            race_first_success(Vec::<u8>::new(), |_| async { Ok(()) }).await;
        assert_eq!(result, Err(DiscoveryError::NoCandidates));
    }

    #[tokio::test]
    async fn test_discovers_proxy_with_matching_certificate() {
        let proxy = fake_proxy(200, TEST_CA_PEM.to_string()).await;
        let dead = closed_port().await;

        let result = discover(&info(&["127.0.0.1"], proxy.port(), None, TEST_CA_FINGERPRINT))
            .await
            .expect("discover");
        assert_eq!(result.addr(), proxy);
        assert_eq!(result.certificate().fingerprint(), TEST_CA_FINGERPRINT);

        let refused = discover(&info(&["127.0.0.1"], dead, None, TEST_CA_FINGERPRINT)).await;
        assert!(
            matches!(
                refused,
                Err(DiscoveryError::ConnectionRefused | DiscoveryError::Unreachable(_))
            ),
            "{refused:?}"
        );
    }

    #[tokio::test]
    async fn test_matching_candidate_wins_over_refused_one() {
        let proxy = fake_proxy(200, TEST_CA_PEM.to_string()).await;
        // Nothing listens on 127.0.0.2 at this port.
        let result = discover_with_timeout(
            &info(&["127.0.0.2", "127.0.0.1"], proxy.port(), None, TEST_CA_FINGERPRINT),
            Duration::from_millis(500),
        )
        .await
        .expect("discover");
        assert_eq!(result.addr(), proxy);
    }

    #[tokio::test]
    async fn test_mismatch_reported_when_other_candidate_times_out() {
        let other = rcgen::generate_simple_self_signed(vec!["mitm.test".to_string()])
            .expect("generate");
        let mitm = fake_proxy(200, other.cert.pem()).await;
        // Accepts connections through the backlog but never answers.
        let _silent = TcpListener::bind(("127.0.0.2", mitm.port()))
            .await
            .expect("bind silent candidate");

        let result = discover_with_timeout(
            &info(&["127.0.0.1", "127.0.0.2"], mitm.port(), None, TEST_CA_FINGERPRINT),
            Duration::from_millis(300),
        )
        .await;
        match result {
            Err(DiscoveryError::CertificateMismatch { expected, .. }) => {
                assert_eq!(expected, TEST_CA_FINGERPRINT);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_certificate_is_never_returned() {
        let other = rcgen::generate_simple_self_signed(vec!["mitm.test".to_string()])
            .expect("generate");
        let proxy = fake_proxy(200, other.cert.pem()).await;
        let result = discover(&info(&["127.0.0.1"], proxy.port(), None, TEST_CA_FINGERPRINT)).await;
        match result {
            Err(DiscoveryError::CertificateMismatch { expected, found }) => {
                assert_eq!(expected, TEST_CA_FINGERPRINT);
                assert_ne!(found, TEST_CA_FINGERPRINT);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_local_tunnel_port() {
        let proxy = fake_proxy(200, TEST_CA_PEM.to_string()).await;
        let dead = closed_port().await;
        let result = discover(&info(
            &["127.0.0.1"],
            dead,
            Some(proxy.port()),
            TEST_CA_FINGERPRINT,
        ))
        .await
        .expect("fallback");
        assert_eq!(result.addr(), SocketAddr::from((Ipv4Addr::LOCALHOST, proxy.port())));
    }

    #[tokio::test]
    async fn test_certificate_endpoint_used_when_config_missing() {
        let proxy = fake_proxy(404, TEST_CA_PEM.to_string()).await;
        let result = discover(&info(&["127.0.0.1"], proxy.port(), None, TEST_CA_FINGERPRINT))
            .await
            .expect("discover via certificate endpoint");
        assert_eq!(result.certificate().subject(), "CN=Tunsnare Test CA");
    }

    #[test]
    fn test_restore_checks_the_pin() {
        let stored = StoredProxy {
            ip: "192.168.1.10".parse().expect("ip"),
            port: 8000,
            certificate: TEST_CA_PEM.to_string(),
        };
        let link = info(&["192.168.1.10"], 8000, None, TEST_CA_FINGERPRINT);
        let proxy = ValidatedProxy::restore(&stored, &link).expect("restore");
        assert_eq!(proxy.to_stored(), stored);
        assert_eq!(
            stored.to_proxy_info().expect("info").cert_fingerprint,
            TEST_CA_FINGERPRINT
        );

        // A stored proxy only vouches for itself; the pin comes from the link.
        let other_link = info(&["192.168.1.10"], 8000, None, "AAAA");
        assert!(ValidatedProxy::restore(&stored, &other_link)
            .expect_err("wrong pin")
            .is_certificate_mismatch());
    }
}
