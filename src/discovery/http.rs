//! Certificate fetch through a candidate proxy.

use std::error::Error as _;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{redirect, Client, Proxy, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::DiscoveryError;

/// Only answered by the proxy itself; the host never resolves upstream.
pub const CONFIG_URL: &str = "http://android.httptoolkit.tech/config";
/// Older proxies serve the bare PEM here instead.
pub const CERTIFICATE_URL: &str = "http://amiusing.httptoolkit.tech/certificate";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ReceivedConfig {
    certificate: String,
}

/// A client that sends every request through `proxy` as an HTTP proxy.
pub fn client_via(proxy: SocketAddr, timeout: Duration) -> Result<Client, DiscoveryError> {
    let proxy = Proxy::http(format!("http://{proxy}"))
        .map_err(|e| DiscoveryError::Unreachable(format!("proxy address {proxy}: {e}")))?;
    Client::builder()
        .no_proxy()
        .proxy(proxy)
        .connect_timeout(timeout)
        .timeout(timeout)
        .redirect(redirect::Policy::none())
        .build()
        .map_err(|e| DiscoveryError::Unreachable(format!("http client: {e}")))
}

/// Fetch the proxy's CA certificate as PEM.
pub async fn fetch_certificate(client: &Client) -> Result<String, DiscoveryError> {
    match get_text(client, CONFIG_URL).await {
        Ok(body) => {
            let config: ReceivedConfig = serde_json::from_str(&body).map_err(|e| {
                DiscoveryError::InvalidCertificate(format!("config response: {e}"))
            })?;
            Ok(config.certificate)
        }
        Err(DiscoveryError::BadResponse { status }) => {
            debug!(status, "proxy_config_unavailable");
            get_text(client, CERTIFICATE_URL).await
        }
        Err(e) => Err(e),
    }
}

async fn get_text(client: &Client, url: &str) -> Result<String, DiscoveryError> {
    let response = client.get(url).send().await.map_err(classify)?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(DiscoveryError::BadResponse {
            status: status.as_u16(),
        });
    }
    response.text().await.map_err(classify)
}

fn classify(err: reqwest::Error) -> DiscoveryError {
    if err.is_timeout() {
        return DiscoveryError::Timeout;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return DiscoveryError::ConnectionRefused,
                io::ErrorKind::TimedOut => return DiscoveryError::Timeout,
                _ => {}
            }
        }
        source = inner.source();
    }
    DiscoveryError::Unreachable(err.to_string())
}
