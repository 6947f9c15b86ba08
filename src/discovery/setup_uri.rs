use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::DiscoveryError;

/// Links from the proxy UI are emitted both with and without padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Candidate proxy description carried by a setup link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
    pub addresses: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub local_tunnel_port: Option<u16>,
    pub cert_fingerprint: String,
}

/// Parse `scheme://host/connect/?data=<base64url-json>`.
pub fn parse_setup_uri(uri: &str) -> Result<ProxyInfo, DiscoveryError> {
    let url = Url::parse(uri.trim())
        .map_err(|e| DiscoveryError::InvalidSetupUri(format!("{uri}: {e}")))?;
    if !url.path().contains("/connect") {
        return Err(DiscoveryError::InvalidSetupUri(format!(
            "unexpected path {}",
            url.path()
        )));
    }

    let data = url
        .query_pairs()
        .find(|(name, _)| name == "data")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| DiscoveryError::InvalidSetupUri("missing data parameter".into()))?;
    let json = URL_SAFE_LENIENT
        .decode(data.trim())
        .map_err(|e| DiscoveryError::InvalidSetupUri(format!("data is not base64url: {e}")))?;
    let info: ProxyInfo = serde_json::from_slice(&json)
        .map_err(|e| DiscoveryError::InvalidSetupUri(format!("data is not proxy info: {e}")))?;

    if info.port == 0 {
        return Err(DiscoveryError::InvalidSetupUri("proxy port is 0".into()));
    }
    if info.cert_fingerprint.is_empty() {
        return Err(DiscoveryError::InvalidSetupUri(
            "certificate fingerprint is empty".into(),
        ));
    }
    Ok(info)
}
