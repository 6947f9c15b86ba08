use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureMode, DEFAULT_REDIRECT_PORTS};
use crate::discovery::StoredProxy;
use crate::engine::DEFAULT_MTU;
use crate::error::{AppError, Result};
use crate::session::table::IdleTimeouts;

const APP_DIR: &str = "tunsnare";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mtu: usize,
    pub redirect_ports: BTreeSet<u16>,
    pub capture_mode: CaptureMode,
    /// Package names the host keeps out of the tunnel. Not interpreted here.
    pub excluded_apps: Vec<String>,
    pub udp_idle_timeout_secs: u64,
    pub tcp_idle_timeout_secs: u64,
    pub half_open_timeout_secs: u64,
    pub last_proxy: Option<StoredProxy>,
    pub fwmark: Option<u32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let timeouts = IdleTimeouts::default();
        AppConfig {
            mtu: DEFAULT_MTU,
            redirect_ports: DEFAULT_REDIRECT_PORTS.into_iter().collect(),
            capture_mode: CaptureMode::Raw,
            excluded_apps: Vec::new(),
            udp_idle_timeout_secs: timeouts.udp.as_secs(),
            tcp_idle_timeout_secs: timeouts.established.as_secs(),
            half_open_timeout_secs: timeouts.half_open.as_secs(),
            last_proxy: None,
            fwmark: None,
        }
    }
}

impl AppConfig {
    #[must_use]
    pub fn idle_timeouts(&self) -> IdleTimeouts {
        IdleTimeouts {
            udp: Duration::from_secs(self.udp_idle_timeout_secs),
            half_open: Duration::from_secs(self.half_open_timeout_secs),
            established: Duration::from_secs(self.tcp_idle_timeout_secs),
        }
    }

    /// Replace the redirected port set. Port 0 is rejected.
    pub fn set_redirect_ports(&mut self, ports: &[u16]) -> Result<()> {
        if ports.is_empty() {
            return Err(AppError::Config("at least one port is required".into()));
        }
        if ports.contains(&0) {
            return Err(AppError::Config("port 0 is not a valid port".into()));
        }
        self.redirect_ports = ports.iter().copied().collect();
        Ok(())
    }

    pub fn reset_redirect_ports(&mut self) {
        self.redirect_ports = DEFAULT_REDIRECT_PORTS.into_iter().collect();
    }
}

/// Root config directory: ~/.config/tunsnare/
#[must_use]
pub fn app_config_dir() -> PathBuf {
    xdg_config_home().join(APP_DIR)
}

/// ~/.config/tunsnare/config.json
#[must_use]
pub fn config_path() -> PathBuf {
    app_config_dir().join(CONFIG_FILE)
}

fn xdg_config_home() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        PathBuf::from("/tmp")
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Load settings, falling back to defaults when the file is missing or bad.
#[must_use]
pub fn load_config() -> AppConfig {
    load_from(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<()> {
    save_to(&config_path(), config)
}

#[must_use]
pub fn load_from(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(AppError::from)
        .and_then(|json| serde_json::from_str(&json).map_err(AppError::from));
    match parsed {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "config_load_failed_using_defaults"
            );
            AppConfig::default()
        }
    }
}

pub fn save_to(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, &json)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    tracing::debug!(path = %path.display(), "config_saved");
    Ok(())
}
