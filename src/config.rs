//! Configuration handling for the connection manager
//!
//! Helper location, shared log path and timeouts live here; the whole
//! [`Config`] is passed to [`VpnManager::new`](crate::VpnManager::new).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

const LOCAL_CONFIG_FILE: &str = "ovpn-manager.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub helper: HelperConfig,
    pub connection: ConnectionConfig,
    pub timeouts: TimeoutConfig,
    pub poll: PollConfig,
    pub leak_protection: LeakProtectionConfig,
}

/// How the helper gets its privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Escalation {
    /// Run the helper as-is (already privileged, or tests)
    None,
    /// `sudo -n`: relies on a NOPASSWD rule for the helper
    Sudo,
    /// `sudo -A` with `SUDO_ASKPASS`
    SudoAskpass,
    /// `pkexec` with its own polkit prompt
    Pkexec,
}

/// Where the helper expects credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialMode {
    /// Transient file passed as `--auth-user-pass <file>`
    File,
    /// `username\npassword\n` written to the helper's stdin
    Stdin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// Wait for the helper to exit 0 before monitoring
    Handshake,
    /// Monitor the spawned process immediately
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Udp4,
    Tcp4,
}

impl Proto {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Proto::Udp4 => "udp4",
            Proto::Tcp4 => "tcp4",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub path: PathBuf,
    pub escalation: Escalation,
    /// Askpass program for [`Escalation::SudoAskpass`]; falls back to `$SUDO_ASKPASS`
    pub askpass: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/local/libexec/openvpn-gui-helper.sh"),
            escalation: Escalation::Sudo,
            askpass: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Shared log file the helper appends OpenVPN output to
    pub log_path: PathBuf,
    /// Directory for the auth-user-pass file (system temp dir when unset)
    pub auth_dir: Option<PathBuf>,
    pub credentials: CredentialMode,
    pub launch: LaunchMode,
    pub proto: Option<Proto>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/tmp/openvpn_gui_log.log"),
            auth_dir: None,
            credentials: CredentialMode::Stdin,
            launch: LaunchMode::Handshake,
            proto: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub handshake_secs: u64,
    pub poll_interval_ms: u64,
    pub status_secs: u64,
    pub stop_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 90,
            handshake_secs: 10,
            poll_interval_ms: 1000,
            status_secs: 5,
            stop_secs: 10,
            kill_grace_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub enabled: bool,
    /// Consecutive `connected` answers that count as connected without the log marker
    pub connected_threshold: u32,
    /// Consecutive failed status calls before the session is failed
    pub max_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connected_threshold: 3,
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakProtectionConfig {
    /// Block IPv6 egress while the tunnel is up
    pub enabled: bool,
    /// Limit for each firewall command
    pub timeout_secs: u64,
}

impl Default for LeakProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 10,
        }
    }
}

impl LeakProtectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Per-user config location (`~/.config/ovpn-manager/config.toml` on Linux)
    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ovpn-manager").join("config.toml"))
    }

    /// Load config from default locations
    ///
    /// Tries `./ovpn-manager.toml`, then [`Config::user_path`], then defaults.
    pub fn discover() -> Result<Self, ConfigError> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }

        if let Some(user) = Self::user_path().filter(|p| p.exists()) {
            return Self::load(&user);
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }
}
