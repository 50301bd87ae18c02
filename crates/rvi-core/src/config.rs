//! Configuration for an RVI node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. explicit path (daemon argument)
//!   2. $RVI_CONFIG
//!   3. ./rvi.config
//!
//! The native format is a flat `key = value` file:
//!
//! ```text
//! device.cert = /etc/rvi/device.pem
//! device.key  = /etc/rvi/device.key
//! ca.cert     = /etc/rvi/root_ca.pem
//! cred.dir    = /etc/rvi/credentials
//! ```
//!
//! A path ending in `.toml` is parsed as TOML with the same sections.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for `node.handshake_timeout_secs`.
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 3600;
/// Upper bound for `node.ping_interval_secs`.
pub const MAX_PING_INTERVAL_SECS: u64 = 86_400;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device: DeviceConfig,
    pub ca: CaConfig,
    pub cred: CredConfig,
    pub node: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// PEM certificate chain presented to peers.
    pub cert: PathBuf,
    /// PEM private key for `cert`.
    pub key: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// PEM file with trusted CA certificate(s).
    pub cert: Option<PathBuf>,
    /// Directory of additional trusted CA certificates.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredConfig {
    /// Directory holding one `*.jwt` file per credential we present.
    pub dir: Option<PathBuf>,
    /// PEM public key that signs the credentials peers present.
    pub verify_key: Option<PathBuf>,
    /// Shared HMAC secret, used when no `verify_key` is set.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept peer connections on. None = outbound only.
    pub listen: Option<SocketAddr>,
    /// Peers (`host:port`) to dial at startup.
    pub peers: Vec<String>,
    /// Deadline for authenticate + service-announce, and for connect/TLS.
    pub handshake_timeout_secs: u64,
    /// Keepalive ping interval. 0 = disabled.
    pub ping_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("device.pem"),
            key: PathBuf::from("device.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            handshake_timeout_secs: 10,
            ping_interval_secs: 30,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("line {line}: expected `key = value`, got {text:?}")]
    Malformed { line: usize, text: String },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("no credentials: {0}")]
    NoCredentials(String),
}

impl From<ConfigError> for crate::error::RviError {
    fn from(e: ConfigError) -> Self {
        crate::error::RviError::InvalidArgument(e.to_string())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: file → env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let mut config = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            Self::from_flat_str(&text)?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path when none is given explicitly.
    pub fn file_path() -> PathBuf {
        std::env::var("RVI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("rvi.config"))
    }

    /// Parse the flat `key = value` format. Unknown keys are logged and skipped.
    pub fn from_flat_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = NodeConfig::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| ConfigError::Malformed {
                    line: idx + 1,
                    text: raw.to_string(),
                })?;
            if !config.set(key, value)? {
                tracing::warn!(key, line = idx + 1, "ignoring unknown config key");
            }
        }
        Ok(config)
    }

    /// Apply one flat key. Returns false for unknown keys.
    fn set(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "device.cert" => self.device.cert = PathBuf::from(value),
            "device.key" => self.device.key = PathBuf::from(value),
            "ca.cert" => self.ca.cert = Some(PathBuf::from(value)),
            "ca.dir" => self.ca.dir = Some(PathBuf::from(value)),
            "cred.dir" => self.cred.dir = Some(PathBuf::from(value)),
            "cred.verify_key" => self.cred.verify_key = Some(PathBuf::from(value)),
            "cred.secret" => self.cred.secret = Some(value.to_string()),
            "node.listen" => self.node.listen = Some(value.parse().map_err(|_| invalid())?),
            "node.peers" => {
                self.node.peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            }
            "node.handshake_timeout_secs" => {
                self.node.handshake_timeout_secs = value.parse().map_err(|_| invalid())?
            }
            "node.ping_interval_secs" => {
                self.node.ping_interval_secs = value.parse().map_err(|_| invalid())?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Apply RVI_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RVI_NODE__LISTEN") {
            match v.parse() {
                Ok(addr) => self.node.listen = Some(addr),
                Err(_) => tracing::warn!(value = %v, "ignoring invalid RVI_NODE__LISTEN"),
            }
        }
        if let Ok(v) = std::env::var("RVI_NODE__HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.node.handshake_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RVI_CRED__DIR") {
            self.cred.dir = Some(PathBuf::from(v));
        }
    }

    /// Handshake deadline, clamped to 1 s ..= `MAX_HANDSHAKE_TIMEOUT_SECS`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(
            self.node
                .handshake_timeout_secs
                .clamp(1, MAX_HANDSHAKE_TIMEOUT_SECS),
        )
    }

    /// Keepalive interval, capped at `MAX_PING_INTERVAL_SECS`. None = disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        match self.node.ping_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs.min(MAX_PING_INTERVAL_SECS))),
        }
    }

    /// Read every `*.jwt` file in the credential directory, in file-name order.
    pub fn load_credentials(&self) -> Result<Vec<String>, ConfigError> {
        let dir = self
            .cred
            .dir
            .as_ref()
            .ok_or_else(|| ConfigError::NoCredentials("cred.dir is not set".into()))?;
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ConfigError::NoCredentials(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jwt"))
            .collect();
        paths.sort();

        let mut credentials = Vec::with_capacity(paths.len());
        for path in paths {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            let token = text.trim();
            if token.is_empty() {
                tracing::warn!(path = %path.display(), "skipping empty credential file");
                continue;
            }
            credentials.push(token.to_string());
        }
        if credentials.is_empty() {
            tracing::warn!(dir = %dir.display(), "credential directory holds no credentials");
        }
        Ok(credentials)
    }
}
