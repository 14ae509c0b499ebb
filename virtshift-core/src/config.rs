//! Configuration management.
//!
//! Configuration is a typed YAML document with `ssh`, `transfer`, `libvirt`
//! and `logging` sections. Unknown keys are rejected at load time. Precedence
//! is: explicit CLI flag > environment variable > config file > built-in
//! default; this module handles the file and environment layers.
//!
//! Environment variables:
//! - `VIRTSHIFT_SSH_KEY_PATH`: default identity key path
//! - `VIRTSHIFT_SSH_PORT`: default SSH port
//! - `VIRTSHIFT_TIMEOUT`: default operation timeout in seconds
//! - `VIRTSHIFT_LOG_LEVEL`: one of DEBUG, INFO, WARN, ERROR
//! - `VIRTSHIFT_KNOWN_HOSTS_FILE`: host-key store override
//! - `VIRTSHIFT_PARALLEL_TRANSFERS`: default parallel transfer count
//! - `VIRTSHIFT_BANDWIDTH_LIMIT`: default bandwidth limit (e.g. "100M")
//! - `VIRTSHIFT_SSH_HOST_KEY_POLICY`: one of strict, warn, accept

use crate::error::{Result, ShiftError};
use crate::paths;
use crate::types::{Bandwidth, TransferMethod, DEFAULT_CLONE_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// SSH host-key verification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Reject unknown hosts
    #[default]
    Strict,
    /// Log a warning and accept
    Warn,
    /// Automatically add new hosts to the known-hosts store
    Accept,
}

impl HostKeyPolicy {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Accept => "accept",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "warn" => Some(Self::Warn),
            "accept" => Some(Self::Accept),
            _ => None,
        }
    }

    /// Value for OpenSSH's `StrictHostKeyChecking` option.
    pub fn ssh_option(&self) -> &'static str {
        match self {
            Self::Strict => "yes",
            Self::Warn => "no",
            Self::Accept => "accept-new",
        }
    }
}

impl std::fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `ssh` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SshSection {
    /// Identity key path; `None` relies on the agent and default locations
    pub key_path: Option<PathBuf>,
    /// Default port when neither flags nor ssh_config provide one
    pub port: u16,
    /// Per-connection connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Override for the known-hosts file
    pub known_hosts_file: Option<PathBuf>,
    /// Host-key verification policy
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            key_path: None,
            port: 22,
            connect_timeout_secs: 30,
            known_hosts_file: None,
            host_key_policy: HostKeyPolicy::Strict,
        }
    }
}

/// `transfer` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransferSection {
    /// Default bound on concurrent disk transfers
    pub parallel: u32,
    /// Default bandwidth limit
    pub bandwidth_limit: Option<Bandwidth>,
    /// Default transfer strategy
    pub method: TransferMethod,
    /// Verify checksums after transfer by default
    pub verify: bool,
    /// Default operation timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            parallel: 4,
            bandwidth_limit: None,
            method: TransferMethod::Rsync,
            verify: false,
            timeout_secs: DEFAULT_CLONE_TIMEOUT_SECS,
        }
    }
}

/// `libvirt` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LibvirtSection {
    /// Connection URI used with `virsh -c`
    pub uri: String,
    /// Base directory for disk images on destination hosts
    pub image_dir: String,
}

impl Default for LibvirtSection {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            image_dir: "/var/lib/libvirt/images".to_string(),
        }
    }
}

/// `logging` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSection {
    /// One of DEBUG, INFO, WARN, ERROR
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "INFO".to_string() }
    }
}

/// Top-level configuration for virtshift.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub ssh: SshSection,
    pub transfer: TransferSection,
    pub libvirt: LibvirtSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration.
    ///
    /// With an explicit path the file must exist and parse. Otherwise the
    /// first existing file among the user, system, and current-directory
    /// locations is used, falling back to defaults. Environment overrides
    /// are applied on top in both cases.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => {
                let candidates =
                    [paths::user_config_path(), paths::system_config_path(), paths::local_config_path()];
                match candidates.iter().find(|p| p.exists()) {
                    Some(path) => {
                        tracing::info!(path = %path.display(), "Loading configuration");
                        Self::from_file(path)?
                    }
                    None => {
                        tracing::debug!("No configuration file found, using defaults");
                        Self::default()
                    }
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file. Unknown keys are rejected.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ShiftError::Configuration {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| ShiftError::Configuration {
            reason: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    /// Write the configuration to a file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ShiftError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_yaml::to_string(self).map_err(|e| ShiftError::Configuration {
            reason: format!("failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| ShiftError::Io { path: path.to_path_buf(), source: e })
    }

    /// Apply environment variable overrides on top of file/default values.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("VIRTSHIFT_SSH_KEY_PATH") {
            self.ssh.key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_SSH_PORT") {
            self.ssh.port = v.parse().map_err(|_| ShiftError::Configuration {
                reason: format!("VIRTSHIFT_SSH_PORT is not a valid port: {}", v),
            })?;
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_TIMEOUT") {
            self.transfer.timeout_secs = v.parse().map_err(|_| ShiftError::Configuration {
                reason: format!("VIRTSHIFT_TIMEOUT is not a number: {}", v),
            })?;
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_KNOWN_HOSTS_FILE") {
            self.ssh.known_hosts_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_PARALLEL_TRANSFERS") {
            self.transfer.parallel = v.parse().map_err(|_| ShiftError::Configuration {
                reason: format!("VIRTSHIFT_PARALLEL_TRANSFERS is not a number: {}", v),
            })?;
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_BANDWIDTH_LIMIT") {
            self.transfer.bandwidth_limit = Bandwidth::parse_opt(&v)?;
        }
        if let Ok(v) = std::env::var("VIRTSHIFT_SSH_HOST_KEY_POLICY") {
            self.ssh.host_key_policy =
                HostKeyPolicy::parse(&v).ok_or_else(|| ShiftError::Configuration {
                    reason: format!(
                        "VIRTSHIFT_SSH_HOST_KEY_POLICY must be strict, warn or accept, got {}",
                        v
                    ),
                })?;
        }
        Ok(())
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<()> {
        let level = self.logging.level.to_uppercase();
        if !matches!(level.as_str(), "DEBUG" | "INFO" | "WARN" | "ERROR") {
            return Err(ShiftError::Configuration {
                reason: format!("logging.level must be DEBUG, INFO, WARN or ERROR, got {}", level),
            });
        }
        if self.ssh.port == 0 {
            return Err(ShiftError::InvalidPort { port: 0 });
        }
        if self.transfer.parallel == 0 || self.transfer.parallel > crate::types::MAX_PARALLEL_TRANSFERS
        {
            return Err(ShiftError::Configuration {
                reason: format!(
                    "transfer.parallel must be between 1 and {}, got {}",
                    crate::types::MAX_PARALLEL_TRANSFERS,
                    self.transfer.parallel
                ),
            });
        }
        Ok(())
    }

    /// Read a single value by dotted key (for `config get`).
    pub fn get_key(&self, key: &str) -> Result<String> {
        let value = match key {
            "ssh.key_path" => {
                self.ssh.key_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
            }
            "ssh.port" => self.ssh.port.to_string(),
            "ssh.connect_timeout_secs" => self.ssh.connect_timeout_secs.to_string(),
            "ssh.known_hosts_file" => self
                .ssh
                .known_hosts_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "ssh.host_key_policy" => self.ssh.host_key_policy.to_string(),
            "transfer.parallel" => self.transfer.parallel.to_string(),
            "transfer.bandwidth_limit" => {
                self.transfer.bandwidth_limit.as_ref().map(|b| b.to_string()).unwrap_or_default()
            }
            "transfer.method" => self.transfer.method.to_string(),
            "transfer.verify" => self.transfer.verify.to_string(),
            "transfer.timeout_secs" => self.transfer.timeout_secs.to_string(),
            "libvirt.uri" => self.libvirt.uri.clone(),
            "libvirt.image_dir" => self.libvirt.image_dir.clone(),
            "logging.level" => self.logging.level.clone(),
            _ => {
                return Err(ShiftError::Configuration { reason: format!("unknown config key: {}", key) })
            }
        };
        Ok(value)
    }

    /// Set a single value by dotted key (for `config set`). Values are
    /// coerced to the field's type; invalid values are rejected here rather
    /// than at use time.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "ssh.key_path" => self.ssh.key_path = Some(PathBuf::from(value)),
            "ssh.port" => {
                self.ssh.port = value
                    .parse()
                    .map_err(|_| ShiftError::InvalidPort { port: value.parse().unwrap_or(-1) })?
            }
            "ssh.connect_timeout_secs" => {
                self.ssh.connect_timeout_secs = value.parse().map_err(|_| {
                    ShiftError::Configuration { reason: format!("not a number: {}", value) }
                })?
            }
            "ssh.known_hosts_file" => self.ssh.known_hosts_file = Some(PathBuf::from(value)),
            "ssh.host_key_policy" => {
                self.ssh.host_key_policy =
                    HostKeyPolicy::parse(value).ok_or_else(|| ShiftError::Configuration {
                        reason: format!("must be strict, warn or accept: {}", value),
                    })?
            }
            "transfer.parallel" => {
                self.transfer.parallel = value.parse().map_err(|_| ShiftError::Configuration {
                    reason: format!("not a number: {}", value),
                })?
            }
            "transfer.bandwidth_limit" => {
                self.transfer.bandwidth_limit = Bandwidth::parse_opt(value)?
            }
            "transfer.method" => {
                self.transfer.method =
                    TransferMethod::parse(value).ok_or_else(|| ShiftError::Configuration {
                        reason: format!("must be rsync, stream or blocksync: {}", value),
                    })?
            }
            "transfer.verify" => {
                self.transfer.verify = match value.to_lowercase().as_str() {
                    "true" | "yes" | "1" => true,
                    "false" | "no" | "0" => false,
                    _ => {
                        return Err(ShiftError::Configuration {
                            reason: format!("not a boolean: {}", value),
                        })
                    }
                }
            }
            "transfer.timeout_secs" => {
                self.transfer.timeout_secs = value.parse().map_err(|_| {
                    ShiftError::Configuration { reason: format!("not a number: {}", value) }
                })?
            }
            "libvirt.uri" => self.libvirt.uri = value.to_string(),
            "libvirt.image_dir" => self.libvirt.image_dir = value.to_string(),
            "logging.level" => self.logging.level = value.to_string(),
            _ => {
                return Err(ShiftError::Configuration { reason: format!("unknown config key: {}", key) })
            }
        }
        self.validate()
    }

    /// Reset a key to its built-in default (for `config unset`).
    pub fn unset_key(&mut self, key: &str) -> Result<()> {
        let defaults = Self::default();
        let value = defaults.get_key(key)?;
        if value.is_empty() {
            // Optional fields reset to None directly.
            match key {
                "ssh.key_path" => self.ssh.key_path = None,
                "ssh.known_hosts_file" => self.ssh.known_hosts_file = None,
                "transfer.bandwidth_limit" => self.transfer.bandwidth_limit = None,
                _ => {}
            }
            return Ok(());
        }
        self.set_key(key, &value)
    }

    /// All known dotted keys with their current values (for `config list`).
    pub fn list_keys(&self) -> Vec<(&'static str, String)> {
        const KEYS: &[&str] = &[
            "ssh.key_path",
            "ssh.port",
            "ssh.connect_timeout_secs",
            "ssh.known_hosts_file",
            "ssh.host_key_policy",
            "transfer.parallel",
            "transfer.bandwidth_limit",
            "transfer.method",
            "transfer.verify",
            "transfer.timeout_secs",
            "libvirt.uri",
            "libvirt.image_dir",
            "logging.level",
        ];
        KEYS.iter().map(|k| (*k, self.get_key(k).unwrap_or_default())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.transfer.parallel, 4);
        assert_eq!(config.libvirt.uri, "qemu:///system");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "ssh:\n  port: 2222\n  unknown_option: true\n";
        let result: std::result::Result<AppConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let yaml = "transfer:\n  parallel: 8\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transfer.parallel, 8);
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut config = AppConfig::default();
        config.set_key("ssh.port", "2222").unwrap();
        assert_eq!(config.get_key("ssh.port").unwrap(), "2222");

        config.set_key("transfer.method", "blocksync").unwrap();
        assert_eq!(config.get_key("transfer.method").unwrap(), "blocksync");

        assert!(config.set_key("transfer.method", "carrier-pigeon").is_err());
        assert!(config.set_key("nope.nope", "x").is_err());
    }

    #[test]
    fn test_unset_restores_default() {
        let mut config = AppConfig::default();
        config.set_key("transfer.parallel", "8").unwrap();
        config.unset_key("transfer.parallel").unwrap();
        assert_eq!(config.transfer.parallel, 4);

        config.set_key("ssh.key_path", "/tmp/key").unwrap();
        config.unset_key("ssh.key_path").unwrap();
        assert!(config.ssh.key_path.is_none());
    }

    #[test]
    fn test_host_key_policy_ssh_option() {
        assert_eq!(HostKeyPolicy::Strict.ssh_option(), "yes");
        assert_eq!(HostKeyPolicy::Warn.ssh_option(), "no");
        assert_eq!(HostKeyPolicy::Accept.ssh_option(), "accept-new");
    }
}
