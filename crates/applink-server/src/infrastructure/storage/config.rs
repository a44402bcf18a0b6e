//! TOML-based configuration for the session server.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\AppLink\config.toml`
//! - Linux:    `~/.config/applink/config.toml`
//! - macOS:    `~/Library/Application Support/AppLink/config.toml`
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return
//! value of `some_fn()` when absent from the file, so the server works on
//! first run and when upgrading from an older config that lacks newer
//! fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use applink_core::domain::device::{ConnectionKind, Device, Platform};

use crate::infrastructure::network::server::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configured bind address is not a valid IP address.
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    /// Statically configured devices, registered by the seed dispatcher.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Listening endpoint and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// IP address to bind the listener to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port instrumented apps connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Session admission and shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// How long a connection may take to deliver its handshake, in ms.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// How long `close` waits for sessions before aborting them, in ms.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Whether several clients may share one device serial.
    #[serde(default = "default_true")]
    pub allow_shared_device: bool,
}

/// A statically configured device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub serial: String,
    pub name: String,
    pub platform: Platform,
    #[serde(default = "default_connection_kind")]
    pub connection: ConnectionKind,
}

impl From<&DeviceEntry> for Device {
    fn from(entry: &DeviceEntry) -> Self {
        Device::new(&entry.serial, entry.platform, &entry.name, entry.connection)
    }
}

impl AppConfig {
    /// Builds the runtime session config from the file values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if `server.bind_address`
    /// does not parse.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let bind_address = self
            .server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind_address.clone()))?;
        Ok(SessionConfig {
            bind_address,
            port: self.server.port,
            handshake_timeout: Duration::from_millis(self.session.handshake_timeout_ms),
            shutdown_grace: Duration::from_millis(self.session.shutdown_grace_ms),
            allow_shared_device: self.session.allow_shared_device,
        })
    }

    /// The configured devices as domain records.
    pub fn seed_devices(&self) -> Vec<Device> {
        self.devices.iter().map(Device::from).collect()
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9670
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_grace_ms() -> u64 {
    3_000
}
fn default_true() -> bool {
    true
}
fn default_connection_kind() -> ConnectionKind {
    ConnectionKind::Physical
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            allow_shared_device: default_true(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from disk, returning `AppConfig::default()` if the file
/// does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let path = config_file_path()?;

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to disk, creating the config directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("AppLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("applink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("AppLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.bind_address, "127.0.0.1");
        assert_eq!(cfg.server.port, 9670);
        assert_eq!(cfg.server.log_level, "info");
        assert_eq!(cfg.session.handshake_timeout_ms, 5_000);
        assert_eq!(cfg.session.shutdown_grace_ms, 3_000);
        assert!(cfg.session.allow_shared_device);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut cfg = AppConfig::default();
        cfg.server.port = 9999;
        cfg.devices.push(DeviceEntry {
            serial: "emulator-5554".to_string(),
            name: "Pixel 8 API 34".to_string(),
            platform: Platform::Android,
            connection: ConnectionKind::Emulated,
        });

        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[server]
port = 7000

[session]
allow_shared_device = false
"#;
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.server.bind_address, "127.0.0.1");
        assert!(!cfg.session.allow_shared_device);
        assert_eq!(cfg.session.handshake_timeout_ms, 5_000);
    }

    #[test]
    fn test_device_entry_defaults_to_physical_connection() {
        let toml_str = r#"
[[devices]]
serial = "R5CT62ABCDE"
name = "Galaxy S23"
platform = "android"
"#;
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize");
        assert_eq!(cfg.devices[0].connection, ConnectionKind::Physical);
    }

    #[test]
    fn test_session_config_conversion() {
        let mut cfg = AppConfig::default();
        cfg.session.handshake_timeout_ms = 250;
        let session = cfg.session_config().expect("convert");
        assert_eq!(session.handshake_timeout, Duration::from_millis(250));
        assert_eq!(session.port, 9670);
    }

    #[test]
    fn test_session_config_rejects_bad_bind_address() {
        let mut cfg = AppConfig::default();
        cfg.server.bind_address = "not-an-ip".to_string();
        let err = cfg.session_config().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddress(_)));
    }

    #[test]
    fn test_seed_devices_maps_entries() {
        let mut cfg = AppConfig::default();
        cfg.devices.push(DeviceEntry {
            serial: "00008110-AABB".to_string(),
            name: "iPhone 15".to_string(),
            platform: Platform::Ios,
            connection: ConnectionKind::Physical,
        });
        let devices = cfg.seed_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "00008110-AABB");
        assert_eq!(devices[0].platform, Platform::Ios);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let result: Result<AppConfig, toml::de::Error> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }
}
