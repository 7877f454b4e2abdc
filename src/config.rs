//! Configuration parsing and structures
//!
//! Two kinds of configuration live here:
//!
//! - [`ServiceConfig`]: the daemon's own YAML file (logging, control
//!   endpoint, state directory, instance defaults, mount options).
//! - [`InstanceConfig`]: one mount instance, built from a flat string
//!   mapping (control API request body or a persisted record).

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::env::substitute_env_vars;
use crate::error::{Result, SkymountError};

// =============================================================================
// Service Config (Deserialized from YAML)
// =============================================================================

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Control endpoint configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Directory holding persisted instance records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Instance lifecycle tuning
    #[serde(default)]
    pub instances: InstanceSettings,

    /// Options passed to the mount driver
    #[serde(default)]
    pub mount: MountOptions,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Control endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Address the control API listens on (must be loopback)
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4994))
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/skymount")
}

/// Instance lifecycle settings shared by every instance
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSettings {
    /// How long `create` waits before checking the new instance's health
    #[serde(default = "default_startup_grace", with = "humantime_serde")]
    pub startup_grace: Duration,

    /// Pause between metadata cache refresh passes
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Upper bound for establishing a remote session
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_startup_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            startup_grace: default_startup_grace(),
            refresh_interval: default_refresh_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Mount driver options
#[derive(Debug, Clone, Deserialize)]
pub struct MountOptions {
    /// Filesystem name reported to the kernel
    #[serde(default = "default_fs_name")]
    pub fs_name: String,

    /// Allow other users to access the mount
    #[serde(default)]
    pub allow_other: bool,

    /// Let the kernel unmount when the daemon exits
    #[serde(default = "default_true")]
    pub auto_unmount: bool,
}

fn default_fs_name() -> String {
    "skymount".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fs_name: default_fs_name(),
            allow_other: false,
            auto_unmount: true,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references
    pub fn from_str(content: &str) -> std::result::Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.control.listen.ip().is_loopback() {
            return Err(ConfigError::ValidationError(format!(
                "control.listen must be a loopback address, got {}",
                self.control.listen
            )));
        }

        if self.instances.startup_grace.is_zero() {
            return Err(ConfigError::ValidationError(
                "instances.startup_grace must be greater than zero".to_string(),
            ));
        }

        if self.instances.refresh_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "instances.refresh_interval must be greater than zero".to_string(),
            ));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "state_dir cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

// =============================================================================
// Instance Config (flat string mapping)
// =============================================================================

/// Storage backend selected by an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Local filesystem passthrough
    Local,
    /// Remote session (SFTP over SSH)
    Remote,
}

impl FromStr for BackendKind {
    type Err = SkymountError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "clone" => Ok(BackendKind::Local),
            "remote" | "sftp" => Ok(BackendKind::Remote),
            other => Err(SkymountError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

/// File management policy selected by an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    Passthrough,
    ExtensionBuckets,
}

impl FromStr for PolicyKind {
    type Err = SkymountError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "clone" => Ok(PolicyKind::Passthrough),
            "extension" | "extension-buckets" | "buckets" => Ok(PolicyKind::ExtensionBuckets),
            other => Err(SkymountError::CorruptedConfig(format!(
                "unknown policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Passthrough => f.write_str("passthrough"),
            PolicyKind::ExtensionBuckets => f.write_str("extension"),
        }
    }
}

/// Key aliases accepted on input, mapped to their canonical names
const KEY_ALIASES: &[(&str, &str)] = &[
    ("method", "backend_kind"),
    ("backendKind", "backend_kind"),
    ("password", "secret"),
    ("isKeyAuth", "key_auth"),
    ("remotePath", "root"),
    ("mountPath", "mount_point"),
    ("driveName", "label"),
];

const DEFAULT_SSH_PORT: u16 = 22;

/// Immutable configuration of one mount instance
#[derive(Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub backend_kind: BackendKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password, private key path, or inline key material
    pub secret: String,
    pub key_auth: bool,
    /// Root path on the backend that the mount exposes
    pub root: String,
    pub mount_point: PathBuf,
    pub label: String,
    pub policy: PolicyKind,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("backend_kind", &self.backend_kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("key_auth", &self.key_auth)
            .field("root", &self.root)
            .field("mount_point", &self.mount_point)
            .field("label", &self.label)
            .field("policy", &self.policy)
            .finish()
    }
}

impl InstanceConfig {
    /// A local passthrough instance rooted at `root`
    pub fn local(root: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        let mount_point = mount_point.into();
        Self {
            backend_kind: BackendKind::Local,
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            secret: String::new(),
            key_auth: false,
            root: root.into(),
            label: default_label(&mount_point),
            mount_point,
            policy: PolicyKind::Passthrough,
        }
    }

    /// Build from a flat string mapping, accepting legacy key aliases
    pub fn from_map(raw: &BTreeMap<String, String>) -> Result<Self> {
        let mut map: BTreeMap<&str, &str> = BTreeMap::new();
        for (key, value) in raw {
            let canonical = KEY_ALIASES
                .iter()
                .find(|(alias, _)| alias == key)
                .map(|(_, canonical)| *canonical)
                .unwrap_or(key.as_str());
            map.insert(canonical, value.as_str());
        }

        let required = |key: &str| -> Result<String> {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or_else(|| SkymountError::InvalidConfig(format!("missing field '{}'", key)))
        };

        let backend_kind: BackendKind = required("backend_kind")?.parse()?;
        let root = required("root")?;
        let mount_point = PathBuf::from(required("mount_point")?);

        let (host, username, secret) = match backend_kind {
            BackendKind::Remote => (required("host")?, required("username")?, required("secret")?),
            BackendKind::Local => (
                map.get("host").map(|v| v.to_string()).unwrap_or_default(),
                map.get("username").map(|v| v.to_string()).unwrap_or_default(),
                map.get("secret").map(|v| v.to_string()).unwrap_or_default(),
            ),
        };

        let port = match map.get("port") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                SkymountError::CorruptedConfig(format!("port '{}' is not a valid port", raw))
            })?,
            None => DEFAULT_SSH_PORT,
        };

        let key_auth = match map.get("key_auth") {
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                SkymountError::CorruptedConfig(format!("key_auth '{}' is not a boolean", raw))
            })?,
            None => false,
        };

        let label = map
            .get("label")
            .map(|v| v.to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_label(&mount_point));

        let policy = match map.get("policy") {
            Some(raw) => raw.parse()?,
            None => PolicyKind::default(),
        };

        if root.is_empty() {
            return Err(SkymountError::InvalidConfig("root cannot be empty".into()));
        }
        if mount_point.as_os_str().is_empty() {
            return Err(SkymountError::InvalidConfig(
                "mount_point cannot be empty".into(),
            ));
        }

        Ok(Self {
            backend_kind,
            host,
            port,
            username,
            secret,
            key_auth,
            root,
            mount_point,
            label,
            policy,
        })
    }

    /// Canonical flat mapping, used for persistence and hashing
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("backend_kind".to_string(), self.backend_kind.to_string());
        map.insert("host".to_string(), self.host.clone());
        map.insert("port".to_string(), self.port.to_string());
        map.insert("username".to_string(), self.username.clone());
        map.insert("secret".to_string(), self.secret.clone());
        map.insert("key_auth".to_string(), self.key_auth.to_string());
        map.insert("root".to_string(), self.root.clone());
        map.insert(
            "mount_point".to_string(),
            self.mount_point.to_string_lossy().to_string(),
        );
        map.insert("label".to_string(), self.label.clone());
        map.insert("policy".to_string(), self.policy.to_string());
        map
    }

    /// Same as [`to_map`](Self::to_map) with the secret masked
    pub fn to_redacted_map(&self) -> BTreeMap<String, String> {
        let mut map = self.to_map();
        if !self.secret.is_empty() {
            map.insert("secret".to_string(), "********".to_string());
        }
        map
    }

    /// Stable identifier: hex SHA-256 over every canonical field.
    ///
    /// Each field is fed as `key=value\0`, so adjacent values can never
    /// run together into the same byte stream.
    pub fn identifier(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.to_map() {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

fn default_label(mount_point: &Path) -> String {
    mount_point
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "skymount".to_string())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_map() -> BTreeMap<String, String> {
        [
            ("method", "sftp"),
            ("host", "files.example.com"),
            ("username", "amy"),
            ("password", "hunter2"),
            ("port", "2222"),
            ("isKeyAuth", "false"),
            ("remotePath", "/srv/data"),
            ("mountPath", "/mnt/data"),
            ("driveName", "Data"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_parse_service_config() {
        let yaml = r#"
logging:
  level: debug
control:
  listen: 127.0.0.1:5005
state_dir: /tmp/skymount-state
instances:
  startup_grace: 250ms
  refresh_interval: 2s
mount:
  allow_other: true
"#;

        let config = ServiceConfig::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.control.listen.port(), 5005);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/skymount-state"));
        assert_eq!(config.instances.startup_grace, Duration::from_millis(250));
        assert_eq!(config.instances.refresh_interval, Duration::from_secs(2));
        assert_eq!(config.instances.connect_timeout, Duration::from_secs(15));
        assert!(config.mount.allow_other);
        assert!(config.mount.auto_unmount);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_service_config_uses_defaults() {
        let config = ServiceConfig::from_str("").unwrap();
        assert_eq!(config.control.listen, default_listen());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_public_listener() {
        let config = ServiceConfig::from_str("control:\n  listen: 0.0.0.0:4994\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn test_instance_config_aliases() {
        let config = InstanceConfig::from_map(&remote_map()).unwrap();
        assert_eq!(config.backend_kind, BackendKind::Remote);
        assert_eq!(config.port, 2222);
        assert_eq!(config.secret, "hunter2");
        assert_eq!(config.root, "/srv/data");
        assert_eq!(config.label, "Data");
        assert_eq!(config.policy, PolicyKind::Passthrough);
    }

    #[test]
    fn test_instance_config_round_trips_through_map() {
        let config = InstanceConfig::from_map(&remote_map()).unwrap();
        let restored = InstanceConfig::from_map(&config.to_map()).unwrap();
        assert_eq!(config, restored);
        assert_eq!(config.identifier(), restored.identifier());
    }

    #[test]
    fn test_unknown_method() {
        let mut map = remote_map();
        map.insert("method".into(), "ftp".into());
        let err = InstanceConfig::from_map(&map).unwrap_err();
        assert_eq!(err.code(), "UnknownMethod");
    }

    #[test]
    fn test_missing_and_corrupted_fields() {
        let mut map = remote_map();
        map.remove("host");
        assert_eq!(InstanceConfig::from_map(&map).unwrap_err().code(), "InvalidConfig");

        let mut map = remote_map();
        map.insert("port".into(), "ssh".into());
        assert_eq!(
            InstanceConfig::from_map(&map).unwrap_err().code(),
            "CorruptedConfig"
        );
    }

    #[test]
    fn test_local_config_needs_no_credentials() {
        let map: BTreeMap<String, String> = [
            ("backend_kind", "local"),
            ("root", "/tmp/x"),
            ("mount_point", "/mnt/x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = InstanceConfig::from_map(&map).unwrap();
        assert_eq!(config.backend_kind, BackendKind::Local);
        assert_eq!(config.label, "x");
    }

    #[test]
    fn test_identifier_is_deterministic_and_field_sensitive() {
        let a = InstanceConfig::local("/tmp/a", "/mnt/a");
        let b = InstanceConfig::local("/tmp/a", "/mnt/a");
        let c = InstanceConfig::local("/tmp/b", "/mnt/a");

        assert_eq!(a.identifier(), b.identifier());
        assert_ne!(a.identifier(), c.identifier());
        assert_eq!(a.identifier().len(), 64);
        assert!(a.identifier().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_redacted_map_hides_secret() {
        let config = InstanceConfig::from_map(&remote_map()).unwrap();
        let map = config.to_redacted_map();
        assert_ne!(map["secret"], "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
