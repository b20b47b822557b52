//! Settings file
//!
//! Settings live in `config.json` under the XDG config directory unless a path
//! is given explicitly. Every field has a default, so a partial or missing file
//! is fine.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::resolver::{
    DEFAULT_DIRECT_RESOLVERS, DEFAULT_DIRECT_TIMEOUT, DEFAULT_DOH_ENDPOINTS, DEFAULT_DOH_TIMEOUT,
};
use crate::core::rule::DEFAULT_CHECK_INTERVAL_SECS;
use crate::utils::{get_config_dir, get_data_dir, get_state_dir};
use crate::validators::MIN_CHECK_INTERVAL_SECS;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "config.json";

/// Overrides `nat.iptables_path`
pub const IPTABLES_COMMAND_ENV: &str = "PORTFWD_IPTABLES_COMMAND";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Config directory not available")]
    ConfigDirUnavailable,
}

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Rule file location
    pub rules_path: PathBuf,
    /// Check interval given to new domain rules
    pub default_check_interval_secs: u64,
    pub resolvers: ResolverSettings,
    pub nat: NatSettings,
    /// Where apply backups are kept; `None` disables on-disk backups
    pub backup_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            default_check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            resolvers: ResolverSettings::default(),
            nat: NatSettings::default(),
            backup_dir: get_state_dir().map(|dir| dir.join("backups")),
        }
    }
}

impl Settings {
    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_check_interval_secs < MIN_CHECK_INTERVAL_SECS {
            return Err(ConfigError::Invalid {
                field: "default_check_interval_secs",
                reason: format!("must be at least {MIN_CHECK_INTERVAL_SECS}"),
            });
        }
        if self.resolvers.direct.is_empty() && self.resolvers.doh.is_empty() {
            return Err(ConfigError::Invalid {
                field: "resolvers",
                reason: "at least one direct resolver or DoH endpoint is required".into(),
            });
        }
        if self.resolvers.direct_timeout_ms == 0 || self.resolvers.doh_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "resolvers",
                reason: "timeouts must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Name resolution settings, in priority order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub direct: Vec<SocketAddr>,
    pub doh: Vec<String>,
    pub direct_timeout_ms: u64,
    pub doh_timeout_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            direct: DEFAULT_DIRECT_RESOLVERS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            doh: DEFAULT_DOH_ENDPOINTS.iter().map(|s| (*s).to_string()).collect(),
            direct_timeout_ms: duration_ms(DEFAULT_DIRECT_TIMEOUT),
            doh_timeout_ms: duration_ms(DEFAULT_DOH_TIMEOUT),
        }
    }
}

impl ResolverSettings {
    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn doh_timeout(&self) -> Duration {
        Duration::from_millis(self.doh_timeout_ms)
    }
}

/// Kernel-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatSettings {
    pub iptables_path: String,
    pub sysctl_path: String,
    /// Runtime forwarding switch
    pub ip_forward_proc: PathBuf,
    /// Boot-time sysctl file that gets `net.ipv4.ip_forward=1`
    pub sysctl_conf: PathBuf,
    /// Enable and persist IPv4 forwarding before every apply
    pub manage_ip_forward: bool,
}

impl Default for NatSettings {
    fn default() -> Self {
        Self {
            iptables_path: "iptables".to_string(),
            sysctl_path: "sysctl".to_string(),
            ip_forward_proc: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
            sysctl_conf: PathBuf::from("/etc/sysctl.conf"),
            manage_ip_forward: true,
        }
    }
}

impl NatSettings {
    /// The iptables binary, honoring `PORTFWD_IPTABLES_COMMAND`.
    pub fn iptables_program(&self) -> String {
        std::env::var(IPTABLES_COMMAND_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.iptables_path.clone())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_rules_path() -> PathBuf {
    get_data_dir().map_or_else(
        || PathBuf::from("/etc/portfwd/rules.conf"),
        |dir| dir.join("rules.conf"),
    )
}

/// Default settings file path.
pub fn default_settings_path() -> Result<PathBuf, ConfigError> {
    get_config_dir()
        .map(|dir| dir.join(SETTINGS_FILE))
        .ok_or(ConfigError::ConfigDirUnavailable)
}

/// Loads settings from `path`, or defaults if the file does not exist.
pub async fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let settings: Settings = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    settings.validate()?;
    Ok(settings)
}

/// Saves settings atomically with mode 0o600.
pub async fn save_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_string_pretty(settings).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    crate::utils::write_atomic_async(path, json.into_bytes())
        .await
        .map_err(io_err)
}
