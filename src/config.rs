//! Configuration for the traceline service.
//!
//! Reads `traceline.toml` when present; every section has defaults so the
//! service runs without any file. CLI flags override file values.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 7450
//! dev_mode = false
//!
//! [storage]
//! db_path = ".traceline/core.db"
//! cache_ttl_secs = 86400
//!
//! [audit]
//! error_window_secs = 3600
//! broadcast_capacity = 256
//!
//! [[governor.rules]]
//! id = "personal_data_rail"
//! mode = "rail"
//! reason = "Personal data requires rail supervision (GDPR/DSGVO Art. 6)"
//! condition = { type = "flag_true", flag = "uses_personal_data" }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::governor::{GovernorRule, default_rules};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "traceline.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracelineConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub governor: GovernorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and 0.0.0.0 binding for local frontend development.
    #[serde(default)]
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSection {
    /// Width of the rolling window for the recent-error count.
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    /// Capacity of the live event broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernorSection {
    /// Ordered rule list; empty means "use the built-in defaults".
    #[serde(default)]
    pub rules: Vec<GovernorRule>,
}

fn default_port() -> u16 {
    7450
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".traceline/core.db")
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_error_window_secs() -> u64 {
    3600
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev_mode: false,
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            error_window_secs: default_error_window_secs(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl TracelineConfig {
    /// Load configuration. An explicit path must exist and parse; the
    /// default path is optional and falls back to defaults when missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// The governor rule list this configuration yields: the configured
    /// ordered list, or the built-in defaults when none is given.
    pub fn governor_rules(&self) -> Vec<GovernorRule> {
        if self.governor.rules.is_empty() {
            default_rules()
        } else {
            self.governor.rules.clone()
        }
    }
}
