//! Runtime configuration.
//!
//! Every tunable the processor and query layer use lives here and is passed
//! in explicitly. Values come from an optional TOML file; anything missing
//! takes its default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;

use crate::payload::default_sensitive_keys;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "REFLEX_CONFIG";

/// Default database file, relative to the working directory.
pub const DEFAULT_DATABASE: &str = "reflex.db";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReflexConfig {
    /// Path to the SQLite database file.
    pub database: PathBuf,
    pub notifications: NotificationConfig,
    pub limits: LimitConfig,
    pub sanitize: SanitizeConfig,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            notifications: NotificationConfig::default(),
            limits: LimitConfig::default(),
            sanitize: SanitizeConfig::default(),
        }
    }
}

/// Notification throttling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Minimum seconds between two notifications for the same group.
    pub throttle_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { throttle_secs: 300 }
    }
}

impl NotificationConfig {
    /// The throttle window as a duration.
    #[must_use]
    pub fn throttle(&self) -> Duration {
        Duration::seconds(i64::try_from(self.throttle_secs).unwrap_or(i64::MAX))
    }
}

/// Default and maximum result sizes per calling surface.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitConfig {
    pub api: usize,
    pub dashboard: usize,
    pub tool: usize,
    /// Hard cap applied to every requested limit.
    pub max: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            api: 50,
            dashboard: 100,
            tool: 20,
            max: 500,
        }
    }
}

/// Which caller is asking; picks the default limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Api,
    Dashboard,
    Tool,
}

impl LimitConfig {
    /// Resolve a caller-supplied limit: the surface default when absent or
    /// zero, never above `max`.
    #[must_use]
    pub fn resolve(&self, requested: Option<usize>, surface: Surface) -> usize {
        let default = match surface {
            Surface::Api => self.api,
            Surface::Dashboard => self.dashboard,
            Surface::Tool => self.tool,
        };
        requested
            .filter(|n| *n > 0)
            .unwrap_or(default)
            .min(self.max)
    }
}

/// Request parameter sanitization.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SanitizeConfig {
    /// Parameter names whose values are replaced, compared case-insensitively.
    pub keys: Vec<String>,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            keys: default_sensitive_keys(),
        }
    }
}

impl SanitizeConfig {
    /// Keys lowercased for comparison.
    #[must_use]
    pub fn normalized_keys(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.to_lowercase()).collect()
    }
}

impl ReflexConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config")
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Load from an explicit path, else `$REFLEX_CONFIG`, else defaults.
    ///
    /// An explicitly named file must exist; a missing file named by the
    /// environment variable is treated as absent.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}
