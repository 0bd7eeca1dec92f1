//! Tunables for the view changer and the performance monitor.
//!
//! Loaded from JSON; every field may be omitted and falls back to its default.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "Failed to read config file at {}: {}", path.display(), source)
            }
            Self::Parse(err) => write!(f, "Failed to parse JSON config: {}", err),
            Self::Invalid { field, reason } => write!(f, "Invalid {}: {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewChangeConfig {
    /// Base time a replica waits for a view change to finish before escalating.
    pub new_view_timeout: u64,
    /// The timeout doubles per escalation up to `2^max_backoff_exponent`.
    pub max_backoff_exponent: u32,
    /// Messages for views more than this far above both the current view and
    /// the current target are dropped.
    pub max_view_lookahead: u64,
    /// Width of one throughput window.
    pub throughput_window_size: u64,
    /// Number of windows before throughput is reported, also the EMA span.
    pub throughput_min_count: u64,
}

impl Default for ViewChangeConfig {
    fn default() -> Self {
        Self {
            new_view_timeout: 30_000,
            max_backoff_exponent: 6,
            max_view_lookahead: 64,
            throughput_window_size: 15,
            throughput_min_count: 16,
        }
    }
}

impl ViewChangeConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.new_view_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "new_view_timeout",
                reason: "must be positive",
            });
        }
        if self.max_backoff_exponent > 32 {
            return Err(ConfigError::Invalid {
                field: "max_backoff_exponent",
                reason: "must be at most 32",
            });
        }
        if self.max_view_lookahead == 0 {
            return Err(ConfigError::Invalid {
                field: "max_view_lookahead",
                reason: "must be positive",
            });
        }
        if self.throughput_window_size == 0 {
            return Err(ConfigError::Invalid {
                field: "throughput_window_size",
                reason: "must be positive",
            });
        }
        if self.throughput_min_count == 0 {
            return Err(ConfigError::Invalid {
                field: "throughput_min_count",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Timeout after `escalations` failed attempts.
    pub fn backoff_timeout(&self, escalations: u32) -> u64 {
        let exponent = escalations.min(self.max_backoff_exponent).min(32);
        self.new_view_timeout.saturating_mul(1u64 << exponent)
    }
}
