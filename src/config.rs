//! Termination timeout configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values passed to [`set_global`] or [`set_timeout`]
//! 2. **Environment variables**: values from `LIFETIMES_*` env vars
//! 3. **Config file**: a TOML `[termination]` table (requires the `config-file` feature)
//! 4. **Defaults**: [`TerminationConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `LIFETIMES_TERMINATION_TIMEOUT_MS` | `u64` | `default_timeout` |
//! | `LIFETIMES_SHORT_TIMEOUT_MS` | `u64` | `short_timeout` |
//! | `LIFETIMES_LONG_TIMEOUT_MS` | `u64` | `long_timeout` |
//! | `LIFETIMES_EXTRA_LONG_TIMEOUT_MS` | `u64` | `extra_long_timeout` |

use crate::types::TerminationTimeoutKind;
use parking_lot::RwLock;
use std::time::Duration;

/// Environment variable name for the default termination timeout.
pub const ENV_TERMINATION_TIMEOUT_MS: &str = "LIFETIMES_TERMINATION_TIMEOUT_MS";
/// Environment variable name for the short termination timeout.
pub const ENV_SHORT_TIMEOUT_MS: &str = "LIFETIMES_SHORT_TIMEOUT_MS";
/// Environment variable name for the long termination timeout.
pub const ENV_LONG_TIMEOUT_MS: &str = "LIFETIMES_LONG_TIMEOUT_MS";
/// Environment variable name for the extra-long termination timeout.
pub const ENV_EXTRA_LONG_TIMEOUT_MS: &str = "LIFETIMES_EXTRA_LONG_TIMEOUT_MS";

/// Errors produced while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: expected milliseconds as u64, got {value:?} ({reason})")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
    /// A config file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Io {
        /// File path.
        path: String,
        /// I/O error message.
        reason: String,
    },
    /// A config file was not valid TOML for this schema.
    #[error("failed to parse TOML config: {0}")]
    Toml(String),
}

/// Durations for each [`TerminationTimeoutKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationConfig {
    /// Wait for [`TerminationTimeoutKind::Default`].
    pub default_timeout: Duration,
    /// Wait for [`TerminationTimeoutKind::Short`].
    pub short_timeout: Duration,
    /// Wait for [`TerminationTimeoutKind::Long`].
    pub long_timeout: Duration,
    /// Wait for [`TerminationTimeoutKind::ExtraLong`].
    pub extra_long_timeout: Duration,
}

impl TerminationConfig {
    /// Built-in durations.
    pub const DEFAULT: Self = Self {
        default_timeout: Duration::from_millis(500),
        short_timeout: Duration::from_millis(250),
        long_timeout: Duration::from_secs(5),
        extra_long_timeout: Duration::from_secs(30),
    };

    /// Returns the wait for `kind`.
    #[must_use]
    pub const fn timeout_for(&self, kind: TerminationTimeoutKind) -> Duration {
        match kind {
            TerminationTimeoutKind::Default => self.default_timeout,
            TerminationTimeoutKind::Short => self.short_timeout,
            TerminationTimeoutKind::Long => self.long_timeout,
            TerminationTimeoutKind::ExtraLong => self.extra_long_timeout,
        }
    }

    /// Replaces the wait for `kind`.
    #[must_use]
    pub const fn with_timeout(mut self, kind: TerminationTimeoutKind, timeout: Duration) -> Self {
        match kind {
            TerminationTimeoutKind::Default => self.default_timeout = timeout,
            TerminationTimeoutKind::Short => self.short_timeout = timeout,
            TerminationTimeoutKind::Long => self.long_timeout = timeout,
            TerminationTimeoutKind::ExtraLong => self.extra_long_timeout = timeout,
        }
        self
    }

    /// Builds a config from the defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

static GLOBAL: RwLock<TerminationConfig> = parking_lot::const_rwlock(TerminationConfig::DEFAULT);

/// Returns the process-wide termination config.
#[must_use]
pub fn global() -> TerminationConfig {
    *GLOBAL.read()
}

/// Replaces the process-wide termination config.
pub fn set_global(config: TerminationConfig) {
    *GLOBAL.write() = config;
}

/// Replaces one duration of the process-wide termination config.
pub fn set_timeout(kind: TerminationTimeoutKind, timeout: Duration) {
    let mut guard = GLOBAL.write();
    *guard = guard.with_timeout(kind, timeout);
}

/// Apply environment variable overrides to a [`TerminationConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut TerminationConfig) -> Result<(), ConfigError> {
    apply_overrides_from(config, read_env)
}

/// Same as [`apply_env_overrides`], reading variables through `lookup`.
pub fn apply_overrides_from<F>(config: &mut TerminationConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let vars = [
        (ENV_TERMINATION_TIMEOUT_MS, TerminationTimeoutKind::Default),
        (ENV_SHORT_TIMEOUT_MS, TerminationTimeoutKind::Short),
        (ENV_LONG_TIMEOUT_MS, TerminationTimeoutKind::Long),
        (ENV_EXTRA_LONG_TIMEOUT_MS, TerminationTimeoutKind::ExtraLong),
    ];
    for (var, kind) in vars {
        if let Some(val) = lookup(var) {
            let millis = parse_millis(var, &val)?;
            *config = config.with_timeout(kind, Duration::from_millis(millis));
        }
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_millis(var_name: &str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidEnv {
            var: var_name.to_string(),
            value: val.to_string(),
            reason: e.to_string(),
        })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable termination configuration.
///
/// ```toml
/// [termination]
/// default_ms = 500
/// short_ms = 250
/// long_ms = 5000
/// extra_long_ms = 30000
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct LifetimesTomlConfig {
    /// Termination timeouts.
    #[serde(default)]
    pub termination: TerminationToml,
}

/// `[termination]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct TerminationToml {
    /// Default timeout in milliseconds.
    pub default_ms: Option<u64>,
    /// Short timeout in milliseconds.
    pub short_ms: Option<u64>,
    /// Long timeout in milliseconds.
    pub long_ms: Option<u64>,
    /// Extra-long timeout in milliseconds.
    pub extra_long_ms: Option<u64>,
}

/// Apply a parsed TOML config to a [`TerminationConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut TerminationConfig, toml: &LifetimesTomlConfig) {
    let section = &toml.termination;
    let fields = [
        (section.default_ms, TerminationTimeoutKind::Default),
        (section.short_ms, TerminationTimeoutKind::Short),
        (section.long_ms, TerminationTimeoutKind::Long),
        (section.extra_long_ms, TerminationTimeoutKind::ExtraLong),
    ];
    for (millis, kind) in fields {
        if let Some(ms) = millis {
            *config = config.with_timeout(kind, Duration::from_millis(ms));
        }
    }
}

/// Parse a TOML string into a [`LifetimesTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<LifetimesTomlConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::Toml(e.to_string()))
}

/// Read and parse a TOML file into a [`LifetimesTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<LifetimesTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_toml_str(&content)
}

// =========================================================================
// Tests
// =========================================================================
