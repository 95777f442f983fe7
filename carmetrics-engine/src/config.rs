use crate::fuel::{DEFAULT_AFR, DEFAULT_FUEL_DENSITY_G_PER_L};
use crate::logger::{DEFAULT_ROW_THRESHOLD, DEFAULT_TABLE_THRESHOLD};
use derive_more::{Display, Error};
use log::{warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a single adapter query timeout
pub const MAX_QUERY_TIMEOUT_MS: u64 = 4500;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[display("failed to parse config {}: {source}", path.display())]
    Parse { path: PathBuf, source: serde_json::Error },
    #[display("invalid config: {_0}")]
    Invalid(#[error(not(source))] String),
}

/// Diagnostic adapter connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Adapter address, `host:port`
    pub port: String,
    /// Serial line rate, for adapters behind a serial bridge
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Per-query timeout (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_baudrate() -> u32 {
    38400
}

const fn default_timeout_ms() -> u64 {
    1000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baudrate: default_baudrate(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TransportConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Cadence periods (ms)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingConfig {
    #[serde(default = "default_fast_ms")]
    pub fast_ms: u64,
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u64,
    #[serde(default = "default_diagnostic_ms")]
    pub diagnostic_ms: u64,
    /// How often the activity log is published
    #[serde(default = "default_activity_ms")]
    pub activity_ms: u64,
}

const fn default_fast_ms() -> u64 {
    100
}

const fn default_slow_ms() -> u64 {
    1000
}

const fn default_diagnostic_ms() -> u64 {
    5000
}

const fn default_activity_ms() -> u64 {
    3000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_ms: default_fast_ms(),
            slow_ms: default_slow_ms(),
            diagnostic_ms: default_diagnostic_ms(),
            activity_ms: default_activity_ms(),
        }
    }
}

/// Durable CSV log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// Rows buffered before they move into the table
    #[serde(default = "default_row_threshold")]
    pub row_threshold: usize,
    /// Table rows accumulated before they are appended to the file
    #[serde(default = "default_table_threshold")]
    pub table_threshold: usize,
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

const fn default_row_threshold() -> usize {
    DEFAULT_ROW_THRESHOLD
}

const fn default_table_threshold() -> usize {
    DEFAULT_TABLE_THRESHOLD
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            row_threshold: default_row_threshold(),
            table_threshold: default_table_threshold(),
        }
    }
}

/// Fuel properties for the consumption estimate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuelConfig {
    #[serde(default = "default_afr")]
    pub afr: f64,
    #[serde(default = "default_density")]
    pub density_g_per_l: f64,
}

const fn default_afr() -> f64 {
    DEFAULT_AFR
}

const fn default_density() -> f64 {
    DEFAULT_FUEL_DENSITY_G_PER_L
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self {
            afr: default_afr(),
            density_g_per_l: default_density(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub transport: TransportConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub fuel: FuelConfig,
    /// Sweep the gauges before live polling starts
    #[serde(default = "default_startup_animation")]
    pub startup_animation: bool,
    /// Consecutive failed slow ticks before the adapter counts as lost
    #[serde(default = "default_max_slow_failures")]
    pub max_slow_failures: u32,
    #[serde(default)]
    pub log_level: LogLevel,
}

const fn default_startup_animation() -> bool {
    true
}

const fn default_max_slow_failures() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig::default(),
            fuel: FuelConfig::default(),
            startup_animation: default_startup_animation(),
            max_slow_failures: default_max_slow_failures(),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Read a JSON config file. The result is not yet validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), |p| Self::load(p))
    }

    /// Check mandatory settings and clamp out-of-range ones
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.transport.port.trim().is_empty() {
            return Err(ConfigError::Invalid("transport.port must be set".into()));
        }
        if self.transport.timeout_ms == 0 {
            return Err(ConfigError::Invalid("transport.timeout_ms must be > 0".into()));
        }
        if self.transport.timeout_ms > MAX_QUERY_TIMEOUT_MS {
            warn!(
                "transport.timeout_ms {} exceeds maximum, clamping to {MAX_QUERY_TIMEOUT_MS}",
                self.transport.timeout_ms
            );
            self.transport.timeout_ms = MAX_QUERY_TIMEOUT_MS;
        }

        let cadences = [
            ("polling.fast_ms", self.polling.fast_ms),
            ("polling.slow_ms", self.polling.slow_ms),
            ("polling.diagnostic_ms", self.polling.diagnostic_ms),
            ("polling.activity_ms", self.polling.activity_ms),
        ];
        if let Some((name, _)) = cadences.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be > 0")));
        }

        if self.logging.row_threshold == 0 {
            return Err(ConfigError::Invalid("logging.row_threshold must be > 0".into()));
        }
        if self.logging.row_threshold > self.logging.table_threshold {
            return Err(ConfigError::Invalid(format!(
                "logging.row_threshold ({}) must not exceed logging.table_threshold ({})",
                self.logging.row_threshold, self.logging.table_threshold
            )));
        }

        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.fuel.afr) || !positive(self.fuel.density_g_per_l) {
            return Err(ConfigError::Invalid("fuel.afr and fuel.density_g_per_l must be > 0".into()));
        }

        if self.max_slow_failures == 0 {
            warn!("max_slow_failures must be at least 1, using 1");
            self.max_slow_failures = 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.transport.port = "192.168.0.10:35000".into();
        config
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.transport.baudrate, 38400);
        assert_eq!(config.transport.timeout_ms, 1000);
        assert_eq!(config.polling, PollingConfig { fast_ms: 100, slow_ms: 1000, diagnostic_ms: 5000, activity_ms: 3000 });
        assert_eq!(config.logging.directory, PathBuf::from("logs"));
        assert_eq!((config.logging.row_threshold, config.logging.table_threshold), (100, 500));
        assert!(config.startup_animation);
        assert_eq!(config.max_slow_failures, 3);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_port_is_mandatory() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut config = valid();
        config.transport.timeout_ms = 60_000;
        config.validate().unwrap();
        assert_eq!(config.transport.timeout_ms, MAX_QUERY_TIMEOUT_MS);
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut config = valid();
        config.polling.slow_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("polling.slow_ms"));
    }

    #[test]
    fn test_row_threshold_cannot_exceed_table() {
        let mut config = valid();
        config.logging.row_threshold = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"transport": {{"port": "127.0.0.1:35000"}}, "polling": {{"fast_ms": 50}}, "log_level": "debug"}}"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.transport.port, "127.0.0.1:35000");
        assert_eq!(config.transport.timeout_ms, 1000);
        assert_eq!(config.polling.fast_ms, 50);
        assert_eq!(config.polling.slow_ms, 1000);
        assert_eq!(config.log_level.as_level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn test_missing_port_in_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"transport": {{}}}}"#).unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unreadable_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));
        assert!(Config::load_or_default(None).is_ok());
    }
}
