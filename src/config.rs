use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// One day, the length of every rolling spending window.
pub const DAY_SECS: u64 = 86_400;

/// Session expiries closer than this to the grant time are rejected, so a
/// block producer cannot skew a key across its own expiry boundary.
pub const MIN_SESSION_EXPIRY_BUFFER_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub spending: SpendingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SessionConfig {
    /// Length of a session-key spending window
    pub window_secs: u64,
    /// Minimum distance between grant time and expiry
    pub min_expiry_buffer_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SpendingConfig {
    pub window_secs: u64,
    /// Longest owner bypass that can be enabled at once
    pub max_bypass_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub timelock_secs: u64,
    pub enrollment_delay_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_secs: DAY_SECS,
            min_expiry_buffer_secs: MIN_SESSION_EXPIRY_BUFFER_SECS,
        }
    }
}

impl Default for SpendingConfig {
    fn default() -> Self {
        Self { window_secs: DAY_SECS, max_bypass_secs: DAY_SECS }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timelock_secs: 2 * DAY_SECS,
            enrollment_delay_secs: DAY_SECS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            spending: SpendingConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.window_secs == 0 || self.spending.window_secs == 0 {
            return Err(ConfigError::Invalid("window length must be non-zero".to_string()));
        }
        if self.session.min_expiry_buffer_secs < MIN_SESSION_EXPIRY_BUFFER_SECS {
            return Err(ConfigError::Invalid(format!(
                "session expiry buffer must be at least {}s",
                MIN_SESSION_EXPIRY_BUFFER_SECS
            )));
        }
        if self.spending.max_bypass_secs > DAY_SECS {
            return Err(ConfigError::Invalid("owner bypass cannot exceed 24h".to_string()));
        }
        if self.recovery.timelock_secs == 0 {
            return Err(ConfigError::Invalid("recovery timelock must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Load from `path`, or write and return the defaults when the file is missing.
    /// A present but invalid file is an error rather than a silent fallback.
    pub fn load_or_default(path: &str) -> Result<Self, ConfigError> {
        if std::path::Path::new(path).exists() {
            let s = std::fs::read_to_string(path)?;
            let config = Self::from_toml_str(&s)?;
            info!("Config loaded from {}", path);
            Ok(config)
        } else {
            warn!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            match toml::to_string_pretty(&config) {
                Ok(s) => {
                    if let Err(e) = std::fs::write(path, s) {
                        warn!("Could not write default config: {}", e);
                    }
                }
                Err(e) => warn!("Could not serialize default config: {}", e),
            }
            Ok(config)
        }
    }
}

/// Install a global `tracing` subscriber filtered by `RUST_LOG`, falling back
/// to the configured level. Returns false if a subscriber was already set.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Subscriber for unit tests: output goes through the test harness capture.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recovery.timelock_secs, 172_800);
        assert_eq!(config.session.min_expiry_buffer_secs, 60);
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [recovery]
            timelock_secs = 3600
            enrollment_delay_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.recovery.timelock_secs, 3600);
        assert_eq!(config.spending, SpendingConfig::default());
    }

    #[test]
    fn test_rejects_long_bypass_and_short_buffer() {
        let err = EngineConfig::from_toml_str(
            r#"
            [spending]
            window_secs = 86400
            max_bypass_secs = 90000
            "#,
        );
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.session.min_expiry_buffer_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_writes_file() {
        let path = std::env::temp_dir().join(format!("compass-account-{}.toml", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);

        let first = EngineConfig::load_or_default(&path_str).unwrap();
        assert!(path.exists());
        let second = EngineConfig::load_or_default(&path_str).unwrap();
        assert_eq!(first, second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let logging = LoggingConfig::default();
        init_tracing(&logging);
        assert!(!init_tracing(&logging));
    }
}
