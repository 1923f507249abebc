//! Timing and recovery settings for [`ServiceController`](crate::controller::ServiceController).
//!
//! The defaults are the values the operations have always used. A configuration can be read
//! from TOML, where every duration is written in whole milliseconds or seconds:
//!
//! ```toml
//! stop_timeout_ms = 10000
//! poll_interval_ms = 300
//! rollback_on_recovery_failure = true
//!
//! [recovery]
//! restart_count = 3
//! restart_delay_ms = 15000
//! reset_period_secs = 60
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::recovery::RecoveryPolicy;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// How long `stop` waits for the service to report [`Stopped`](crate::ServiceState::Stopped).
    #[serde(rename = "stop_timeout_ms", with = "duration_ms")]
    pub stop_timeout: Duration,

    /// Pause between two status reads while waiting for a service to stop.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Restart policy installed by `create` and `set_recovery_actions`.
    pub recovery: RecoveryPolicy,

    /// Delete a freshly created service again when its recovery policy cannot be installed.
    pub rollback_on_recovery_failure: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            recovery: RecoveryPolicy::default(),
            rollback_on_recovery_failure: true,
        }
    }
}

impl ControlConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.poll_interval > self.stop_timeout {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must not exceed stop_timeout_ms".into(),
            ));
        }
        self.recovery.validate()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(300));
        assert_eq!(config.recovery.restart_count, 3);
        assert_eq!(config.recovery.restart_delay, Duration::from_secs(15));
        assert_eq!(config.recovery.reset_period, Duration::from_secs(60));
        assert!(config.rollback_on_recovery_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let config = ControlConfig::from_toml_str(
            "stop_timeout_ms = 500\npoll_interval_ms = 10\n[recovery]\nrestart_count = 1\n",
        )
        .unwrap();
        assert_eq!(config.stop_timeout, Duration::from_millis(500));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.recovery.restart_count, 1);
        assert_eq!(config.recovery.restart_delay, Duration::from_secs(15));
        assert!(config.rollback_on_recovery_failure);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let error = ControlConfig::from_toml_str("stop_timeout = 5\n").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn test_poll_interval_must_fit_timeout() {
        let error = ControlConfig::from_toml_str("poll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error =
            ControlConfig::from_toml_str("stop_timeout_ms = 100\npoll_interval_ms = 200\n")
                .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_serialized_config_reads_back() {
        let config = ControlConfig {
            stop_timeout: Duration::from_secs(2),
            ..ControlConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("stop_timeout_ms = 2000"));
        assert_eq!(ControlConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rollback_on_recovery_failure = false").unwrap();

        let config = ControlConfig::load(file.path()).unwrap();
        assert!(!config.rollback_on_recovery_failure);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            ControlConfig::load(missing),
            Err(ConfigError::Read { .. })
        ));
    }
}
