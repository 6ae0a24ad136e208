//! Configuration for receivers and in-memory entities.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lease handling settings for a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Interval between periodic renewal ticks. Must be well below the
    /// shortest lock duration in use.
    #[serde(default = "default_renew_interval", with = "humantime_serde")]
    pub renew_interval: Duration,

    /// Renewed expiries further than this beyond now are rejected.
    #[serde(default = "default_max_lock_horizon", with = "humantime_serde")]
    pub max_lock_horizon: Duration,

    /// An accepted session with no delivery for this long is closed.
    #[serde(default = "default_session_idle_timeout", with = "humantime_serde")]
    pub session_idle_timeout: Duration,

    /// Back-off after a failed receive before pulling again.
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,

    /// Abandon a delivery that was pulled but not dispatched when
    /// cancellation was observed, instead of leaving it to expire.
    #[serde(default = "default_abandon_on_cancel")]
    pub abandon_on_cancel: bool,
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(35)
}

fn default_max_lock_horizon() -> Duration {
    Duration::from_secs(3 * 24 * 60 * 60)
}

fn default_session_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_abandon_on_cancel() -> bool {
    true
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renew_interval: default_renew_interval(),
            max_lock_horizon: default_max_lock_horizon(),
            session_idle_timeout: default_session_idle_timeout(),
            error_backoff: default_error_backoff(),
            abandon_on_cancel: default_abandon_on_cancel(),
        }
    }
}

impl LeaseConfig {
    /// Parse a config from TOML. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the receive loop and renewer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.renew_interval.is_zero() {
            return Err(Error::Config("renew_interval must be non-zero".to_string()));
        }
        if self.session_idle_timeout.is_zero() {
            return Err(Error::Config(
                "session_idle_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_lock_horizon <= self.renew_interval {
            return Err(Error::Config(
                "max_lock_horizon must exceed renew_interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    #[must_use]
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_lock_horizon(mut self, horizon: Duration) -> Self {
        self.max_lock_horizon = horizon;
        self
    }

    #[must_use]
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_abandon_on_cancel(mut self, abandon: bool) -> Self {
        self.abandon_on_cancel = abandon;
        self
    }
}

/// Entity settings for the in-memory broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// How long a peek lock (message or session) lasts before renewal.
    #[serde(default = "default_lock_duration", with = "humantime_serde")]
    pub lock_duration: Duration,

    /// Deliveries after which a message is dead-lettered instead of redelivered.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,

    /// Whether every message must carry a session id.
    #[serde(default)]
    pub requires_session: bool,

    /// TTL applied to messages sent without one.
    #[serde(default, with = "humantime_serde")]
    pub default_ttl: Option<Duration>,
}

fn default_lock_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_max_delivery_count() -> u32 {
    10
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: default_lock_duration(),
            max_delivery_count: default_max_delivery_count(),
            requires_session: false,
            default_ttl: None,
        }
    }
}

impl QueueOptions {
    /// Options for a session-enabled entity.
    pub fn with_sessions() -> Self {
        Self {
            requires_session: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    #[must_use]
    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_default_values() {
        let config = LeaseConfig::default();

        assert_eq!(config.renew_interval, Duration::from_secs(35));
        assert_eq!(config.max_lock_horizon, Duration::from_secs(259_200));
        assert_eq!(config.session_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.error_backoff, Duration::from_secs(1));
        assert!(config.abandon_on_cancel);
    }

    #[test]
    fn config_builder_pattern() {
        let config = LeaseConfig::default()
            .with_renew_interval(Duration::from_millis(50))
            .with_session_idle_timeout(Duration::from_millis(200))
            .with_abandon_on_cancel(false);

        assert_eq!(config.renew_interval, Duration::from_millis(50));
        assert_eq!(config.session_idle_timeout, Duration::from_millis(200));
        assert!(!config.abandon_on_cancel);
    }

    #[test]
    fn config_parses_humantime_durations() {
        let config = LeaseConfig::from_toml_str(
            r#"
            renew_interval = "10s"
            max_lock_horizon = "1day"
            "#,
        )
        .unwrap();

        assert_eq!(config.renew_interval, Duration::from_secs(10));
        assert_eq!(config.max_lock_horizon, Duration::from_secs(86_400));
        // Unspecified keys fall back to defaults
        assert_eq!(config.session_idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn config_rejects_malformed_toml() {
        let err = LeaseConfig::from_toml_str("renew_interval = 35").unwrap_err();
        assert!(matches!(err, crate::Error::TomlParse(_)));
    }

    #[test]
    fn config_rejects_zero_renew_interval() {
        let err = LeaseConfig::from_toml_str(r#"renew_interval = "0s""#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn config_rejects_horizon_below_interval() {
        let config = LeaseConfig::default()
            .with_renew_interval(Duration::from_secs(60))
            .with_max_lock_horizon(Duration::from_secs(30));
        assert!(config.validate().is_err());
        assert!(LeaseConfig::default().validate().is_ok());
    }

    #[test]
    fn config_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session_idle_timeout = \"5m\"").unwrap();

        let config = LeaseConfig::load(file.path()).unwrap();
        assert_eq!(config.session_idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn config_load_missing_file_is_io_error() {
        let err = LeaseConfig::load("/nonexistent/leasebus.toml").unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[test]
    fn queue_options_defaults() {
        let options = QueueOptions::default();
        assert_eq!(options.lock_duration, Duration::from_secs(60));
        assert_eq!(options.max_delivery_count, 10);
        assert!(!options.requires_session);
        assert!(options.default_ttl.is_none());

        assert!(QueueOptions::with_sessions().requires_session);
    }
}
