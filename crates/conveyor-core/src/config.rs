//! Worker configuration loading.
//!
//! Configuration is resolved in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. TOML config file
//! 3. Environment variables: `CONVEYOR_*`
//!
//! CLI flags, where the binary exposes them, override all of the above.

use std::{env, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{identity::ServiceName, Error, Result};

/// Default claim RPC wait budget in seconds.
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 30;

/// Default sleep before restarting the consume cycle after a transport
/// failure, in seconds.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Default bounded prefetch for the work-queue consumer.
pub const DEFAULT_PREFETCH: u16 = 10;

/// Settings for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Broker URL (`memory://` selects the in-process broker)
    pub broker_url: String,
    /// Service this worker belongs to
    pub service_name: String,
    /// Claim RPC wait budget
    pub claim_timeout_secs: u64,
    /// Sleep before restarting the consume cycle after a transport failure
    pub reconnect_delay_secs: u64,
    /// Bounded prefetch for the work-queue consumer
    pub prefetch: u16,
    /// Optional per-message TTL applied to published messages
    pub message_ttl_secs: Option<u64>,
    /// Optional interval for periodic service re-announcement
    pub announce_interval_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://local".to_string(),
            service_name: "conveyor".to_string(),
            claim_timeout_secs: DEFAULT_CLAIM_TIMEOUT_SECS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            prefetch: DEFAULT_PREFETCH,
            message_ttl_secs: None,
            announce_interval_secs: None,
        }
    }
}

impl WorkerConfig {
    /// Parse a config from TOML text, on top of the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| Error::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `CONVEYOR_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = env::var("CONVEYOR_BROKER_URL") {
            self.broker_url = url;
        }
        if let Ok(name) = env::var("CONVEYOR_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(secs) = env_u64("CONVEYOR_CLAIM_TIMEOUT_SECS")? {
            self.claim_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("CONVEYOR_RECONNECT_DELAY_SECS")? {
            self.reconnect_delay_secs = secs;
        }
        if let Some(count) = env_u64("CONVEYOR_PREFETCH")? {
            self.prefetch = u16::try_from(count)
                .map_err(|_| Error::InvalidConfig(format!("prefetch {count} out of range")))?;
        }
        if let Some(secs) = env_u64("CONVEYOR_MESSAGE_TTL_SECS")? {
            self.message_ttl_secs = Some(secs);
        }
        if let Some(secs) = env_u64("CONVEYOR_ANNOUNCE_INTERVAL_SECS")? {
            self.announce_interval_secs = Some(secs);
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate field values and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        ServiceName::parse(self.service_name.clone())?;
        if self.claim_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "claim_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed service name.
    pub fn service(&self) -> Result<ServiceName> {
        ServiceName::parse(self.service_name.clone())
    }

    /// Claim RPC wait budget as a duration
    #[must_use]
    pub const fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    /// Post-failure reconnect delay as a duration
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Per-message TTL in milliseconds, if configured
    #[must_use]
    pub fn message_ttl_ms(&self) -> Option<u64> {
        self.message_ttl_secs.map(|secs| secs * 1000)
    }

    /// Periodic announce interval, if configured
    #[must_use]
    pub fn announce_interval(&self) -> Option<Duration> {
        self.announce_interval_secs.map(Duration::from_secs)
    }
}

/// Read an integer environment variable, treating unset as `None`.
fn env_u64(key: &str) -> Result<Option<u64>> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key} must be an integer, got '{value}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    fn clear_env() {
        for key in [
            "CONVEYOR_BROKER_URL",
            "CONVEYOR_SERVICE_NAME",
            "CONVEYOR_CLAIM_TIMEOUT_SECS",
            "CONVEYOR_RECONNECT_DELAY_SECS",
            "CONVEYOR_PREFETCH",
            "CONVEYOR_MESSAGE_TTL_SECS",
            "CONVEYOR_ANNOUNCE_INTERVAL_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.broker_url, "memory://local");
        assert_eq!(config.claim_timeout_secs, DEFAULT_CLAIM_TIMEOUT_SECS);
        assert_eq!(config.reconnect_delay_secs, DEFAULT_RECONNECT_DELAY_SECS);
        assert_eq!(config.prefetch, DEFAULT_PREFETCH);
        assert!(config.message_ttl_secs.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WorkerConfig::from_toml_str(
            r#"
            service_name = "reports"
            claim_timeout_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.service_name, "reports");
        assert_eq!(config.claim_timeout_secs, 10);
        assert_eq!(config.reconnect_delay_secs, DEFAULT_RECONNECT_DELAY_SECS);
    }

    #[test]
    fn test_zero_claim_timeout_rejected() {
        let result = WorkerConfig::from_toml_str("claim_timeout_secs = 0");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_service_name_rejected() {
        let result = WorkerConfig::from_toml_str(r#"service_name = "a.b""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "service_name = \"reports\"").unwrap();
        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.service_name, "reports");
    }

    #[test]
    fn test_load_missing_file_is_invalid_config() {
        let result = WorkerConfig::load(Path::new("/nonexistent/conveyor.toml"));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides_beat_file_values() {
        clear_env();
        env::set_var("CONVEYOR_SERVICE_NAME", "overridden");
        env::set_var("CONVEYOR_CLAIM_TIMEOUT_SECS", "7");
        let config = WorkerConfig::from_toml_str(r#"service_name = "reports""#)
            .unwrap()
            .with_env_overrides()
            .unwrap();
        assert_eq!(config.service_name, "overridden");
        assert_eq!(config.claim_timeout_secs, 7);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_non_numeric_env_value_is_error() {
        clear_env();
        env::set_var("CONVEYOR_CLAIM_TIMEOUT_SECS", "soon");
        let result = WorkerConfig::default().with_env_overrides();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn test_message_ttl_converted_to_millis() {
        let config = WorkerConfig {
            message_ttl_secs: Some(90),
            ..WorkerConfig::default()
        };
        assert_eq!(config.message_ttl_ms(), Some(90_000));
    }
}
