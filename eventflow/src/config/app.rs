//! Application-level configuration.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::connection::AppConnection;
use super::event::{EventDescriptor, EventType};
use crate::compression::Compression;
use crate::errors::{ConfigurationError, ContractErrorInfo, EngineError, EngineResult};
use crate::payload::Serialization;
use crate::retry::RetryConfig;

/// Builds the key identifying `name` at `version`: dots in the version become `x`.
#[must_use]
pub fn app_key(name: &str, version: &str) -> String {
    format!("{name}.{}", auto_path_version(version))
}

/// Version with dots replaced, as used in keys and routes.
#[must_use]
pub fn auto_path_version(version: &str) -> String {
    version.replace('.', "x")
}

/// Name and version of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

impl AppDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// The app key (`name.1x0`).
    #[must_use]
    pub fn app_key(&self) -> String {
        app_key(&self.name, &self.version)
    }
}

fn default_read_stream_timeout() -> u64 {
    1000
}

fn default_read_stream_interval() -> u64 {
    1000
}

fn default_stream_backoff() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(usize::MAX)
        .with_base_delay_ms(1000)
        .with_max_delay_ms(30_000)
        .with_jitter_ms(1000)
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Poll timeout of a stream read in milliseconds.
    #[serde(default = "default_read_stream_timeout")]
    pub read_stream_timeout: u64,
    /// Pause between read cycles that returned nothing, in milliseconds.
    #[serde(default = "default_read_stream_interval")]
    pub read_stream_interval: u64,
    /// Compression used when an event does not set one.
    #[serde(default)]
    pub default_stream_compression: Compression,
    /// Serialization used when an event does not set one.
    #[serde(default)]
    pub default_stream_serialization: Serialization,
    /// Extra track keys accepted from request headers.
    #[serde(default)]
    pub track_headers: Vec<String>,
    /// Backoff applied by stream loops on transport errors.
    #[serde(default = "default_stream_backoff")]
    pub stream_backoff: RetryConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_stream_timeout: default_read_stream_timeout(),
            read_stream_interval: default_read_stream_interval(),
            default_stream_compression: Compression::default(),
            default_stream_serialization: Serialization::default(),
            track_headers: Vec::new(),
            stream_backoff: default_stream_backoff(),
        }
    }
}

impl EngineSettings {
    /// Read poll timeout.
    #[must_use]
    pub const fn read_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.read_stream_timeout)
    }

    /// Idle interval between empty read cycles.
    #[must_use]
    pub const fn read_stream_interval(&self) -> Duration {
        Duration::from_millis(self.read_stream_interval)
    }
}

/// Parsed configuration of one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application identity.
    pub app: AppDescriptor,
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Peer applications this app may call.
    #[serde(default)]
    pub app_connections: IndexMap<String, AppConnection>,
    /// Events in declaration order.
    #[serde(default)]
    pub events: IndexMap<String, EventDescriptor>,
}

impl AppConfig {
    /// Creates a config with no events.
    #[must_use]
    pub fn new(app: AppDescriptor) -> Self {
        Self {
            app,
            engine: EngineSettings::default(),
            app_connections: IndexMap::new(),
            events: IndexMap::new(),
        }
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::configuration(format!("invalid app config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the engine settings.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineSettings) -> Self {
        self.engine = engine;
        self
    }

    /// Adds an event.
    #[must_use]
    pub fn with_event(mut self, name: impl Into<String>, event: EventDescriptor) -> Self {
        self.events.insert(name.into(), event);
        self
    }

    /// Adds an app connection.
    #[must_use]
    pub fn with_connection(mut self, key: impl Into<String>, connection: AppConnection) -> Self {
        self.app_connections.insert(key.into(), connection);
        self
    }

    /// The app key.
    #[must_use]
    pub fn app_key(&self) -> String {
        self.app.app_key()
    }

    /// Looks up an event.
    #[must_use]
    pub fn event(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.get(name)
    }

    /// Checks cross-references and value ranges that serde cannot.
    pub fn validate(&self) -> EngineResult<()> {
        for (key, conn) in &self.app_connections {
            check_seconds(key, "timeout", conn.timeout)?;
            check_seconds(
                key,
                "circuit_breaker_failure_reset_seconds",
                conn.circuit_breaker_failure_reset_seconds,
            )?;
            check_seconds(key, "circuit_breaker_open_seconds", conn.circuit_breaker_open_seconds)?;
        }
        for (name, event) in &self.events {
            check_seconds(name, "response_timeout", event.config.response_timeout)?;
            check_seconds(name, "stream.timeout", event.config.stream.timeout)?;
            if event.event_type == EventType::Stream && event.read_stream.is_none() {
                return Err(ConfigurationError::new(format!(
                    "STREAM event '{name}' has no read_stream"
                ))
                .with_error_info(
                    ContractErrorInfo::new("CONFIG-001-STREAM", "Stream event without source")
                        .with_context_entry("event", name.as_str()),
                )
                .into());
            }
            for conn in &event.connections {
                if !self.app_connections.contains_key(&conn.app_connection) {
                    return Err(EngineError::configuration(format!(
                        "event '{name}' references unknown app connection '{}'",
                        conn.app_connection
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_seconds(owner: &str, field: &str, value: f64) -> EngineResult<()> {
    if super::valid_seconds(value) {
        return Ok(());
    }
    Err(ConfigurationError::new(format!(
        "'{owner}' has an invalid {field} of {value} seconds"
    ))
    .with_error_info(
        ContractErrorInfo::new("CONFIG-006-DURATION", "Duration out of range")
            .with_fix_hint("Use a non-negative number of seconds that fits a duration.")
            .with_context_entry("owner", owner)
            .with_context_entry("field", field),
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
        "app": {"name": "shop", "version": "1.2"},
        "engine": {"read_stream_timeout": 250, "default_stream_compression": "zstd:1"},
        "app_connections": {
            "inventory": {"name": "inventory", "version": "2.0", "hosts": ["http://h1", "http://h2"]}
        },
        "events": {
            "submit": {"type": "POST", "write_stream": {"name": "orders"}},
            "process": {
                "type": "STREAM",
                "read_stream": {"name": "orders", "consumer_group": "shop.process"},
                "connections": [{"app_connection": "inventory", "event": "reserve", "type": "POST"}]
            }
        }
    }"#;

    #[test]
    fn test_from_json_str() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();

        assert_eq!(config.app_key(), "shop.1x2");
        assert_eq!(config.engine.read_stream_timeout(), Duration::from_millis(250));
        assert_eq!(config.engine.default_stream_compression, Compression::Zstd(1));
        assert_eq!(config.engine.read_stream_interval, 1000);
        assert_eq!(
            config.events.keys().collect::<Vec<_>>(),
            vec!["submit", "process"]
        );
        assert_eq!(config.app_connections["inventory"].hosts.len(), 2);
    }

    #[test]
    fn test_stream_event_requires_read_stream() {
        let json = r#"{"app": {"name": "a", "version": "1"}, "events": {"e": {"type": "STREAM"}}}"#;
        let err = AppConfig::from_json_str(json).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("no read_stream"));
    }

    #[test]
    fn test_unknown_connection_is_rejected() {
        let json = r#"{"app": {"name": "a", "version": "1"}, "events": {"e": {
            "type": "GET", "connections": [{"app_connection": "missing", "event": "x"}]}}}"#;
        assert!(AppConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_app_key_replaces_dots() {
        assert_eq!(app_key("svc", "0.1.2"), "svc.0x1x2");
    }

    #[test]
    fn test_out_of_range_seconds_are_rejected() {
        let json = r#"{"app": {"name": "a", "version": "1"}, "events": {"e": {
            "type": "POST", "config": {"response_timeout": 1e20}}}}"#;
        let err = AppConfig::from_json_str(json).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("response_timeout"));

        let json = r#"{"app": {"name": "a", "version": "1"}, "events": {"e": {
            "type": "POST", "config": {"stream": {"timeout": -1}}}}}"#;
        assert!(AppConfig::from_json_str(json).unwrap_err().is_configuration());

        let json = r#"{"app": {"name": "a", "version": "1"}, "app_connections": {
            "peer": {"name": "peer", "version": "1", "circuit_breaker_open_seconds": 1e300}}}"#;
        let err = AppConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("circuit_breaker_open_seconds"));
    }

    #[test]
    fn test_unvalidated_huge_timeout_saturates() {
        let mut event = EventDescriptor::new(EventType::Post);
        event.config.response_timeout = 1e20;
        assert_eq!(event.config.response_timeout(), Duration::MAX);
    }
}
