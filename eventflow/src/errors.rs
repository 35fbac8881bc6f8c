//! Error types for the eventflow engine.
//!
//! Every failure the engine surfaces falls into one of a small number of
//! classes: timeouts, stream transport errors, per-message decode errors,
//! step (business) errors, configuration errors and load-balancer exhaustion.
//! Callers branch on the class through the `is_*` helpers rather than by
//! matching on message text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Convenience result alias used across the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// The main error type for eventflow operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configured deadline elapsed before the operation completed.
    #[error("Timed out after {timeout:?}: {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The stream backend is unreachable or returned an error.
    #[error("Stream transport error: {0}")]
    Transport(String),

    /// A stream message could not be mapped to a known datatype.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A step raised while processing a payload.
    #[error("Step '{step}' failed: {source}")]
    Step {
        /// The failing step name.
        step: String,
        /// The underlying business error.
        #[source]
        source: anyhow::Error,
    },

    /// An event or step set is misconfigured.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A collector step group contains a dependency cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A collector sub-step awaited a sibling it did not declare.
    #[error("{0}")]
    UndeclaredDependency(#[from] UndeclaredDependencyError),

    /// A collector sub-step failed; shared by every awaiting sibling.
    #[error("Collector step '{step}' failed: {source}")]
    Collector {
        /// The collector step that failed.
        step: String,
        /// The shared failure.
        #[source]
        source: Arc<EngineError>,
    },

    /// Every host of a load-balanced connection is currently open.
    #[error("No hosts available: all {hosts} host(s) of '{connection}' have open circuits")]
    NoHostsAvailable {
        /// The connection or backend group name.
        connection: String,
        /// Number of configured hosts.
        hosts: usize,
    },

    /// A peer application answered with a non-success status.
    #[error("Client error calling '{route}': status {status}: {message}")]
    Client {
        /// The route that was called.
        route: String,
        /// The HTTP-like status code.
        status: u16,
        /// The response body or reason.
        message: String,
    },

    /// Payload (de)serialization or (de)compression failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Wraps a business error raised by a step.
    #[must_use]
    pub fn step(step: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Step {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Creates a configuration error from a message.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::new(message))
    }

    /// Returns true for deadline errors.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for errors coming from the stream backend itself.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }

    /// Returns true for errors that must stop a loop instead of being retried.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::CycleDetected(_) | Self::UndeclaredDependency(_)
        )
    }

    /// Converts to a dictionary representation for structured logs.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::Timeout { .. } => "Timeout",
            Self::Transport(_) => "Transport",
            Self::Decode(_) => "Decode",
            Self::Step { .. } => "Step",
            Self::Configuration(_) => "Configuration",
            Self::CycleDetected(_) => "CycleDetected",
            Self::UndeclaredDependency(_) => "UndeclaredDependency",
            Self::Collector { .. } => "Collector",
            Self::NoHostsAvailable { .. } => "NoHostsAvailable",
            Self::Client { .. } => "Client",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
        };
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONFIG-002-SPAWN").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when an event, step set or loop is misconfigured.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_info: None,
        }
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// A generator step was found after the first position of a pipeline.
    #[must_use]
    pub fn spawn_not_first(step: &str, position: usize) -> Self {
        Self::new(format!(
            "Spawn step '{step}' found at position {position}: generators are only allowed as the first step"
        ))
        .with_error_info(
            ContractErrorInfo::new("CONFIG-002-SPAWN", "Generator step used mid-pipeline")
                .with_fix_hint("Move the generator to the first step or split the event with a shuffle marker.")
                .with_context_entry("step", step),
        )
    }

    /// A stream or service loop was started while already running.
    #[must_use]
    pub fn already_running(event_name: &str) -> Self {
        Self::new(format!("Event '{event_name}' is already running"))
            .with_error_info(ContractErrorInfo::new(
                "CONFIG-003-RUNNING",
                "Consumer loop started twice",
            ))
    }

    /// An event name is not part of the application.
    #[must_use]
    pub fn unknown_event(event_name: &str) -> Self {
        Self::new(format!("Event '{event_name}' is not defined"))
    }
}

/// Error raised when a cycle is detected between collector steps.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in collector steps: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of steps forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONFIG-004-CYCLE",
            format!("Collector contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the awaited dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a collector step awaits a sibling it did not declare.
#[derive(Debug, Clone, Error)]
#[error("Undeclared dependency: step '{step}' awaited '{key}' which was not declared as a dependency")]
pub struct UndeclaredDependencyError {
    /// The step attempting access.
    pub step: String,
    /// The undeclared sibling.
    pub key: String,
}

impl UndeclaredDependencyError {
    /// Creates a new undeclared dependency error.
    #[must_use]
    pub fn new(step: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            key: key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("step", "my_step");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("step"), Some(&"my_step".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info.code, "CONFIG-004-CYCLE");
    }

    #[test]
    fn test_error_classification() {
        assert!(EngineError::timeout("execute", Duration::from_secs(1)).is_timeout());
        assert!(EngineError::transport("connection refused").is_transport());
        assert!(!EngineError::decode("unknown type").is_transport());
        assert!(EngineError::from(ConfigurationError::already_running("e")).is_configuration());
        assert!(EngineError::from(CycleDetectedError::new(vec![])).is_configuration());
        assert!(!EngineError::step("s", anyhow::anyhow!("boom")).is_configuration());
    }

    #[test]
    fn test_spawn_not_first_info() {
        let err = ConfigurationError::spawn_not_first("produce", 2);
        assert!(err.message.contains("position 2"));
        assert_eq!(err.error_info.map(|i| i.code), Some("CONFIG-002-SPAWN".to_string()));
    }

    #[test]
    fn test_to_dict() {
        let err = EngineError::NoHostsAvailable {
            connection: "peer".to_string(),
            hosts: 2,
        };
        let dict = err.to_dict();
        assert_eq!(dict.get("type").unwrap(), "NoHostsAvailable");
        assert!(dict["message"].as_str().unwrap().contains("peer"));
    }
}
