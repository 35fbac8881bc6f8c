//! Peer application connection settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};

fn default_retries() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_open_failures() -> u32 {
    5
}

fn default_failure_reset_seconds() -> f64 {
    10.0
}

fn default_open_seconds() -> f64 {
    30.0
}

fn default_timeout() -> f64 {
    10.0
}

/// How to reach a peer application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConnection {
    /// Peer application name.
    pub name: String,
    /// Peer application version.
    pub version: String,
    /// Base URLs of the peer's hosts, in round-robin order.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Retries after the first attempt.
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Failures within the reset window that open a host's circuit; 0 disables it.
    #[serde(default = "default_open_failures")]
    pub circuit_breaker_open_failures: u32,
    /// Window after which a host's failure count resets.
    #[serde(default = "default_failure_reset_seconds")]
    pub circuit_breaker_failure_reset_seconds: f64,
    /// How long an opened host stays ineligible.
    #[serde(default = "default_open_seconds")]
    pub circuit_breaker_open_seconds: f64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

impl AppConnection {
    /// Creates a connection with default resilience settings.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            hosts: Vec::new(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            circuit_breaker_open_failures: default_open_failures(),
            circuit_breaker_failure_reset_seconds: default_failure_reset_seconds(),
            circuit_breaker_open_seconds: default_open_seconds(),
            timeout: default_timeout(),
        }
    }

    /// Sets the host list.
    #[must_use]
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the circuit breaker thresholds.
    #[must_use]
    pub fn with_circuit_breaker(
        mut self,
        open_failures: u32,
        failure_reset_seconds: f64,
        open_seconds: f64,
    ) -> Self {
        self.circuit_breaker_open_failures = open_failures;
        self.circuit_breaker_failure_reset_seconds = failure_reset_seconds;
        self.circuit_breaker_open_seconds = open_seconds;
        self
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        super::seconds(self.timeout)
    }

    /// Retry policy for calls on this connection.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.retries.saturating_add(1))
            .with_base_delay_ms(self.retry_backoff_ms)
            .with_max_delay_ms(self.retry_backoff_ms.saturating_mul(16).max(1))
            .with_jitter_ms(self.retry_backoff_ms / 2)
            .with_backoff(BackoffStrategy::Exponential)
            .with_jitter(JitterStrategy::Additive)
    }
}
