//! Backoff and retry utilities.
//!
//! Shared by the stream consumer loop (unbounded retries on transport errors)
//! and the apps client (bounded retries across load-balanced hosts).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter added on top of the computed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// delay + random(0..=jitter_ms), capped at the maximum.
    #[default]
    Additive,
    /// Half fixed, half random.
    Equal,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter_ms() -> u64 {
    250
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one. Ignored by unbounded loops.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the additive jitter in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            backoff_strategy: BackoffStrategy::default(),
            jitter_strategy: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the additive jitter bound.
    #[must_use]
    pub fn with_jitter_ms(mut self, jitter: u64) -> Self {
        self.jitter_ms = jitter;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Consecutive-failure tracking for one retrying operation.
#[derive(Debug, Default, Clone)]
pub struct RetryState {
    /// Consecutive failures so far (0-indexed attempt of the next delay).
    pub attempt: usize,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the attempt counter and returns true if more attempts remain.
    pub fn increment(&mut self, config: &RetryConfig) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt < config.max_attempts
    }

    /// Resets the state after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns true if retries are exhausted.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt >= config.max_attempts
    }

    /// The capped backoff for the current attempt, without jitter.
    ///
    /// Non-decreasing in `attempt` and never above `max_delay_ms`.
    #[must_use]
    pub fn backoff_ms(&self, config: &RetryConfig) -> u64 {
        let base = config.base_delay_ms;
        let attempt = u32::try_from(self.attempt).unwrap_or(u32::MAX);
        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt.min(63)))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt).saturating_add(1)),
            BackoffStrategy::Constant => base,
        };
        delay.min(config.max_delay_ms)
    }

    /// Calculates the jittered delay for the current attempt.
    #[must_use]
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let delay = self.backoff_ms(config);
        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Additive => {
                let extra = if config.jitter_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=config.jitter_ms)
                };
                delay.saturating_add(extra).min(config.max_delay_ms)
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

/// Executes an operation, retrying failures the predicate accepts.
///
/// Gives up after `config.max_attempts` attempts and returns the last error.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut state = RetryState::new();

    loop {
        match operation(state.attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let delay = state.calculate_delay(config);
                if !retryable(&e) || !state.increment(config) {
                    return Err(e);
                }
                tracing::debug!(
                    operation = operation_name,
                    attempt = state.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_jitter(base: u64, max: u64) -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(base)
            .with_max_delay_ms(max)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_retry_config_deserializes_with_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"base_delay_ms": 50}"#).unwrap();
        assert_eq!(config.base_delay_ms, 50);
        assert_eq!(config.max_delay_ms, 10_000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::Additive);
    }

    #[test]
    fn test_retry_state_increment() {
        let config = RetryConfig::new().with_max_attempts(3);
        let mut state = RetryState::new();

        assert!(state.increment(&config));
        assert!(state.increment(&config));
        assert!(!state.increment(&config));
        assert!(state.is_exhausted(&config));

        state.reset();
        assert_eq!(state.attempt, 0);
    }

    #[test]
    fn test_exponential_backoff_is_non_decreasing_then_capped() {
        let config = no_jitter(100, 1000);
        let mut state = RetryState::new();
        let mut delays = Vec::new();
        for attempt in 0..8 {
            state.attempt = attempt;
            delays.push(state.calculate_delay(&config).as_millis());
        }
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000, 1000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let mut state = RetryState::new();
        state.attempt = 2;
        let linear = no_jitter(100, 10_000).with_backoff(BackoffStrategy::Linear);
        assert_eq!(state.backoff_ms(&linear), 300);

        let constant = no_jitter(100, 10_000).with_backoff(BackoffStrategy::Constant);
        state.attempt = 9;
        assert_eq!(state.backoff_ms(&constant), 100);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let config = no_jitter(1000, 5000);
        let state = RetryState {
            attempt: usize::MAX,
        };
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_additive_jitter_stays_in_bounds() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000)
            .with_jitter_ms(50);
        let state = RetryState::new();
        for _ in 0..100 {
            let delay = state.calculate_delay(&config).as_millis();
            assert!((100..=150).contains(&delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_succeeds_after_failures() {
        let calls = AtomicUsize::new(0);
        let config = no_jitter(10, 100).with_max_attempts(5);

        let result: Result<&str, String> = with_retry(
            &config,
            "op",
            |_| true,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("fail {n}"))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_non_retryable() {
        let calls = AtomicUsize::new(0);
        let config = no_jitter(10, 100).with_max_attempts(5);

        let result: Result<(), String> = with_retry(
            &config,
            "op",
            |e: &String| e != "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up() {
        let calls = AtomicUsize::new(0);
        let config = no_jitter(10, 100).with_max_attempts(3);

        let result: Result<(), String> = with_retry(
            &config,
            "op",
            |_| true,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("again".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
