//! Round-robin host selection with a per-host circuit breaker.
//!
//! Shared by the apps client and [`crate::streams::BalancedStreamManager`].
//! Host state is kept in atomics relative to a per-balancer time base, so
//! concurrent callers never block each other. Updates are not linearizable;
//! a stale read only affects which host is picked next.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{self, AppConnection};
use crate::errors::{EngineError, EngineResult};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSettings {
    /// Failures within `failure_reset` that open a host; 0 disables opening.
    pub open_failures: u32,
    /// Quiet period after which the failure count resets.
    pub failure_reset: Duration,
    /// How long an opened host stays ineligible.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            open_failures: 5,
            failure_reset: Duration::from_secs(10),
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerSettings {
    /// Creates settings from explicit values.
    #[must_use]
    pub const fn new(open_failures: u32, failure_reset: Duration, open_duration: Duration) -> Self {
        Self {
            open_failures,
            failure_reset,
            open_duration,
        }
    }

    /// Settings configured on an app connection.
    #[must_use]
    pub fn from_connection(connection: &AppConnection) -> Self {
        Self {
            open_failures: connection.circuit_breaker_open_failures,
            failure_reset: config::seconds(connection.circuit_breaker_failure_reset_seconds),
            open_duration: config::seconds(connection.circuit_breaker_open_seconds),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Observable breaker state of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// No recent failures.
    Closed,
    /// Failures counted, or open period elapsed; still eligible.
    HalfOpen,
    /// Ineligible until the open period elapses.
    Open,
}

#[derive(Debug, Default)]
struct HostState {
    failures: AtomicU32,
    reset_deadline_ms: AtomicU64,
    open_until_ms: AtomicU64,
    opened: AtomicU32,
}

/// Round-robin balancer over `H` with per-host failure tracking.
pub struct CircuitBreakLoadBalancer<H> {
    name: String,
    hosts: Vec<H>,
    states: Vec<HostState>,
    index: AtomicUsize,
    settings: CircuitBreakerSettings,
    base: Instant,
}

impl<H> CircuitBreakLoadBalancer<H> {
    /// Creates a balancer; `name` identifies it in errors and logs.
    #[must_use]
    pub fn new(name: impl Into<String>, hosts: Vec<H>, settings: CircuitBreakerSettings) -> Self {
        let states = hosts.iter().map(|_| HostState::default()).collect();
        Self {
            name: name.into(),
            hosts,
            states,
            index: AtomicUsize::new(0),
            settings,
            base: Instant::now(),
        }
    }

    /// Balancer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of hosts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether there are no hosts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Host at `index`.
    #[must_use]
    pub fn host(&self, index: usize) -> Option<&H> {
        self.hosts.get(index)
    }

    /// All hosts in configured order.
    #[must_use]
    pub fn hosts(&self) -> &[H] {
        &self.hosts
    }

    fn now_ms(&self) -> u64 {
        millis(Instant::now().saturating_duration_since(self.base))
    }

    fn after_ms(now: u64, duration: Duration) -> u64 {
        now.saturating_add(millis(duration))
    }

    fn is_open_at(&self, index: usize, now: u64) -> bool {
        self.states
            .get(index)
            .is_some_and(|s| now < s.open_until_ms.load(Ordering::Acquire))
    }

    /// Whether host `index` is currently eligible.
    #[must_use]
    pub fn is_available(&self, index: usize) -> bool {
        index < self.hosts.len() && !self.is_open_at(index, self.now_ms())
    }

    /// Picks the next eligible host in round-robin order.
    pub fn next_host(&self) -> EngineResult<(usize, &H)> {
        let count = self.hosts.len();
        if count > 0 {
            let now = self.now_ms();
            let start = self.index.fetch_add(1, Ordering::Relaxed);
            for offset in 0..count {
                let index = start.wrapping_add(offset) % count;
                if !self.is_open_at(index, now) {
                    if offset > 0 {
                        // skip the open hosts on the next call as well
                        self.index.fetch_add(offset, Ordering::Relaxed);
                    }
                    return Ok((index, &self.hosts[index]));
                }
            }
        }
        Err(EngineError::NoHostsAvailable {
            connection: self.name.clone(),
            hosts: count,
        })
    }

    /// Records a failed call to host `index`.
    pub fn failure(&self, index: usize) {
        let Some(state) = self.states.get(index) else {
            return;
        };
        let now = self.now_ms();
        if now >= state.reset_deadline_ms.load(Ordering::Acquire) {
            state.failures.store(0, Ordering::Release);
        }
        let failures = state.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        state
            .reset_deadline_ms
            .store(Self::after_ms(now, self.settings.failure_reset), Ordering::Release);

        let threshold = self.settings.open_failures;
        if threshold > 0 && failures >= threshold && !self.is_open_at(index, now) {
            state
                .open_until_ms
                .store(Self::after_ms(now, self.settings.open_duration), Ordering::Release);
            state.opened.store(1, Ordering::Release);
            tracing::warn!(
                balancer = %self.name,
                host_index = index,
                failures,
                open_ms = millis(self.settings.open_duration),
                "Circuit opened"
            );
        }
    }

    /// Records a successful call to host `index`: closes its circuit.
    pub fn success(&self, index: usize) {
        let Some(state) = self.states.get(index) else {
            return;
        };
        state.failures.store(0, Ordering::Release);
        state.reset_deadline_ms.store(0, Ordering::Release);
        state.open_until_ms.store(0, Ordering::Release);
        if state.opened.swap(0, Ordering::AcqRel) == 1 {
            tracing::info!(balancer = %self.name, host_index = index, "Circuit closed");
        }
    }

    /// Current failure count of host `index`, zero once the reset window passed.
    #[must_use]
    pub fn failures(&self, index: usize) -> u32 {
        self.states.get(index).map_or(0, |s| {
            if self.now_ms() >= s.reset_deadline_ms.load(Ordering::Acquire) {
                0
            } else {
                s.failures.load(Ordering::Acquire)
            }
        })
    }

    /// Breaker state of host `index`.
    #[must_use]
    pub fn state(&self, index: usize) -> CircuitState {
        let now = self.now_ms();
        let Some(state) = self.states.get(index) else {
            return CircuitState::Closed;
        };
        if self.is_open_at(index, now) {
            CircuitState::Open
        } else if state.opened.load(Ordering::Acquire) == 1 || self.failures(index) > 0 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }
}

impl<H: fmt::Debug> fmt::Debug for CircuitBreakLoadBalancer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakLoadBalancer")
            .field("name", &self.name)
            .field("hosts", &self.hosts)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(hosts: &[&'static str], threshold: u32) -> CircuitBreakLoadBalancer<&'static str> {
        CircuitBreakLoadBalancer::new(
            "peer",
            hosts.to_vec(),
            CircuitBreakerSettings::new(threshold, Duration::from_secs(10), Duration::from_secs(30)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin() {
        let lb = balancer(&["h1", "h2"], 3);
        let picked: Vec<&str> = (0..3).map(|_| *lb.next_host().unwrap().1).collect();
        assert_eq!(picked, vec!["h1", "h2", "h1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_opens_host_for_open_duration() {
        let lb = balancer(&["h1", "h2"], 2);
        lb.failure(0);
        assert_eq!(lb.state(0), CircuitState::HalfOpen);
        assert!(lb.is_available(0));

        lb.failure(0);
        assert_eq!(lb.state(0), CircuitState::Open);
        for _ in 0..4 {
            assert_eq!(*lb.next_host().unwrap().1, "h2");
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(lb.is_available(0));
        assert_eq!(lb.state(0), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reset_after_window() {
        let lb = balancer(&["h1"], 2);
        lb.failure(0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(lb.failures(0), 0);
        lb.failure(0);
        assert!(lb.is_available(0));
        assert_eq!(lb.failures(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let lb = balancer(&["h1"], 2);
        lb.failure(0);
        lb.failure(0);
        assert!(!lb.is_available(0));
        lb.success(0);
        assert!(lb.is_available(0));
        assert_eq!(lb.state(0), CircuitState::Closed);
        assert_eq!(lb.failures(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_open_is_no_hosts_available() {
        let lb = balancer(&["h1", "h2"], 1);
        lb.failure(0);
        lb.failure(1);
        let err = lb.next_host().unwrap_err();
        assert!(matches!(err, EngineError::NoHostsAvailable { hosts: 2, .. }));

        let empty = balancer(&[], 1);
        assert!(empty.next_host().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_threshold_never_opens() {
        let lb = balancer(&["h1"], 0);
        for _ in 0..10 {
            lb.failure(0);
        }
        assert!(lb.next_host().is_ok());
    }

    #[test]
    fn test_settings_from_connection() {
        let conn = AppConnection::new("peer", "1.0").with_circuit_breaker(3, 2.0, 5.5);
        let settings = CircuitBreakerSettings::from_connection(&conn);
        assert_eq!(settings.open_failures, 3);
        assert_eq!(settings.failure_reset, Duration::from_secs(2));
        assert_eq!(settings.open_duration, Duration::from_millis(5500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_open_duration_keeps_host_open() {
        let conn = AppConnection::new("peer", "1.0")
            .with_hosts(["h1"])
            .with_circuit_breaker(1, 1e20, 1e20);
        let settings = CircuitBreakerSettings::from_connection(&conn);
        assert_eq!(settings.open_duration, Duration::MAX);

        let lb = CircuitBreakLoadBalancer::new("peer", vec!["h1"], settings);
        lb.failure(0);
        assert_eq!(lb.state(0), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(lb.next_host().is_err());
    }
}
