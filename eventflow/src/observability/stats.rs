//! Per-loop throughput and error counters.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Counters kept by a stream or service loop.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    /// Events processed, including failed ones.
    pub total_events: u64,
    /// Events whose processing failed or timed out.
    pub total_errors: u64,
    /// Messages evicted before this consumer could read them.
    pub missed: u64,
    /// Messages that could not be decoded.
    pub decode_errors: u64,
    /// Stream backend errors.
    pub transport_errors: u64,
    /// Recoveries after a backend error episode.
    pub recoveries: u64,
    /// Completed read cycles.
    pub cycles: u64,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    cycle_started: Instant,
    #[serde(skip)]
    cycle_events: u64,
    #[serde(skip)]
    cycle_errors: u64,
}

impl Default for StreamStats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            total_events: 0,
            total_errors: 0,
            missed: 0,
            decode_errors: 0,
            transport_errors: 0,
            recoveries: 0,
            cycles: 0,
            started: now,
            cycle_started: now,
            cycle_events: 0,
            cycle_errors: 0,
        }
    }
}

impl StreamStats {
    /// Creates zeroed stats starting now.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a read cycle.
    pub fn start_cycle(&mut self) {
        self.cycle_started = Instant::now();
        self.cycle_events = 0;
        self.cycle_errors = 0;
    }

    /// Records one processed event.
    pub fn record_event(&mut self, errored: bool) {
        self.total_events += 1;
        self.cycle_events += 1;
        if errored {
            self.total_errors += 1;
            self.cycle_errors += 1;
        }
    }

    /// Records messages reported as missed by the backend.
    pub fn record_missed(&mut self, missed: u64) {
        self.missed += missed;
    }

    /// Records an undecodable message. Also counts as a failed event.
    pub fn record_decode_error(&mut self) {
        self.decode_errors += 1;
        self.record_event(true);
    }

    /// Records a backend error.
    pub fn record_transport_error(&mut self) {
        self.transport_errors += 1;
    }

    /// Records a recovery after backend errors.
    pub fn record_recovery(&mut self) {
        self.recoveries += 1;
    }

    /// Closes the current cycle.
    pub fn end_cycle(&mut self) {
        self.cycles += 1;
    }

    /// Events handled in the current cycle.
    #[must_use]
    pub const fn cycle_events(&self) -> u64 {
        self.cycle_events
    }

    /// Time since the loop started.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Events per second over the current cycle.
    #[must_use]
    pub fn cycle_throughput(&self) -> f64 {
        rate(self.cycle_events, self.cycle_started.elapsed())
    }

    /// Events per second since start.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        rate(self.total_events, self.uptime())
    }

    /// Failed events as a percentage of processed events.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.total_events == 0 {
            0.0
        } else {
            (self.total_errors as f64 / self.total_events as f64) * 100.0
        }
    }

    /// Converts to a JSON object for structured logs.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "total_events": self.total_events,
            "total_errors": self.total_errors,
            "missed": self.missed,
            "decode_errors": self.decode_errors,
            "transport_errors": self.transport_errors,
            "recoveries": self.recoveries,
            "cycles": self.cycles,
            "throughput": (self.throughput() * 100.0).round() / 100.0,
            "error_rate_percent": (self.error_rate() * 100.0).round() / 100.0,
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(events: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        events as f64 / secs
    }
}
