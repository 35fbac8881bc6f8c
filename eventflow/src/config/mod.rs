//! Already-parsed application configuration.
//!
//! Config objects deserialize from JSON with defaults for every optional
//! field. Reading files and substituting environment variables happens
//! before these types are involved.

mod app;
mod connection;
mod event;

use std::time::Duration;

pub use app::{app_key, auto_path_version, AppConfig, AppDescriptor, EngineSettings};
pub use connection::AppConnection;
pub use event::{
    queue_stream_name, EventConnection, EventDescriptor, EventSettings, EventStreamConfig,
    EventType, QueueStrategy, ReadStreamDescriptor, WriteStreamDescriptor, AUTO,
};

/// Converts configured seconds to a `Duration`, saturating out-of-range values.
///
/// Negative and NaN values become zero; values too large for a `Duration`
/// become `Duration::MAX`. [`AppConfig::validate`] rejects both.
pub(crate) fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Whether `value` is a usable number of seconds.
pub(crate) fn valid_seconds(value: f64) -> bool {
    value >= 0.0 && Duration::try_from_secs_f64(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_saturate() {
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(1e20), Duration::MAX);
        assert_eq!(seconds(f64::INFINITY), Duration::MAX);
    }

    #[test]
    fn test_valid_seconds() {
        assert!(valid_seconds(0.0));
        assert!(valid_seconds(30.0));
        assert!(!valid_seconds(-0.5));
        assert!(!valid_seconds(f64::NAN));
        assert!(!valid_seconds(1e20));
    }
}
