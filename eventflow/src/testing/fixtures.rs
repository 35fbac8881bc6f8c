//! Ready-made configuration and contexts for tests.

use crate::config::{AppConfig, AppDescriptor, EngineSettings};
use crate::context::{EventContext, TrackIds};
use crate::retry::{JitterStrategy, RetryConfig};

/// App name used by [`test_app_config`].
pub const TEST_APP_NAME: &str = "test-app";

/// App version used by [`test_app_config`].
pub const TEST_APP_VERSION: &str = "1.0";

/// Engine settings with short polls and fast, jitter-free stream backoff.
#[must_use]
pub fn test_engine_settings() -> EngineSettings {
    EngineSettings {
        read_stream_timeout: 20,
        read_stream_interval: 10,
        stream_backoff: RetryConfig::new()
            .with_max_attempts(usize::MAX)
            .with_base_delay_ms(10)
            .with_max_delay_ms(80)
            .with_jitter_ms(0)
            .with_jitter(JitterStrategy::None),
        ..EngineSettings::default()
    }
}

/// An app config with no events and [`test_engine_settings`].
#[must_use]
pub fn test_app_config() -> AppConfig {
    AppConfig::new(AppDescriptor::new(TEST_APP_NAME, TEST_APP_VERSION))
        .with_engine(test_engine_settings())
}

/// A request context for `event_name` of the test app.
#[must_use]
pub fn test_context(event_name: &str) -> EventContext {
    EventContext::for_request(test_app_config().app_key(), event_name, TrackIds::new())
}
