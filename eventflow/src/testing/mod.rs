//! Test doubles and fixtures for engine tests.

mod fixtures;
mod mocks;

pub use fixtures::{
    test_app_config, test_context, test_engine_settings, TEST_APP_NAME, TEST_APP_VERSION,
};
pub use mocks::{FlakyStreamManager, MockTransport, RecordingStep};
