//! Small shared helpers for ids and timestamps.

pub mod timestamps;

pub use timestamps::{format_timestamp, iso_timestamp, now_utc, parse_timestamp, Timestamp};

use uuid::Uuid;

/// Generates a new random id as a string.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generates a time-ordered id as a string, used for stream message keys.
#[must_use]
pub fn generate_ordered_id() -> String {
    Uuid::now_v7().to_string()
}
