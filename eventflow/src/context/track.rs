//! Track id keys and helpers.
//!
//! Track ids are correlation values carried by every execution. Keys under
//! `track.` are propagated to written stream messages and peer calls; keys
//! under `stream.` describe where a consumed message came from.

use std::collections::BTreeMap;

use crate::utils::{generate_id, iso_timestamp};

/// Map of track id keys to values.
pub type TrackIds = BTreeMap<String, String>;

/// Request id assigned when a request enters the engine.
pub const REQUEST_ID: &str = "track.request_id";
/// Time the request entered the engine.
pub const REQUEST_TS: &str = "track.request_ts";
/// Operation id shared by every stage of one logical operation.
pub const OPERATION_ID: &str = "track.operation_id";
/// Session id, when the caller provides one.
pub const SESSION_ID: &str = "track.session_id";

/// Stream a consumed message was read from.
pub const STREAM_NAME: &str = "stream.name";
/// Id of the consumed message.
pub const STREAM_MSG_ID: &str = "stream.msg_id";
/// Consumer group that read the message.
pub const STREAM_CONSUMER_GROUP: &str = "stream.consumer_group";
/// Time the message was submitted.
pub const STREAM_SUBMIT_TS: &str = "stream.submit_ts";
/// Business timestamp attached by the writer.
pub const STREAM_EVENT_TS: &str = "stream.event_ts";
/// Time the message was read.
pub const STREAM_READ_TS: &str = "stream.read_ts";

const TRACK_PREFIX: &str = "track.";
const HEADER_PREFIX: &str = "x-track-";

/// Fills in request tracking ids that are not already present.
pub fn ensure_request_tracking(track_ids: &mut TrackIds) {
    track_ids
        .entry(REQUEST_ID.to_string())
        .or_insert_with(generate_id);
    track_ids
        .entry(REQUEST_TS.to_string())
        .or_insert_with(iso_timestamp);
    track_ids
        .entry(OPERATION_ID.to_string())
        .or_insert_with(generate_id);
}

/// Returns only the `track.` ids, the ones that travel with an operation.
#[must_use]
pub fn propagated(track_ids: &TrackIds) -> TrackIds {
    track_ids
        .iter()
        .filter(|(key, _)| key.starts_with(TRACK_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Converts a track key (`track.request_id`) into a header name (`x-track-request-id`).
#[must_use]
pub fn header_name(track_key: &str) -> String {
    let suffix = track_key.strip_prefix(TRACK_PREFIX).unwrap_or(track_key);
    format!("{HEADER_PREFIX}{}", suffix.replace('_', "-"))
}

/// Converts a header name back into a track key, if it is a track header.
#[must_use]
pub fn track_key(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    lower
        .strip_prefix(HEADER_PREFIX)
        .filter(|suffix| !suffix.is_empty())
        .map(|suffix| format!("{TRACK_PREFIX}{}", suffix.replace('-', "_")))
}

/// Builds the headers to forward for the given track ids.
#[must_use]
pub fn to_headers(track_ids: &TrackIds) -> Vec<(String, String)> {
    track_ids
        .iter()
        .filter(|(key, _)| key.starts_with(TRACK_PREFIX))
        .map(|(key, value)| (header_name(key), value.clone()))
        .collect()
}

/// Extracts track ids from request headers, keeping only configured keys
/// plus the request and session ids.
#[must_use]
pub fn from_headers<'a, I>(headers: I, configured: &[String]) -> TrackIds
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter_map(|(name, value)| track_key(name).map(|key| (key, value.to_string())))
        .filter(|(key, _)| {
            key == REQUEST_ID || key == SESSION_ID || configured.iter().any(|c| c == key)
        })
        .collect()
}
