//! Per-execution event context.

use serde_json::Value;
use std::sync::Arc;

use super::track::{self, TrackIds};
use crate::utils::{now_utc, Timestamp};

#[derive(Debug, Clone)]
struct ContextData {
    app_key: String,
    event_name: String,
    created: Timestamp,
    track_ids: TrackIds,
    auth_info: Value,
}

/// Identity and correlation data for one execution.
///
/// Cloning is cheap; clones share data until [`EventContext::set_auth_info`]
/// is called on one of them.
#[derive(Debug, Clone)]
pub struct EventContext {
    inner: Arc<ContextData>,
}

impl EventContext {
    /// Creates a context for `event_name` of the app identified by `app_key`.
    #[must_use]
    pub fn new(app_key: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::with_track_ids(app_key, event_name, TrackIds::new(), Value::Null)
    }

    /// Creates a context from existing track ids and auth info.
    #[must_use]
    pub fn with_track_ids(
        app_key: impl Into<String>,
        event_name: impl Into<String>,
        track_ids: TrackIds,
        auth_info: Value,
    ) -> Self {
        Self {
            inner: Arc::new(ContextData {
                app_key: app_key.into(),
                event_name: event_name.into(),
                created: now_utc(),
                track_ids,
                auth_info,
            }),
        }
    }

    /// Creates a context for an incoming request, assigning request tracking ids.
    #[must_use]
    pub fn for_request(
        app_key: impl Into<String>,
        event_name: impl Into<String>,
        mut track_ids: TrackIds,
    ) -> Self {
        track::ensure_request_tracking(&mut track_ids);
        Self::with_track_ids(app_key, event_name, track_ids, Value::Null)
    }

    /// The application key (`name.version`).
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.inner.app_key
    }

    /// The event name, including any stage suffix.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.inner.event_name
    }

    /// When this context was created.
    #[must_use]
    pub fn created(&self) -> Timestamp {
        self.inner.created
    }

    /// All track ids.
    #[must_use]
    pub fn track_ids(&self) -> &TrackIds {
        &self.inner.track_ids
    }

    /// A single track id.
    #[must_use]
    pub fn track_id(&self, key: &str) -> Option<&str> {
        self.inner.track_ids.get(key).map(String::as_str)
    }

    /// The request id, if assigned.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.track_id(track::REQUEST_ID)
    }

    /// Authentication info resolved for this execution.
    #[must_use]
    pub fn auth_info(&self) -> &Value {
        &self.inner.auth_info
    }

    /// Replaces the authentication info. This is the only mutation a context allows.
    pub fn set_auth_info(&mut self, auth_info: Value) {
        Arc::make_mut(&mut self.inner).auth_info = auth_info;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_for_request_assigns_ids() {
        let ctx = EventContext::for_request("app.1x0", "query", TrackIds::new());
        assert_eq!(ctx.app_key(), "app.1x0");
        assert_eq!(ctx.event_name(), "query");
        assert!(ctx.request_id().is_some());
        assert!(ctx.track_id(track::OPERATION_ID).is_some());
        assert_eq!(ctx.auth_info(), &Value::Null);
    }

    #[test]
    fn test_set_auth_info_does_not_leak_into_clones() {
        let original = EventContext::new("app.1x0", "query");
        let mut copy = original.clone();
        copy.set_auth_info(json!({"user": "alice"}));

        assert_eq!(original.auth_info(), &Value::Null);
        assert_eq!(copy.auth_info()["user"], "alice");
        assert_eq!(copy.created(), original.created());
    }
}
