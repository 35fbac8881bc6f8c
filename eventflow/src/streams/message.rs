//! Broker message unit and its field-level wire form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compression::Compression;
use crate::context::{track, EventContext, TrackIds};
use crate::errors::{EngineError, EngineResult};
use crate::payload::{decode_payload, encode_payload, Payload, Serialization, TypeRegistry};
use crate::utils::{generate_ordered_id, iso_timestamp};

/// One message as stored by a stream backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Message key.
    pub id: String,
    /// Datatype tag of the payload.
    pub datatype: String,
    /// When the message was written.
    pub submit_ts: String,
    /// When the originating event happened, if known.
    pub event_ts: Option<String>,
    /// Track ids travelling with the message.
    pub track_ids: TrackIds,
    /// Base64 of the JSON auth info.
    pub auth_info: String,
    /// Payload serialization.
    pub serialization: Serialization,
    /// Payload compression.
    pub compression: Compression,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Queue the message was written to.
    pub queue: String,
}

/// A consumed message decoded for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Key of the consumed message.
    pub msg_id: String,
    /// Queue the message was written to.
    pub queue: String,
    /// Decoded payload.
    pub payload: Payload,
    /// Track ids carried by the message.
    pub track_ids: TrackIds,
    /// Decoded auth info.
    pub auth_info: Value,
    /// Write time of the message.
    pub submit_ts: String,
    /// Time of the originating event.
    pub event_ts: Option<String>,
    /// When the message was read.
    pub read_ts: String,
    /// Stream the message was read from.
    pub stream: String,
    /// Consumer group that read it.
    pub consumer_group: String,
    /// Index of the backend that served the read, set by balanced managers.
    pub origin: Option<usize>,
}

impl StreamEvent {
    /// Track ids for a context processing this event: the message's
    /// `track.` ids plus stream provenance.
    #[must_use]
    pub fn context_track_ids(&self) -> TrackIds {
        let mut ids = track::propagated(&self.track_ids);
        ids.insert(track::STREAM_NAME.to_string(), self.stream.clone());
        ids.insert(track::STREAM_MSG_ID.to_string(), self.msg_id.clone());
        ids.insert(
            track::STREAM_CONSUMER_GROUP.to_string(),
            self.consumer_group.clone(),
        );
        ids.insert(track::STREAM_SUBMIT_TS.to_string(), self.submit_ts.clone());
        ids.insert(
            track::STREAM_EVENT_TS.to_string(),
            self.event_ts.clone().unwrap_or_default(),
        );
        ids.insert(track::STREAM_READ_TS.to_string(), self.read_ts.clone());
        track::ensure_request_tracking(&mut ids);
        ids
    }

    /// Builds the context for processing this event in `event_name`.
    #[must_use]
    pub fn context(&self, app_key: &str, event_name: &str) -> EventContext {
        EventContext::with_track_ids(
            app_key,
            event_name,
            self.context_track_ids(),
            self.auth_info.clone(),
        )
    }
}

const FIELD_ID: &str = "id";
const FIELD_TYPE: &str = "type";
const FIELD_SUBMIT_TS: &str = "submit_ts";
const FIELD_EVENT_TS: &str = "event_ts";
const FIELD_AUTH_INFO: &str = "auth_info";
const FIELD_SER: &str = "ser";
const FIELD_COMP: &str = "comp";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_QUEUE: &str = "queue";

impl StreamMessage {
    /// Encodes `payload` for writing to `queue` on behalf of `context`.
    ///
    /// The event time is carried over from a consumed message when present.
    pub fn encode(
        payload: &Payload,
        context: &EventContext,
        queue: &str,
        serialization: Serialization,
        compression: Compression,
    ) -> EngineResult<Self> {
        let auth = serde_json::to_vec(context.auth_info())?;
        Ok(Self {
            id: generate_ordered_id(),
            datatype: payload.datatype().to_string(),
            submit_ts: iso_timestamp(),
            event_ts: context
                .track_id(track::STREAM_EVENT_TS)
                .filter(|ts| !ts.is_empty())
                .map(str::to_string),
            track_ids: track::propagated(context.track_ids()),
            auth_info: STANDARD.encode(auth),
            serialization,
            compression,
            payload: encode_payload(payload, serialization, compression)?,
            queue: queue.to_string(),
        })
    }

    /// Decodes the payload and auth info of a message read from `stream` by `consumer_group`.
    pub fn decode(
        &self,
        stream: &str,
        consumer_group: &str,
        registry: &TypeRegistry,
    ) -> EngineResult<StreamEvent> {
        let payload = decode_payload(
            &self.payload,
            self.serialization,
            self.compression,
            &self.datatype,
            registry,
        )?;
        Ok(StreamEvent {
            msg_id: self.id.clone(),
            queue: self.queue.clone(),
            payload,
            track_ids: self.track_ids.clone(),
            auth_info: self.decode_auth_info()?,
            submit_ts: self.submit_ts.clone(),
            event_ts: self.event_ts.clone(),
            read_ts: iso_timestamp(),
            stream: stream.to_string(),
            consumer_group: consumer_group.to_string(),
            origin: None,
        })
    }

    fn decode_auth_info(&self) -> EngineResult<Value> {
        if self.auth_info.is_empty() {
            return Ok(Value::Null);
        }
        let raw = STANDARD
            .decode(&self.auth_info)
            .map_err(|e| EngineError::decode(format!("auth_info is not base64: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| EngineError::decode(format!("auth_info is not JSON: {e}")))
    }

    /// Flattens the message into named byte fields.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, Vec<u8>)> {
        let mut fields = vec![
            (FIELD_ID.to_string(), self.id.clone().into_bytes()),
            (FIELD_TYPE.to_string(), self.datatype.clone().into_bytes()),
            (FIELD_SUBMIT_TS.to_string(), self.submit_ts.clone().into_bytes()),
            (
                FIELD_EVENT_TS.to_string(),
                self.event_ts.clone().unwrap_or_default().into_bytes(),
            ),
        ];
        fields.extend(
            self.track_ids
                .iter()
                .map(|(key, value)| (key.clone(), value.clone().into_bytes())),
        );
        fields.extend([
            (FIELD_AUTH_INFO.to_string(), self.auth_info.clone().into_bytes()),
            (FIELD_SER.to_string(), self.serialization.to_string().into_bytes()),
            (FIELD_COMP.to_string(), self.compression.to_string().into_bytes()),
            (FIELD_PAYLOAD.to_string(), self.payload.clone()),
            (FIELD_QUEUE.to_string(), self.queue.clone().into_bytes()),
        ]);
        fields
    }

    /// Rebuilds a message from named byte fields.
    pub fn from_fields<K, V>(fields: &[(K, V)]) -> EngineResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let lookup = |name: &str| -> Option<&[u8]> {
            fields
                .iter()
                .find(|(key, _)| key.as_ref() == name)
                .map(|(_, value)| value.as_ref())
        };
        let text = |name: &str| -> EngineResult<String> {
            let bytes = lookup(name)
                .ok_or_else(|| EngineError::decode(format!("missing field '{name}'")))?;
            String::from_utf8(bytes.to_vec())
                .map_err(|_| EngineError::decode(format!("field '{name}' is not UTF-8")))
        };

        let serialization = text(FIELD_SER)?
            .parse::<Serialization>()
            .map_err(|e| EngineError::decode(e.to_string()))?;
        let compression = text(FIELD_COMP)?
            .parse::<Compression>()
            .map_err(|e| EngineError::decode(e.to_string()))?;
        let event_ts = text(FIELD_EVENT_TS).ok().filter(|ts| !ts.is_empty());

        let mut track_ids = TrackIds::new();
        for (key, value) in fields {
            let key = key.as_ref();
            if key.starts_with("track.") {
                let value = String::from_utf8_lossy(value.as_ref()).into_owned();
                track_ids.insert(key.to_string(), value);
            }
        }

        Ok(Self {
            id: text(FIELD_ID)?,
            datatype: text(FIELD_TYPE)?,
            submit_ts: text(FIELD_SUBMIT_TS)?,
            event_ts,
            track_ids,
            auth_info: text(FIELD_AUTH_INFO).unwrap_or_default(),
            serialization,
            compression,
            payload: lookup(FIELD_PAYLOAD)
                .ok_or_else(|| EngineError::decode("missing field 'payload'"))?
                .to_vec(),
            queue: text(FIELD_QUEUE).unwrap_or_else(|_| crate::config::AUTO.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register_name("Order", false);
        registry
    }

    fn context() -> EventContext {
        let mut ids = TrackIds::new();
        ids.insert(track::REQUEST_ID.to_string(), "req-1".to_string());
        ids.insert(track::STREAM_NAME.to_string(), "upstream".to_string());
        let mut ctx = EventContext::with_track_ids("shop.1", "orders", ids, Value::Null);
        ctx.set_auth_info(json!({"user": "ana"}));
        ctx
    }

    #[test]
    fn test_encode_then_decode_carries_context() {
        let payload = Payload::new("Order", json!({"id": 7}));
        let message =
            StreamMessage::encode(&payload, &context(), "AUTO", Serialization::Json, Compression::Lz4)
                .unwrap();
        assert_eq!(message.datatype, "Order");
        assert!(!message.track_ids.contains_key(track::STREAM_NAME));

        let event = message.decode("orders", "shop.1.orders", &registry()).unwrap();
        assert_eq!(event.payload, payload);
        assert_eq!(event.auth_info, json!({"user": "ana"}));
        assert_eq!(event.track_ids[track::REQUEST_ID], "req-1");

        let ctx = event.context("shop.1", "process");
        assert_eq!(ctx.request_id(), Some("req-1"));
        assert_eq!(ctx.track_id(track::STREAM_NAME), Some("orders"));
        assert_eq!(ctx.track_id(track::STREAM_MSG_ID), Some(message.id.as_str()));
        assert_eq!(ctx.auth_info(), &json!({"user": "ana"}));
    }

    #[test]
    fn test_unknown_datatype_is_decode_error() {
        let payload = Payload::new("Refund", json!({}));
        let message = StreamMessage::encode(
            &payload,
            &context(),
            "AUTO",
            Serialization::Msgpack,
            Compression::None,
        )
        .unwrap();
        let err = message.decode("s", "g", &registry()).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn test_fields_use_wire_names() {
        let payload = Payload::new("Order", json!({"id": 1}));
        let message = StreamMessage::encode(
            &payload,
            &context(),
            "high",
            Serialization::JsonBase64,
            Compression::Zstd(3),
        )
        .unwrap();
        let fields = message.to_fields();
        let names: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        for expected in [
            "id", "type", "submit_ts", "event_ts", "track.request_id", "auth_info", "ser", "comp",
            "payload", "queue",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }

        let back = StreamMessage::from_fields(&fields).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_missing_field_is_decode_error() {
        let fields = vec![("id".to_string(), b"1".to_vec())];
        assert!(matches!(
            StreamMessage::from_fields(&fields),
            Err(EngineError::Decode(_))
        ));
    }
}
