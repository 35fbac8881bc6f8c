//! Per-event configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::compression::Compression;
use crate::payload::Serialization;

/// Queue name that maps to the bare stream.
pub const AUTO: &str = "AUTO";

/// Returns the stream name that holds `queue` of `stream`.
#[must_use]
pub fn queue_stream_name(stream: &str, queue: &str) -> String {
    if queue == AUTO {
        stream.to_string()
    } else {
        format!("{stream}.{queue}")
    }
}

fn default_queues() -> Vec<String> {
    vec![AUTO.to_string()]
}

/// How an event is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Request with query arguments.
    #[default]
    Get,
    /// Request with a body payload.
    Post,
    /// Consumes messages from a read stream.
    Stream,
    /// Runs a generator until stopped.
    Service,
}

/// Where written messages go when the consumed message came from a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    /// Write to the queue the consumed message came from.
    #[default]
    Propagate,
    /// Always write to the configured queues.
    Drop,
}

/// Stream an event consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStreamDescriptor {
    /// Base stream name.
    pub name: String,
    /// Consumer group used for reading.
    pub consumer_group: String,
    /// Queues to read; `AUTO` is the bare stream.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
}

impl ReadStreamDescriptor {
    /// Creates a descriptor reading the bare stream.
    #[must_use]
    pub fn new(name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumer_group: consumer_group.into(),
            queues: default_queues(),
        }
    }

    /// Sets the queues to read.
    #[must_use]
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// `(queue, stream name)` pairs to read, in configured order.
    #[must_use]
    pub fn queue_streams(&self) -> Vec<(String, String)> {
        self.queues
            .iter()
            .map(|q| (q.clone(), queue_stream_name(&self.name, q)))
            .collect()
    }
}

/// Stream an event writes its results to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStreamDescriptor {
    /// Base stream name.
    pub name: String,
    /// Queues to write; `AUTO` is the bare stream.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// How consumed-queue names are carried into writes.
    #[serde(default)]
    pub queue_strategy: QueueStrategy,
}

impl WriteStreamDescriptor {
    /// Creates a descriptor writing the bare stream.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: default_queues(),
            queue_strategy: QueueStrategy::default(),
        }
    }

    /// Sets the queues to write.
    #[must_use]
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Sets the queue strategy.
    #[must_use]
    pub fn with_queue_strategy(mut self, strategy: QueueStrategy) -> Self {
        self.queue_strategy = strategy;
        self
    }

    /// `(queue, stream name)` pairs to write for a message consumed from `source_queue`.
    #[must_use]
    pub fn target_streams(&self, source_queue: Option<&str>) -> Vec<(String, String)> {
        let queues: Vec<String> = match (self.queue_strategy, source_queue) {
            (QueueStrategy::Propagate, Some(q)) if q != AUTO => self
                .queues
                .iter()
                .map(|configured| {
                    if configured == AUTO {
                        q.to_string()
                    } else {
                        format!("{configured}.{q}")
                    }
                })
                .collect(),
            _ => self.queues.clone(),
        };
        queues
            .into_iter()
            .map(|q| {
                let stream = queue_stream_name(&self.name, &q);
                (q, stream)
            })
            .collect()
    }
}

/// A peer-application event this event may call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConnection {
    /// Key into `AppConfig::app_connections`.
    pub app_connection: String,
    /// Event name on the peer application.
    pub event: String,
    /// Method used for the call.
    #[serde(rename = "type", default)]
    pub event_type: EventType,
}

fn default_stream_timeout() -> f64 {
    60.0
}

fn default_batch_size() -> usize {
    100
}

fn default_response_timeout() -> f64 {
    60.0
}

/// Stream settings of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamConfig {
    /// Per-message processing timeout in seconds.
    #[serde(default = "default_stream_timeout")]
    pub timeout: f64,
    /// Advisory maximum length passed to stream writes; 0 means unbounded.
    #[serde(default)]
    pub target_max_len: usize,
    /// Minimum duration of one execution in milliseconds.
    #[serde(default)]
    pub throttle_ms: u64,
    /// Delay between steps in milliseconds.
    #[serde(default)]
    pub step_delay: u64,
    /// Read and write-back batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Compression override; falls back to the engine default.
    #[serde(default)]
    pub compression: Option<Compression>,
    /// Serialization override; falls back to the engine default.
    #[serde(default)]
    pub serialization: Option<Serialization>,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            timeout: default_stream_timeout(),
            target_max_len: 0,
            throttle_ms: 0,
            step_delay: 0,
            batch_size: default_batch_size(),
            compression: None,
            serialization: None,
        }
    }
}

impl EventStreamConfig {
    /// Per-message timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        super::seconds(self.timeout)
    }

    /// Step delay as a `Duration`.
    #[must_use]
    pub const fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay)
    }

    /// Throttle as a `Duration`.
    #[must_use]
    pub const fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// Batch size, never below one.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

/// Runtime settings of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    /// Deadline of a single request execution in seconds.
    #[serde(default = "default_response_timeout")]
    pub response_timeout: f64,
    /// Stream settings.
    #[serde(default)]
    pub stream: EventStreamConfig,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            response_timeout: default_response_timeout(),
            stream: EventStreamConfig::default(),
        }
    }
}

impl EventSettings {
    /// Response timeout as a `Duration`.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        super::seconds(self.response_timeout)
    }
}

/// Configuration of one event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// How the event is triggered.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Stream consumed by STREAM events.
    #[serde(default)]
    pub read_stream: Option<ReadStreamDescriptor>,
    /// Stream results are written to.
    #[serde(default)]
    pub write_stream: Option<WriteStreamDescriptor>,
    /// Peer events this event may call.
    #[serde(default)]
    pub connections: Vec<EventConnection>,
    /// Runtime settings.
    #[serde(default)]
    pub config: EventSettings,
}

impl EventDescriptor {
    /// Creates a descriptor of the given type with default settings.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            ..Self::default()
        }
    }

    /// Sets the read stream.
    #[must_use]
    pub fn with_read_stream(mut self, read_stream: ReadStreamDescriptor) -> Self {
        self.read_stream = Some(read_stream);
        self
    }

    /// Sets the write stream.
    #[must_use]
    pub fn with_write_stream(mut self, write_stream: WriteStreamDescriptor) -> Self {
        self.write_stream = Some(write_stream);
        self
    }

    /// Adds a peer connection.
    #[must_use]
    pub fn with_connection(mut self, connection: EventConnection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Sets the runtime settings.
    #[must_use]
    pub fn with_settings(mut self, config: EventSettings) -> Self {
        self.config = config;
        self
    }

    /// Whether this event reads or writes a stream.
    #[must_use]
    pub const fn uses_streams(&self) -> bool {
        self.read_stream.is_some() || self.write_stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_queue_stream_names() {
        assert_eq!(queue_stream_name("orders", AUTO), "orders");
        assert_eq!(queue_stream_name("orders", "high"), "orders.high");

        let read = ReadStreamDescriptor::new("orders", "g")
            .with_queues(vec![AUTO.to_string(), "high".to_string()]);
        assert_eq!(
            read.queue_streams(),
            vec![
                ("AUTO".to_string(), "orders".to_string()),
                ("high".to_string(), "orders.high".to_string()),
            ]
        );
    }

    #[test]
    fn test_propagate_strategy_follows_source_queue() {
        let write = WriteStreamDescriptor::new("out");
        assert_eq!(
            write.target_streams(Some("high")),
            vec![("high".to_string(), "out.high".to_string())]
        );
        assert_eq!(
            write.target_streams(Some(AUTO)),
            vec![("AUTO".to_string(), "out".to_string())]
        );
        assert_eq!(write.target_streams(None), vec![("AUTO".to_string(), "out".to_string())]);
    }

    #[test]
    fn test_drop_strategy_uses_configured_queues() {
        let write = WriteStreamDescriptor::new("out")
            .with_queues(vec!["q1".to_string()])
            .with_queue_strategy(QueueStrategy::Drop);
        assert_eq!(
            write.target_streams(Some("high")),
            vec![("q1".to_string(), "out.q1".to_string())]
        );
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = r#"{
            "type": "STREAM",
            "read_stream": {"name": "in", "consumer_group": "g"},
            "config": {"stream": {"batch_size": 5, "compression": "lz4"}}
        }"#;
        let event: EventDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(event.event_type, EventType::Stream);
        assert_eq!(event.read_stream.as_ref().unwrap().queues, vec![AUTO.to_string()]);
        assert_eq!(event.config.stream.batch_size, 5);
        assert_eq!(event.config.stream.compression, Some(Compression::Lz4));
        assert_eq!(event.config.response_timeout(), Duration::from_secs(60));
        assert!(event.uses_streams());
    }
}
