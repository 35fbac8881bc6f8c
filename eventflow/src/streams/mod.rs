//! Stream backends.
//!
//! [`StreamManager`] is the contract the engine consumes. It knows nothing
//! of backend details, so [`BrokerStreamManager`] and any external backend
//! are interchangeable. [`BalancedStreamManager`] fronts several backends
//! with a circuit-breaking load balancer.

mod balanced;
mod broker;
mod in_process;
mod message;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::errors::EngineResult;
use crate::payload::TypeRegistry;

pub use balanced::BalancedStreamManager;
pub use broker::{Broker, BrokerConfig, Consumed, GroupStats, QueueStats};
pub use in_process::BrokerStreamManager;
pub use message::{StreamEvent, StreamMessage};

/// Result of one read: decoded events and per-message decode failures.
#[derive(Debug, Default)]
pub struct ReadBatch {
    /// One entry per message read, in stream order.
    pub events: Vec<EngineResult<StreamEvent>>,
    /// Messages evicted before they could be read.
    pub missed: u64,
}

impl ReadBatch {
    /// Whether nothing was read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of messages read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Operations a stream backend provides to the engine.
#[async_trait]
pub trait StreamManager: Send + Sync + fmt::Debug {
    /// Opens the backend.
    async fn connect(&self) -> EngineResult<()>;

    /// Closes the backend.
    async fn close(&self) -> EngineResult<()>;

    /// Creates `stream` and `group` if absent. Idempotent.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> EngineResult<()>;

    /// Appends one message. `target_max_len` above zero allows the backend to
    /// trim older messages. Returns the number of messages written.
    async fn write_stream(
        &self,
        stream: &str,
        message: StreamMessage,
        target_max_len: usize,
    ) -> EngineResult<usize>;

    /// Reads up to `batch_size` messages for `group`, waiting at most `timeout`.
    ///
    /// A timeout yields an empty batch. Undecodable messages are returned as
    /// per-entry errors without failing the batch.
    async fn read_stream(
        &self,
        stream: &str,
        group: &str,
        consumer_id: &str,
        batch_size: usize,
        timeout: Duration,
        registry: &TypeRegistry,
    ) -> EngineResult<ReadBatch>;

    /// Marks `event` as processed by `group`. Returns the number acknowledged.
    async fn ack_read_stream(
        &self,
        stream: &str,
        group: &str,
        event: &StreamEvent,
    ) -> EngineResult<usize>;
}
