use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Broker, ReadBatch, StreamEvent, StreamManager, StreamMessage};
use crate::errors::{EngineError, EngineResult};
use crate::payload::TypeRegistry;
use crate::utils::generate_id;

/// [`StreamManager`] over a shared in-process [`Broker`].
///
/// Several managers may share one broker; each writes under its own producer id.
#[derive(Debug)]
pub struct BrokerStreamManager {
    broker: Arc<Broker>,
    producer_id: String,
    connected: AtomicBool,
}

impl BrokerStreamManager {
    /// Creates a manager writing as a random producer id.
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self::with_producer_id(broker, generate_id())
    }

    /// Creates a manager writing as `producer_id`.
    #[must_use]
    pub fn with_producer_id(broker: Arc<Broker>, producer_id: impl Into<String>) -> Self {
        Self {
            broker,
            producer_id: producer_id.into(),
            connected: AtomicBool::new(false),
        }
    }

    /// The shared broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Whether [`StreamManager::connect`] was called and not yet closed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn check_connected(&self) -> EngineResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::transport("broker stream manager is not connected"))
        }
    }
}

#[async_trait]
impl StreamManager for BrokerStreamManager {
    async fn connect(&self) -> EngineResult<()> {
        self.connected.store(true, Ordering::Release);
        tracing::debug!(producer_id = %self.producer_id, "Connected to in-process broker");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> EngineResult<()> {
        self.check_connected()?;
        if self.broker.ensure_group(stream, group) {
            tracing::info!(stream_name = stream, consumer_group = group, "Created consumer group");
        }
        Ok(())
    }

    async fn write_stream(
        &self,
        stream: &str,
        message: StreamMessage,
        _target_max_len: usize,
    ) -> EngineResult<usize> {
        self.check_connected()?;
        self.broker.push(stream, &self.producer_id, message);
        Ok(1)
    }

    async fn read_stream(
        &self,
        stream: &str,
        group: &str,
        consumer_id: &str,
        batch_size: usize,
        timeout: Duration,
        registry: &TypeRegistry,
    ) -> EngineResult<ReadBatch> {
        self.check_connected()?;
        let consumed = self
            .broker
            .read(stream, group, consumer_id, batch_size, timeout)
            .await;
        if consumed.missed > 0 {
            tracing::warn!(
                stream_name = stream,
                consumer_group = group,
                missed = consumed.missed,
                "Consumer group fell behind; messages were evicted before read"
            );
        }
        let events = consumed
            .messages
            .iter()
            .map(|message| message.decode(stream, group, registry))
            .collect();
        Ok(ReadBatch {
            events,
            missed: consumed.missed,
        })
    }

    async fn ack_read_stream(
        &self,
        stream: &str,
        group: &str,
        _event: &StreamEvent,
    ) -> EngineResult<usize> {
        self.check_connected()?;
        Ok(self.broker.ack(stream, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::context::EventContext;
    use crate::payload::{Payload, Serialization};
    use crate::streams::BrokerConfig;
    use serde_json::json;

    fn manager() -> BrokerStreamManager {
        let broker = Arc::new(Broker::new(BrokerConfig::default().with_capacity(3)).unwrap());
        BrokerStreamManager::with_producer_id(broker, "p1")
    }

    fn message(n: i64) -> StreamMessage {
        StreamMessage::encode(
            &Payload::new("N", json!(n)),
            &EventContext::new("app.1", "e"),
            "AUTO",
            Serialization::Json,
            Compression::None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let manager = manager();
        let err = manager.ensure_consumer_group("s", "g").await.unwrap_err();
        assert!(err.is_transport());

        manager.connect().await.unwrap();
        manager.ensure_consumer_group("s", "g").await.unwrap();
        manager.close().await.unwrap();
        assert!(manager.write_stream("s", message(1), 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_read_ack() {
        let manager = manager();
        manager.connect().await.unwrap();
        manager.ensure_consumer_group("s", "g").await.unwrap();
        for n in 0..5 {
            assert_eq!(manager.write_stream("s", message(n), 0).await.unwrap(), 1);
        }

        let mut registry = TypeRegistry::new();
        registry.register_name("N", false);
        let batch = manager
            .read_stream("s", "g", "c", 10, Duration::from_millis(10), &registry)
            .await
            .unwrap();
        assert_eq!(batch.missed, 2);
        let values: Vec<_> = batch
            .events
            .iter()
            .map(|e| e.as_ref().unwrap().payload.value().clone())
            .collect();
        assert_eq!(values, vec![json!(2), json!(3), json!(4)]);

        let event = batch.events[0].as_ref().unwrap();
        assert_eq!(event.stream, "s");
        assert_eq!(manager.ack_read_stream("s", "g", event).await.unwrap(), 1);
        assert_eq!(manager.broker().stats("s").unwrap().producers["p1"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_errors_do_not_fail_batch() {
        let manager = manager();
        manager.connect().await.unwrap();
        manager.ensure_consumer_group("s", "g").await.unwrap();
        manager.write_stream("s", message(1), 0).await.unwrap();

        let batch = manager
            .read_stream("s", "g", "c", 10, Duration::from_millis(10), &TypeRegistry::new())
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.events[0].is_err());
    }
}
