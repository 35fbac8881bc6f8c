use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{ReadBatch, StreamEvent, StreamManager, StreamMessage};
use crate::balancer::{CircuitBreakLoadBalancer, CircuitBreakerSettings};
use crate::errors::{EngineError, EngineResult};
use crate::payload::TypeRegistry;

/// Fronts several backends with a [`CircuitBreakLoadBalancer`].
///
/// Writes and reads go to the next eligible backend and fall through to the
/// following one on transport errors. Acks return to the backend that served
/// the read.
#[derive(Debug)]
pub struct BalancedStreamManager {
    balancer: CircuitBreakLoadBalancer<Arc<dyn StreamManager>>,
}

impl BalancedStreamManager {
    /// Creates a manager over `backends`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        backends: Vec<Arc<dyn StreamManager>>,
        settings: CircuitBreakerSettings,
    ) -> Self {
        Self {
            balancer: CircuitBreakLoadBalancer::new(name, backends, settings),
        }
    }

    /// The underlying balancer.
    #[must_use]
    pub const fn balancer(&self) -> &CircuitBreakLoadBalancer<Arc<dyn StreamManager>> {
        &self.balancer
    }

    fn no_hosts(&self) -> EngineError {
        EngineError::NoHostsAvailable {
            connection: self.balancer.name().to_string(),
            hosts: self.balancer.len(),
        }
    }

    fn record<T>(&self, index: usize, result: &EngineResult<T>) {
        match result {
            Ok(_) => self.balancer.success(index),
            Err(e) if e.is_transport() => self.balancer.failure(index),
            Err(_) => {}
        }
    }

    /// Runs `op` on every backend. Succeeds if any backend succeeded.
    async fn broadcast<'a, F, Fut>(&'a self, op: F) -> EngineResult<()>
    where
        F: Fn(&'a Arc<dyn StreamManager>) -> Fut,
        Fut: std::future::Future<Output = EngineResult<()>>,
    {
        let mut last_error = None;
        let mut any_ok = false;
        for (index, backend) in self.balancer.hosts().iter().enumerate() {
            let result = op(backend).await;
            self.record(index, &result);
            match result {
                Ok(()) => any_ok = true,
                Err(e) => {
                    tracing::warn!(
                        balancer = %self.balancer.name(),
                        backend = index,
                        error = %e,
                        "Stream backend call failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        match (any_ok, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StreamManager for BalancedStreamManager {
    async fn connect(&self) -> EngineResult<()> {
        self.broadcast(|backend| backend.connect()).await
    }

    async fn close(&self) -> EngineResult<()> {
        self.broadcast(|backend| backend.close()).await
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> EngineResult<()> {
        self.broadcast(|backend| backend.ensure_consumer_group(stream, group))
            .await
    }

    async fn write_stream(
        &self,
        stream: &str,
        message: StreamMessage,
        target_max_len: usize,
    ) -> EngineResult<usize> {
        let mut last_error = None;
        for _ in 0..self.balancer.len() {
            let (index, backend) = self.balancer.next_host()?;
            let result = backend
                .write_stream(stream, message.clone(), target_max_len)
                .await;
            self.record(index, &result);
            match result {
                Err(e) if e.is_transport() => last_error = Some(e),
                other => return other,
            }
        }
        Err(last_error.unwrap_or_else(|| self.no_hosts()))
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
        let mut last_error = None;
        for _ in 0..self.balancer.len() {
            let (index, backend) = self.balancer.next_host()?;
            let result = backend
                .read_stream(stream, group, consumer_id, batch_size, timeout, registry)
                .await;
            self.record(index, &result);
            match result {
                Ok(mut batch) => {
                    for event in batch.events.iter_mut().flatten() {
                        event.origin = Some(index);
                    }
                    return Ok(batch);
                }
                Err(e) if e.is_transport() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| self.no_hosts()))
    }

    async fn ack_read_stream(
        &self,
        stream: &str,
        group: &str,
        event: &StreamEvent,
    ) -> EngineResult<usize> {
        let index = event.origin.ok_or_else(|| {
            EngineError::transport(format!("message '{}' has no origin backend", event.msg_id))
        })?;
        let backend = self.balancer.host(index).ok_or_else(|| {
            EngineError::transport(format!("origin backend {index} is not configured"))
        })?;
        let result = backend.ack_read_stream(stream, group, event).await;
        self.record(index, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::context::EventContext;
    use crate::payload::{Payload, Serialization};
    use crate::streams::{Broker, BrokerConfig, BrokerStreamManager};
    use crate::testing::FlakyStreamManager;
    use serde_json::json;

    fn message() -> StreamMessage {
        StreamMessage::encode(
            &Payload::new("N", json!(1)),
            &EventContext::new("app.1", "e"),
            "AUTO",
            Serialization::Json,
            Compression::None,
        )
        .unwrap()
    }

    fn backend() -> (Arc<Broker>, Arc<dyn StreamManager>) {
        let broker = Arc::new(Broker::new(BrokerConfig::default()).unwrap());
        let manager: Arc<dyn StreamManager> = Arc::new(BrokerStreamManager::new(Arc::clone(&broker)));
        (broker, manager)
    }

    fn settings() -> CircuitBreakerSettings {
        CircuitBreakerSettings::new(2, Duration::from_secs(10), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_round_robin_and_acks_return_to_origin() {
        let (b1, m1) = backend();
        let (b2, m2) = backend();
        let balanced = BalancedStreamManager::new("streams", vec![m1, m2], settings());
        balanced.connect().await.unwrap();
        balanced.ensure_consumer_group("s", "g").await.unwrap();

        balanced.write_stream("s", message(), 0).await.unwrap();
        balanced.write_stream("s", message(), 0).await.unwrap();
        assert_eq!(b1.stats("s").unwrap().offset0, Some(0));
        assert_eq!(b2.stats("s").unwrap().offset0, Some(0));

        let mut registry = TypeRegistry::new();
        registry.register_name("N", false);
        let batch = balanced
            .read_stream("s", "g", "c", 10, Duration::from_millis(5), &registry)
            .await
            .unwrap();
        let event = batch.events[0].as_ref().unwrap();
        let origin = event.origin.unwrap();
        balanced.ack_read_stream("s", "g", event).await.unwrap();

        let acked = |b: &Broker| b.stats("s").unwrap().groups["g"].acked;
        let (origin_broker, other) = if origin == 0 { (&b1, &b2) } else { (&b2, &b1) };
        assert_eq!(acked(origin_broker), 1);
        assert_eq!(acked(other), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_backend_is_skipped_then_opened() {
        let flaky = Arc::new(FlakyStreamManager::new(usize::MAX));
        let (healthy_broker, healthy) = backend();
        let backends = vec![Arc::clone(&flaky) as Arc<dyn StreamManager>, healthy];
        let balanced = BalancedStreamManager::new("streams", backends, settings());
        balanced.connect().await.unwrap();

        for _ in 0..4 {
            balanced.write_stream("s", message(), 0).await.unwrap();
        }
        assert_eq!(healthy_broker.stats("s").unwrap().producers.values().sum::<u64>(), 4);
        assert!(!balanced.balancer().is_available(0));
        assert_eq!(flaky.failures_served(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_backends_failing_is_transport_error() {
        let flaky: Arc<dyn StreamManager> = Arc::new(FlakyStreamManager::new(usize::MAX));
        let balanced = BalancedStreamManager::new("streams", vec![flaky], settings());
        let err = balanced.write_stream("s", message(), 0).await.unwrap_err();
        assert!(err.is_transport());
    }
}
