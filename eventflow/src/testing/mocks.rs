//! Mock collaborators for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClientRequest, ClientResponse, ClientTransport};
use crate::context::EventContext;
use crate::errors::{EngineError, EngineResult};
use crate::payload::{Payload, TypeRegistry};
use crate::steps::{Step, StepArgs, StepDescriptor, StepInput};
use crate::streams::{
    Broker, BrokerStreamManager, ReadBatch, StreamEvent, StreamManager,
    StreamMessage,
};

/// A transport that records requests and answers from a script.
///
/// Scripted answers are used in order; once exhausted every call gets
/// `200 null`. Hosts marked with [`MockTransport::fail_host`] always fail.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<EngineResult<ClientResponse>>>,
    failing_hosts: Mutex<Vec<String>>,
    requests: Mutex<Vec<ClientRequest>>,
}

impl MockTransport {
    /// Creates a transport answering `200 null`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an answer.
    pub fn push_response(&self, response: ClientResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues an error.
    pub fn push_error(&self, error: EngineError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Makes every URL starting with `host` fail with a transport error.
    pub fn fail_host(&self, host: impl Into<String>) {
        self.failing_hosts.lock().push(host.into());
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ClientRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ClientTransport for MockTransport {
    async fn send(&self, request: ClientRequest) -> EngineResult<ClientResponse> {
        self.requests.lock().push(request.clone());
        if self
            .failing_hosts
            .lock()
            .iter()
            .any(|host| request.url.starts_with(host.as_str()))
        {
            return Err(EngineError::transport(format!("connection refused: {}", request.url)));
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ClientResponse::new(200, serde_json::Value::Null)))
    }
}

/// A broker-backed stream manager whose first `failures` data operations
/// fail with transport errors.
#[derive(Debug)]
pub struct FlakyStreamManager {
    inner: BrokerStreamManager,
    remaining: AtomicUsize,
    served: AtomicUsize,
}

impl FlakyStreamManager {
    /// Creates a manager over a private broker.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        let broker = Arc::new(Broker::default());
        Self::with_broker(broker, failures)
    }

    /// Creates a manager over `broker`.
    #[must_use]
    pub fn with_broker(broker: Arc<Broker>, failures: usize) -> Self {
        Self {
            inner: BrokerStreamManager::with_producer_id(broker, "flaky"),
            remaining: AtomicUsize::new(failures),
            served: AtomicUsize::new(0),
        }
    }

    /// The broker behind this manager.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        self.inner.broker()
    }

    /// Failures returned so far.
    #[must_use]
    pub fn failures_served(&self) -> usize {
        self.served.load(Ordering::Acquire)
    }

    fn maybe_fail(&self, operation: &str) -> EngineResult<()> {
        let failing = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.served.fetch_add(1, Ordering::AcqRel);
            Err(EngineError::transport(format!("{operation}: backend unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StreamManager for FlakyStreamManager {
    async fn connect(&self) -> EngineResult<()> {
        self.inner.connect().await
    }

    async fn close(&self) -> EngineResult<()> {
        self.inner.close().await
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> EngineResult<()> {
        self.maybe_fail("ensure_consumer_group")?;
        self.inner.ensure_consumer_group(stream, group).await
    }

    async fn write_stream(
        &self,
        stream: &str,
        message: StreamMessage,
        target_max_len: usize,
    ) -> EngineResult<usize> {
        self.maybe_fail("write_stream")?;
        self.inner.write_stream(stream, message, target_max_len).await
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
        self.maybe_fail("read_stream")?;
        self.inner
            .read_stream(stream, group, consumer_id, batch_size, timeout, registry)
            .await
    }

    async fn ack_read_stream(
        &self,
        stream: &str,
        group: &str,
        event: &StreamEvent,
    ) -> EngineResult<usize> {
        self.inner.ack_read_stream(stream, group, event).await
    }
}

#[derive(Debug, Clone, Default)]
enum Outcome {
    #[default]
    PassThrough,
    Return(Payload),
    Fail(String),
}

/// A step that records its inputs.
///
/// Passes its input through unless configured to return a payload or fail.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    outcome: Outcome,
    delay: Duration,
    calls: Mutex<Vec<Option<Payload>>>,
}

impl RecordingStep {
    /// Creates a pass-through step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Outcome::PassThrough,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns `payload` from every call.
    #[must_use]
    pub fn returning(mut self, payload: Payload) -> Self {
        self.outcome = Outcome::Return(payload);
        self
    }

    /// Fails every call with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.outcome = Outcome::Fail(message.into());
        self
    }

    /// Sleeps before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Inputs of every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Option<Payload>> {
        self.calls.lock().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Wraps the step in a descriptor accepting `input`.
    #[must_use]
    pub fn descriptor(self: &Arc<Self>, input: StepInput) -> StepDescriptor {
        let output = match &self.outcome {
            Outcome::Return(payload) => Some(payload.datatype().to_string()),
            _ => None,
        };
        StepDescriptor::new(self.name.clone(), input, output, Arc::clone(self) as Arc<dyn Step>)
    }
}

#[async_trait]
impl Step for RecordingStep {
    async fn invoke(
        &self,
        payload: Option<Payload>,
        _context: &EventContext,
        _args: &StepArgs,
    ) -> EngineResult<Option<Payload>> {
        self.calls.lock().push(payload.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Outcome::PassThrough => Ok(payload),
            Outcome::Return(output) => Ok(Some(output.clone())),
            Outcome::Fail(message) => Err(EngineError::step(
                self.name.clone(),
                anyhow::anyhow!(message.clone()),
            )),
        }
    }
}
