//! Per-application orchestrator.

use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::latch::RunLatch;
use crate::client::{AppsClient, ClientTransport};
use crate::compression::Compression;
use crate::config::{AppConfig, EventDescriptor};
use crate::context::EventContext;
use crate::errors::{ConfigurationError, EngineError, EngineResult};
use crate::payload::{Payload, Serialization};
use crate::pipeline::{split_event_stages, EventStage, ExecutionSettings, PipelineExecutor};
use crate::steps::{AppDefinition, StepArgs};
use crate::streams::{StreamManager, StreamMessage};

/// Extra wait on top of the read poll timeout when stopping loops.
const STOP_GRACE_MARGIN: Duration = Duration::from_millis(500);

/// One runnable stage with its executor and stream encoding.
#[derive(Debug)]
pub(crate) struct EventRuntime {
    pub(crate) stage: EventStage,
    pub(crate) executor: PipelineExecutor,
    pub(crate) serialization: Serialization,
    pub(crate) compression: Compression,
}

impl EventRuntime {
    fn new(stage: EventStage, config: &AppConfig) -> Self {
        let stream = &stage.descriptor.config.stream;
        let executor = PipelineExecutor::for_step_set(
            &stage.steps,
            ExecutionSettings::from_stream_config(stream),
        );
        Self {
            serialization: stream
                .serialization
                .unwrap_or(config.engine.default_stream_serialization),
            compression: stream
                .compression
                .unwrap_or(config.engine.default_stream_compression),
            executor,
            stage,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.stage.name
    }

    pub(crate) const fn descriptor(&self) -> &EventDescriptor {
        &self.stage.descriptor
    }
}

/// Runs the events of one application.
///
/// Build it with its configuration and step definitions, attach a stream
/// manager when events use streams, then call [`AppEngine::start`]. Requests
/// go through [`AppEngine::execute`]; STREAM and SERVICE events run in
/// [`AppEngine::read_stream`] and [`AppEngine::service_loop`] until stopped.
#[derive(Debug)]
pub struct AppEngine {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) app_key: String,
    definition: AppDefinition,
    pub(crate) events: IndexMap<String, Arc<EventRuntime>>,
    pub(crate) stream_manager: Option<Arc<dyn StreamManager>>,
    client_transport: Option<Arc<dyn ClientTransport>>,
    clients: HashMap<String, Arc<AppsClient>>,
    pub(crate) latches: DashMap<String, Arc<RunLatch>>,
    started: bool,
}

impl AppEngine {
    /// Creates an engine for `config` running the steps of `definition`.
    #[must_use]
    pub fn new(config: AppConfig, definition: AppDefinition) -> Self {
        let app_key = config.app_key();
        Self {
            config: Arc::new(config),
            app_key,
            definition,
            events: IndexMap::new(),
            stream_manager: None,
            client_transport: None,
            clients: HashMap::new(),
            latches: DashMap::new(),
            started: false,
        }
    }

    /// Sets the stream backend.
    #[must_use]
    pub fn with_stream_manager(mut self, manager: Arc<dyn StreamManager>) -> Self {
        self.stream_manager = Some(manager);
        self
    }

    /// Sets the transport used by peer-app clients.
    #[must_use]
    pub fn with_client_transport(mut self, transport: Arc<dyn ClientTransport>) -> Self {
        self.client_transport = Some(transport);
        self
    }

    /// App key (`name.version`).
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runtime event names, stage events included, in declaration order.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Whether [`AppEngine::start`] completed.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Client of the app connection `key`.
    #[must_use]
    pub fn client(&self, key: &str) -> Option<Arc<AppsClient>> {
        self.clients.get(key).cloned()
    }

    /// Splits events into stages, builds peer clients and connects the
    /// stream manager when any event uses streams.
    pub async fn start(&mut self) -> EngineResult<()> {
        if self.started {
            return Ok(());
        }
        self.config.validate()?;

        let mut events = IndexMap::new();
        for (name, descriptor) in &self.config.events {
            let definition = self.definition.get(name).ok_or_else(|| {
                ConfigurationError::new(format!("event '{name}' has no step definition"))
            })?;
            for stage in split_event_stages(&self.app_key, definition, descriptor)? {
                let runtime = EventRuntime::new(stage, &self.config);
                events.insert(runtime.name().to_string(), Arc::new(runtime));
            }
        }
        for name in self.definition.names() {
            if !self.config.events.contains_key(name) {
                tracing::warn!(app_key = %self.app_key, event_name = name, "Event defined but not configured; skipped");
            }
        }

        let uses_streams = events.values().any(|e| e.descriptor().uses_streams());
        if uses_streams {
            let manager = self.stream_manager.as_ref().ok_or_else(|| {
                ConfigurationError::new("events use streams but no stream manager is set")
            })?;
            manager.connect().await?;
        }

        self.clients = self.build_clients()?;
        self.events = events;
        self.started = true;
        tracing::info!(
            app_key = %self.app_key,
            events = self.events.len(),
            streams = uses_streams,
            "Engine started"
        );
        Ok(())
    }

    fn build_clients(&self) -> EngineResult<HashMap<String, Arc<AppsClient>>> {
        let Some(transport) = self.client_transport.clone().or_else(default_transport) else {
            if !self.config.app_connections.is_empty() {
                tracing::warn!(app_key = %self.app_key, "No client transport available; app connections disabled");
            }
            return Ok(HashMap::new());
        };
        self.config
            .app_connections
            .keys()
            .map(|key| {
                let client = AppsClient::from_config(&self.config, key, Arc::clone(&transport))?;
                Ok((key.clone(), Arc::new(client)))
            })
            .collect()
    }

    /// Stops every running loop, waits for them to finish within a grace
    /// period, then closes the stream manager.
    pub async fn stop(&self) -> EngineResult<()> {
        for entry in &self.latches {
            if entry.value().stop() {
                tracing::info!(app_key = %self.app_key, event_name = %entry.key(), "Stopping event");
            }
        }

        if let Some(manager) = &self.stream_manager {
            let grace = self.config.engine.read_stream_timeout() + STOP_GRACE_MARGIN;
            let deadline = tokio::time::Instant::now() + grace;
            while !self.running_events().is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let pending = self.running_events();
            if !pending.is_empty() {
                tracing::warn!(app_key = %self.app_key, ?pending, "Loops still running after grace period");
            }
            if self.started {
                manager.close().await?;
            }
        }
        tracing::info!(app_key = %self.app_key, "Engine stopped");
        Ok(())
    }

    /// Asks the loop of `event_name` to stop. Returns false if it was not running.
    pub fn stop_event(&self, event_name: &str) -> bool {
        self.latches
            .get(event_name)
            .is_some_and(|latch| latch.stop())
    }

    /// Names of events whose loop holds its latch.
    #[must_use]
    pub fn running_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .latches
            .iter()
            .filter(|e| e.value().is_held())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn latch(&self, event_name: &str) -> Arc<RunLatch> {
        Arc::clone(
            self.latches
                .entry(event_name.to_string())
                .or_default()
                .value(),
        )
    }

    pub(crate) fn runtime(&self, event_name: &str) -> EngineResult<Arc<EventRuntime>> {
        if !self.started {
            return Err(EngineError::configuration("engine is not started"));
        }
        self.events
            .get(event_name)
            .cloned()
            .ok_or_else(|| ConfigurationError::unknown_event(event_name).into())
    }

    pub(crate) fn stream_manager(&self) -> EngineResult<&Arc<dyn StreamManager>> {
        self.stream_manager
            .as_ref()
            .ok_or_else(|| EngineError::configuration("no stream manager is set"))
    }

    /// Executes `event_name` once, bounded by its response timeout.
    ///
    /// Results are written back to the event's write stream, if any. Returns
    /// the result of the last completed chain.
    pub async fn execute(
        &self,
        event_name: &str,
        context: EventContext,
        payload: Option<Payload>,
        args: StepArgs,
    ) -> EngineResult<Option<Payload>> {
        let runtime = self.runtime(event_name)?;
        let timeout = runtime.descriptor().config.response_timeout();
        tokio::time::timeout(timeout, self.run_event(&runtime, context, payload, args, None))
            .await
            .map_err(|_| EngineError::timeout(format!("execute {event_name}"), timeout))?
    }

    /// Runs the pipeline of `runtime` and writes results back in batches.
    pub(crate) async fn run_event(
        &self,
        runtime: &EventRuntime,
        context: EventContext,
        payload: Option<Payload>,
        args: StepArgs,
        source_queue: Option<&str>,
    ) -> EngineResult<Option<Payload>> {
        let span = tracing::info_span!(
            "event",
            app_key = %self.app_key,
            event_name = %runtime.name(),
            request_id = context.request_id().unwrap_or_default(),
        );
        async move {
            let batch_size = runtime.descriptor().config.stream.effective_batch_size();
            let writes = runtime.descriptor().write_stream.is_some();
            let mut results = runtime.executor.execute(context.clone(), payload, args);
            let mut pending: Vec<Payload> = Vec::new();
            let mut last = None;

            while let Some(item) = results.next().await {
                let item = item?;
                if writes {
                    if let Some(p) = &item {
                        pending.push(p.clone());
                        if pending.len() >= batch_size {
                            self.flush(runtime, &context, std::mem::take(&mut pending), source_queue)
                                .await?;
                        }
                    }
                }
                last = item;
            }
            if !pending.is_empty() {
                self.flush(runtime, &context, pending, source_queue).await?;
            }
            Ok(last)
        }
        .instrument(span)
        .await
    }

    /// Writes a batch concurrently to every target stream of the event.
    async fn flush(
        &self,
        runtime: &EventRuntime,
        context: &EventContext,
        batch: Vec<Payload>,
        source_queue: Option<&str>,
    ) -> EngineResult<usize> {
        let Some(write) = &runtime.descriptor().write_stream else {
            return Ok(0);
        };
        let manager = self.stream_manager()?;
        let max_len = runtime.descriptor().config.stream.target_max_len;
        let targets = write.target_streams(source_queue);

        let mut writes = Vec::with_capacity(batch.len() * targets.len());
        for payload in &batch {
            for (queue, stream) in &targets {
                let message = StreamMessage::encode(
                    payload,
                    context,
                    queue,
                    runtime.serialization,
                    runtime.compression,
                )?;
                writes.push(async move { manager.write_stream(stream, message, max_len).await });
            }
        }

        let mut written = 0;
        for result in join_all(writes).await {
            written += result?;
        }
        tracing::debug!(event_name = %runtime.name(), written, "Flushed write-back batch");
        Ok(written)
    }
}

#[cfg(feature = "http-client")]
fn default_transport() -> Option<Arc<dyn ClientTransport>> {
    Some(Arc::new(crate::client::ReqwestTransport::new()))
}

#[cfg(not(feature = "http-client"))]
fn default_transport() -> Option<Arc<dyn ClientTransport>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventSettings, EventType, WriteStreamDescriptor};
    use crate::steps::{EventDefinition, StepDescriptor, StepInput};
    use crate::streams::{Broker, BrokerConfig, BrokerStreamManager};
    use crate::testing::{test_app_config, test_context, MockTransport};
    use futures::stream;
    use serde_json::json;

    fn double() -> StepDescriptor {
        StepDescriptor::from_fn("double", StepInput::named("N"), |p: Option<Payload>, _c, _a| async move {
            let n = p.and_then(|p| p.value().as_i64()).unwrap_or_default();
            Ok(Some(Payload::new("Doubled", json!(n * 2))))
        })
    }

    fn broker_manager() -> (Arc<Broker>, Arc<dyn StreamManager>) {
        let broker = Arc::new(Broker::new(BrokerConfig::default()).unwrap());
        let manager = Arc::new(BrokerStreamManager::new(Arc::clone(&broker)));
        (broker, manager)
    }

    #[tokio::test]
    async fn test_execute_returns_result() {
        let config = test_app_config().with_event("calc", EventDescriptor::new(EventType::Post));
        let definition = AppDefinition::new().event(EventDefinition::new("calc").step(double()));
        let mut engine = AppEngine::new(config, definition);
        engine.start().await.unwrap();

        let out = engine
            .execute("calc", test_context("calc"), Some(Payload::new("N", json!(21))), StepArgs::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.value(), &json!(42));
    }

    #[tokio::test]
    async fn test_execute_requires_start_and_known_event() {
        let config = test_app_config().with_event("calc", EventDescriptor::new(EventType::Post));
        let definition = AppDefinition::new().event(EventDefinition::new("calc").step(double()));
        let mut engine = AppEngine::new(config, definition);

        let err = engine
            .execute("calc", test_context("calc"), None, StepArgs::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        engine.start().await.unwrap();
        let err = engine
            .execute("other", test_context("other"), None, StepArgs::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let settings = EventSettings {
            response_timeout: 0.5,
            ..EventSettings::default()
        };
        let config = test_app_config()
            .with_event("slow", EventDescriptor::new(EventType::Get).with_settings(settings));
        let slow = StepDescriptor::from_fn("slow", StepInput::None, |_p, _c, _a| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        });
        let mut engine = AppEngine::new(config, AppDefinition::new().event(EventDefinition::new("slow").step(slow)));
        engine.start().await.unwrap();

        let err = engine
            .execute("slow", test_context("slow"), None, StepArgs::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_start_requires_stream_manager_for_stream_events() {
        let config = test_app_config().with_event(
            "calc",
            EventDescriptor::new(EventType::Post).with_write_stream(WriteStreamDescriptor::new("out")),
        );
        let definition = AppDefinition::new().event(EventDefinition::new("calc").step(double()));
        let mut engine = AppEngine::new(config, definition);
        assert!(engine.start().await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_start_rejects_configured_event_without_definition() {
        let config = test_app_config().with_event("calc", EventDescriptor::new(EventType::Post));
        let mut engine = AppEngine::new(config, AppDefinition::new());
        assert!(engine.start().await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_spawned_results_are_written_in_batches() {
        let mut event = EventDescriptor::new(EventType::Post)
            .with_write_stream(WriteStreamDescriptor::new("numbers"));
        event.config.stream.batch_size = 2;
        let config = test_app_config().with_event("count", event);
        let spawn = StepDescriptor::spawn_fn("count", StepInput::None, |_p, _c, _a| {
            stream::iter((1..=5).map(|n| Ok(Payload::new("N", json!(n)))))
        });
        let definition = AppDefinition::new().event(EventDefinition::new("count").step(spawn).step(double()));
        let (broker, manager) = broker_manager();
        broker.ensure_group("numbers", "reader");
        let mut engine = AppEngine::new(config, definition).with_stream_manager(manager);
        engine.start().await.unwrap();

        let last = engine
            .execute("count", test_context("count"), None, StepArgs::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.value(), &json!(10));

        let consumed = broker.consume("numbers", "reader", "c", 100);
        let values: Vec<String> = consumed.messages.iter().map(|m| m.datatype.clone()).collect();
        assert_eq!(values, vec!["Doubled"; 5]);
    }

    #[tokio::test]
    async fn test_clients_built_from_connections() {
        let config = test_app_config()
            .with_connection(
                "inventory",
                crate::config::AppConnection::new("inventory", "1.0").with_hosts(["http://h1"]),
            )
            .with_event("calc", EventDescriptor::new(EventType::Post));
        let definition = AppDefinition::new().event(EventDefinition::new("calc").step(double()));
        let mut engine = AppEngine::new(config, definition)
            .with_client_transport(Arc::new(MockTransport::new()));
        engine.start().await.unwrap();

        assert_eq!(engine.client("inventory").unwrap().key(), "inventory");
        assert!(engine.client("missing").is_none());
    }
}
