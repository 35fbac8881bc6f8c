//! Long-running STREAM and SERVICE loops.

use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::app_engine::{AppEngine, EventRuntime};
use super::latch::{LatchGuard, RunLatch};
use crate::config::EventType;
use crate::context::{EventContext, TrackIds};
use crate::errors::{ConfigurationError, EngineError, EngineResult};
use crate::observability::StreamStats;
use crate::retry::RetryState;
use crate::steps::StepArgs;
use crate::streams::{StreamEvent, StreamManager};
use crate::utils::generate_id;

/// Outcome of one message of a read batch.
enum Processed {
    Done(StreamEvent),
    Failed(String, EngineError),
    Undecodable(EngineError),
}

/// Tracks the transport error state of a loop so only transitions are logged.
#[derive(Debug, Default)]
struct ErrorEpisode {
    last_error: Option<String>,
    backoff: RetryState,
}

impl ErrorEpisode {
    fn failed(&mut self, event_name: &str, error: &EngineError) {
        let message = error.to_string();
        if self.last_error.as_deref() != Some(message.as_str()) {
            tracing::warn!(
                event_name,
                error = %error,
                attempt = self.backoff.attempt,
                "Stream backend error; backing off"
            );
            self.last_error = Some(message);
        }
    }

    fn recovered(&mut self, event_name: &str) -> bool {
        if self.last_error.take().is_some() {
            tracing::info!(event_name, "Stream backend recovered");
            self.backoff.reset();
            true
        } else {
            false
        }
    }
}

/// Sleeps for `duration` unless the latch is stopped first.
async fn pause(latch: &RunLatch, duration: Duration) {
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = latch.stopped() => {}
    }
}

impl AppEngine {
    /// Consumes the read stream of `event_name` until stopped.
    ///
    /// Each cycle reads one batch per configured queue, processes messages
    /// concurrently under the stream timeout and acknowledges the ones that
    /// succeeded. Backend errors are retried with backoff; only
    /// configuration errors end the loop early.
    pub async fn read_stream(&self, event_name: &str) -> EngineResult<StreamStats> {
        let runtime = self.runtime(event_name)?;
        let read = runtime.descriptor().read_stream.clone().ok_or_else(|| {
            EngineError::configuration(format!("event '{event_name}' has no read stream"))
        })?;
        let manager = Arc::clone(self.stream_manager()?);

        let latch = self.latch(event_name);
        if !latch.try_acquire() {
            return Err(ConfigurationError::already_running(event_name).into());
        }
        let _guard = LatchGuard(&latch);

        let consumer_id = format!("{}.{}", read.consumer_group, generate_id());
        let backoff_config = self.config.engine.stream_backoff.clone();
        let mut stats = StreamStats::new();
        let mut episode = ErrorEpisode::default();
        tracing::info!(
            app_key = %self.app_key,
            event_name,
            consumer_group = %read.consumer_group,
            queues = ?read.queues,
            "Starting stream loop"
        );

        while latch.is_running() {
            stats.start_cycle();
            for (queue, stream_name) in read.queue_streams() {
                if !latch.is_running() {
                    break;
                }
                let cycle = self
                    .read_cycle(
                        &runtime,
                        manager.as_ref(),
                        &stream_name,
                        &read.consumer_group,
                        &consumer_id,
                        &queue,
                        &mut stats,
                    )
                    .await;
                match cycle {
                    Ok(()) => {
                        if episode.recovered(event_name) {
                            stats.record_recovery();
                        }
                    }
                    Err(e) if e.is_configuration() => {
                        tracing::error!(event_name, error = %e, "Stream loop unexpectedly stopped");
                        return Err(e);
                    }
                    Err(e) => {
                        stats.record_transport_error();
                        episode.failed(event_name, &e);
                        let delay = episode.backoff.calculate_delay(&backoff_config);
                        episode.backoff.increment(&backoff_config);
                        pause(&latch, delay).await;
                    }
                }
            }
            stats.end_cycle();

            if stats.cycle_events() > 0 {
                tracing::info!(
                    event_name,
                    events = stats.cycle_events(),
                    throughput = stats.cycle_throughput(),
                    error_rate = stats.error_rate(),
                    "Stream cycle processed"
                );
            } else if episode.last_error.is_none() {
                pause(&latch, self.config.engine.read_stream_interval()).await;
            }
        }

        tracing::info!(event_name, stats = %stats.to_dict(), "Stream loop stopped");
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_cycle(
        &self,
        runtime: &EventRuntime,
        manager: &dyn StreamManager,
        stream_name: &str,
        group: &str,
        consumer_id: &str,
        queue: &str,
        stats: &mut StreamStats,
    ) -> EngineResult<()> {
        let stream_config = &runtime.descriptor().config.stream;
        manager.ensure_consumer_group(stream_name, group).await?;
        let batch = manager
            .read_stream(
                stream_name,
                group,
                consumer_id,
                stream_config.effective_batch_size(),
                self.config.engine.read_stream_timeout(),
                &runtime.stage.registry,
            )
            .await?;
        stats.record_missed(batch.missed);
        if batch.is_empty() {
            return Ok(());
        }

        let timeout = stream_config.timeout();
        let processing = batch.events.into_iter().map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => return Processed::Undecodable(e),
            };
            let context = event.context(&self.app_key, runtime.name());
            let run = self.run_event(
                runtime,
                context,
                Some(event.payload.clone()),
                StepArgs::new(),
                Some(queue),
            );
            match tokio::time::timeout(timeout, run).await {
                Ok(Ok(_)) => Processed::Done(event),
                Ok(Err(e)) => Processed::Failed(event.msg_id, e),
                Err(_) => Processed::Failed(
                    event.msg_id,
                    EngineError::timeout(format!("process {stream_name}"), timeout),
                ),
            }
        });

        let mut ack_error = None;
        for outcome in join_all(processing).await {
            match outcome {
                Processed::Done(event) => {
                    stats.record_event(false);
                    if let Err(e) = manager.ack_read_stream(stream_name, group, &event).await {
                        ack_error = ack_error.or(Some(e));
                    }
                }
                Processed::Failed(msg_id, e) => {
                    stats.record_event(true);
                    tracing::error!(
                        event_name = %runtime.name(),
                        stream_name,
                        msg_id = %msg_id,
                        error = %e,
                        "Message processing failed"
                    );
                }
                Processed::Undecodable(e) => {
                    stats.record_decode_error();
                    tracing::warn!(event_name = %runtime.name(), stream_name, error = %e, "Skipping undecodable message");
                }
            }
        }
        ack_error.map_or(Ok(()), Err)
    }

    /// Runs the service generator of `event_name`, executing every payload
    /// it yields, until stopped or the generator ends.
    pub async fn service_loop(&self, event_name: &str) -> EngineResult<StreamStats> {
        let runtime = self.runtime(event_name)?;
        let service = runtime.stage.service.clone().ok_or_else(|| {
            EngineError::configuration(format!("event '{event_name}' has no service generator"))
        })?;

        let latch = self.latch(event_name);
        if !latch.try_acquire() {
            return Err(ConfigurationError::already_running(event_name).into());
        }
        let _guard = LatchGuard(&latch);

        let mut stats = StreamStats::new();
        let context = EventContext::for_request(&self.app_key, event_name, TrackIds::new());
        let mut items = service.generate(context);
        tracing::info!(app_key = %self.app_key, event_name, "Starting service loop");

        stats.start_cycle();
        while latch.is_running() {
            let item = tokio::select! {
                item = items.next() => item,
                () = latch.stopped() => break,
            };
            let Some(item) = item else {
                tracing::info!(event_name, "Service generator exhausted");
                break;
            };
            let result = match item {
                Ok(payload) => {
                    let context = EventContext::for_request(&self.app_key, event_name, TrackIds::new());
                    self.execute(event_name, context, Some(payload), StepArgs::new())
                        .await
                }
                Err(e) => Err(e),
            };
            stats.record_event(result.is_err());
            if let Err(e) = result {
                tracing::error!(event_name, error = %e, "Service item failed");
            }
        }
        stats.end_cycle();

        tracing::info!(event_name, stats = %stats.to_dict(), "Service loop stopped");
        Ok(stats)
    }

    /// Spawns the loop of every STREAM and SERVICE event.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<(String, JoinHandle<EngineResult<StreamStats>>)> {
        self.events
            .iter()
            .filter_map(|(name, runtime)| {
                let descriptor = runtime.descriptor();
                let is_stream =
                    descriptor.event_type == EventType::Stream && descriptor.read_stream.is_some();
                let is_service =
                    descriptor.event_type == EventType::Service && runtime.stage.service.is_some();
                if !is_stream && !is_service {
                    return None;
                }
                let engine = Arc::clone(self);
                let event_name = name.clone();
                let handle = tokio::spawn(async move {
                    if is_stream {
                        engine.read_stream(&event_name).await
                    } else {
                        engine.service_loop(&event_name).await
                    }
                });
                Some((name.clone(), handle))
            })
            .collect()
    }
}
