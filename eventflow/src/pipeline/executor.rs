//! Type-dispatched step execution.

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use super::split::EffectiveStepSet;
use crate::config::EventStreamConfig;
use crate::context::EventContext;
use crate::errors::{ConfigurationError, EngineResult};
use crate::payload::Payload;
use crate::steps::{StepArgs, StepDescriptor, StepKind};

/// Pacing applied while executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSettings {
    /// Pause after every step that is followed by another one.
    pub step_delay: Duration,
    /// Minimum duration of one chain; the remainder is slept after the last step.
    pub throttle: Duration,
}

impl ExecutionSettings {
    /// Reads pacing from an event's stream settings.
    #[must_use]
    pub const fn from_stream_config(config: &EventStreamConfig) -> Self {
        Self {
            step_delay: config.step_delay(),
            throttle: config.throttle(),
        }
    }
}

/// Returns the first step at or after `from` that accepts `payload`.
#[must_use]
pub fn find_next_step<'a>(
    steps: &'a [StepDescriptor],
    from: usize,
    payload: Option<&Payload>,
) -> Option<(usize, &'a StepDescriptor)> {
    steps
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, step)| step.accepts(payload))
}

/// Executes an ordered step set against payloads.
///
/// Cloning is cheap; all clones share the step list.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    steps: Arc<[StepDescriptor]>,
    settings: ExecutionSettings,
}

impl PipelineExecutor {
    /// Creates an executor over `steps` in declaration order.
    #[must_use]
    pub fn new(steps: Vec<StepDescriptor>, settings: ExecutionSettings) -> Self {
        Self {
            steps: steps.into(),
            settings,
        }
    }

    /// Creates an executor over a stage's effective step set.
    #[must_use]
    pub fn for_step_set(steps: &EffectiveStepSet, settings: ExecutionSettings) -> Self {
        Self::new(steps.values().cloned().collect(), settings)
    }

    /// The steps, in dispatch priority order.
    #[must_use]
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    /// Runs the pipeline, yielding one result per completed chain.
    ///
    /// A plain pipeline yields exactly one item. A pipeline whose first
    /// matching step is a spawn step yields one item per spawned payload,
    /// lazily, in order. The sequence ends after the first error.
    pub fn execute(
        &self,
        context: EventContext,
        payload: Option<Payload>,
        args: StepArgs,
    ) -> BoxStream<'static, EngineResult<Option<Payload>>> {
        let first = find_next_step(&self.steps, 0, payload.as_ref()).map(|(i, s)| (i, s.clone()));

        match first {
            Some((0, step)) if step.is_spawn() => self.execute_spawn(&step, context, payload, args),
            Some((index, step)) if step.is_spawn() => {
                let err = ConfigurationError::spawn_not_first(step.name(), index).into();
                stream::once(future::ready(Err(err))).boxed()
            }
            _ => {
                let this = self.clone();
                stream::once(async move { this.run_chain(0, payload, &context, &args).await }).boxed()
            }
        }
    }

    fn execute_spawn(
        &self,
        step: &StepDescriptor,
        context: EventContext,
        payload: Option<Payload>,
        args: StepArgs,
    ) -> BoxStream<'static, EngineResult<Option<Payload>>> {
        let StepKind::Spawn(spawner) = step.kind() else {
            return stream::empty().boxed();
        };
        tracing::debug!(step = step.name(), "Spawning items");
        let items = spawner.spawn(payload, &context, &args);
        let this = self.clone();

        items
            .then(move |item| {
                let this = this.clone();
                let context = context.clone();
                let args = args.clone();
                async move {
                    let started = Instant::now();
                    match item {
                        Ok(p) => {
                            let result = this.run_chain(1, Some(p), &context, &args).await;
                            this.throttle(started).await;
                            result
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .scan(false, |failed, result| {
                if *failed {
                    return future::ready(None);
                }
                *failed = result.is_err();
                future::ready(Some(result))
            })
            .boxed()
    }

    /// Runs single-valued steps from position `from` until no step accepts the payload.
    async fn run_chain(
        &self,
        from: usize,
        payload: Option<Payload>,
        context: &EventContext,
        args: &StepArgs,
    ) -> EngineResult<Option<Payload>> {
        let started = Instant::now();
        let mut current = payload;
        let mut found = find_next_step(&self.steps, from, current.as_ref());

        while let Some((index, step)) = found {
            let StepKind::Single(single) = step.kind() else {
                return Err(ConfigurationError::spawn_not_first(step.name(), index).into());
            };
            let span = tracing::debug_span!("step", step = step.name(), index);
            current = single.invoke(current, context, args).instrument(span).await?;

            found = find_next_step(&self.steps, index + 1, current.as_ref());
            if found.is_some() && !self.settings.step_delay.is_zero() {
                tokio::time::sleep(self.settings.step_delay).await;
            }
        }

        if from == 0 {
            self.throttle(started).await;
        }
        Ok(current)
    }

    async fn throttle(&self, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed < self.settings.throttle {
            tokio::time::sleep(self.settings.throttle - elapsed).await;
        }
    }
}

/// Convenience wrapper: builds an executor and runs it once.
pub fn execute_steps(
    steps: &EffectiveStepSet,
    settings: ExecutionSettings,
    context: EventContext,
    payload: Option<Payload>,
    args: StepArgs,
) -> BoxStream<'static, EngineResult<Option<Payload>>> {
    PipelineExecutor::for_step_set(steps, settings).execute(context, payload, args)
}
