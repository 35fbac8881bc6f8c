//! Steps: the units of application logic.
//!
//! A step consumes an optional payload and produces an optional payload.
//! Spawn steps produce a sequence of payloads instead and are only legal as
//! the first step of a pipeline. Service generators feed SERVICE events.

mod descriptor;
mod event;

pub use descriptor::{StepDescriptor, StepInput, StepKind};
pub use event::{AppDefinition, EventDefinition, EventItem};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;

use crate::context::EventContext;
use crate::errors::{EngineError, EngineResult};
use crate::payload::Payload;

/// Extra arguments passed alongside the payload, such as request query values.
pub type StepArgs = serde_json::Map<String, Value>;

/// A single-valued step.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Processes `payload`, returning the payload handed to the next step.
    async fn invoke(
        &self,
        payload: Option<Payload>,
        context: &EventContext,
        args: &StepArgs,
    ) -> EngineResult<Option<Payload>>;
}

/// A step yielding several payloads, each continuing through the pipeline.
pub trait SpawnStep: Send + Sync + Debug {
    /// Starts the sequence. Items are produced lazily.
    fn spawn(
        &self,
        payload: Option<Payload>,
        context: &EventContext,
        args: &StepArgs,
    ) -> BoxStream<'static, EngineResult<Payload>>;
}

/// The generator behind a SERVICE event. Called once per loop.
pub trait ServiceGenerator: Send + Sync + Debug {
    /// Returns the (possibly unbounded) sequence of payloads to execute.
    fn generate(&self, context: EventContext) -> BoxStream<'static, EngineResult<Payload>>;
}

/// A step backed by an async closure.
pub struct FnStep<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnStep<F>
where
    F: Fn(Option<Payload>, EventContext, StepArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Payload>>> + Send,
{
    /// Creates a new function-based step.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStep<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(Option<Payload>, EventContext, StepArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Payload>>> + Send,
{
    async fn invoke(
        &self,
        payload: Option<Payload>,
        context: &EventContext,
        args: &StepArgs,
    ) -> EngineResult<Option<Payload>> {
        (self.func)(payload, context.clone(), args.clone())
            .await
            .map_err(|e| into_step_error(&self.name, e))
    }
}

/// A spawn step backed by a closure returning a stream.
pub struct FnSpawnStep<F> {
    name: String,
    func: F,
}

impl<F, S> FnSpawnStep<F>
where
    F: Fn(Option<Payload>, EventContext, StepArgs) -> S + Send + Sync,
    S: Stream<Item = anyhow::Result<Payload>> + Send + 'static,
{
    /// Creates a new function-based spawn step.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnSpawnStep<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSpawnStep").field("name", &self.name).finish()
    }
}

impl<F, S> SpawnStep for FnSpawnStep<F>
where
    F: Fn(Option<Payload>, EventContext, StepArgs) -> S + Send + Sync,
    S: Stream<Item = anyhow::Result<Payload>> + Send + 'static,
{
    fn spawn(
        &self,
        payload: Option<Payload>,
        context: &EventContext,
        args: &StepArgs,
    ) -> BoxStream<'static, EngineResult<Payload>> {
        let name = self.name.clone();
        (self.func)(payload, context.clone(), args.clone())
            .map(move |item| item.map_err(|e| into_step_error(&name, e)))
            .boxed()
    }
}

/// A service generator backed by a closure returning a stream.
pub struct FnService<F> {
    name: String,
    func: F,
}

impl<F, S> FnService<F>
where
    F: Fn(EventContext) -> S + Send + Sync,
    S: Stream<Item = anyhow::Result<Payload>> + Send + 'static,
{
    /// Creates a new function-based service generator.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnService<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnService").field("name", &self.name).finish()
    }
}

impl<F, S> ServiceGenerator for FnService<F>
where
    F: Fn(EventContext) -> S + Send + Sync,
    S: Stream<Item = anyhow::Result<Payload>> + Send + 'static,
{
    fn generate(&self, context: EventContext) -> BoxStream<'static, EngineResult<Payload>> {
        let name = self.name.clone();
        (self.func)(context)
            .map(move |item| item.map_err(|e| into_step_error(&name, e)))
            .boxed()
    }
}

/// Keeps engine errors raised inside user code intact; wraps anything else.
pub(crate) fn into_step_error(step: &str, error: anyhow::Error) -> EngineError {
    match error.downcast::<EngineError>() {
        Ok(engine) => engine,
        Err(other) => EngineError::step(step, other),
    }
}
