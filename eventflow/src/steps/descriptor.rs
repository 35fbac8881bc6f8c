use futures::stream::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::{FnSpawnStep, FnStep, SpawnStep, Step, StepArgs};
use crate::context::EventContext;
use crate::payload::{DataObject, Payload, TypeRegistry};

/// Which payloads a step accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// Accepts the absent payload only.
    None,
    /// Accepts payloads with this datatype tag.
    Type {
        /// Datatype tag.
        datatype: String,
        /// Whether payloads of this type are frozen when decoded.
        frozen: bool,
    },
    /// Accepts any present payload.
    Any,
}

impl StepInput {
    /// Input of a [`DataObject`] type.
    #[must_use]
    pub fn of<T: DataObject>() -> Self {
        Self::Type {
            datatype: T::DATATYPE.to_string(),
            frozen: T::FROZEN,
        }
    }

    /// Input by datatype name.
    #[must_use]
    pub fn named(datatype: impl Into<String>) -> Self {
        Self::Type {
            datatype: datatype.into(),
            frozen: false,
        }
    }

    /// Whether `payload` is accepted.
    #[must_use]
    pub fn accepts(&self, payload: Option<&Payload>) -> bool {
        match (self, payload) {
            (Self::None, None) => true,
            (Self::Type { datatype, .. }, Some(p)) => datatype == p.datatype(),
            (Self::Any, Some(_)) => true,
            _ => false,
        }
    }
}

/// How a step runs.
#[derive(Clone)]
pub enum StepKind {
    /// One payload in, at most one out.
    Single(Arc<dyn Step>),
    /// One payload in, a sequence out.
    Spawn(Arc<dyn SpawnStep>),
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(step) => f.debug_tuple("Single").field(step).finish(),
            Self::Spawn(step) => f.debug_tuple("Spawn").field(step).finish(),
        }
    }
}

/// A named step with its declared input and output.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    name: String,
    input: StepInput,
    output: Option<String>,
    kind: StepKind,
}

impl StepDescriptor {
    /// Creates a descriptor for a single-valued step.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        input: StepInput,
        output: Option<String>,
        step: Arc<dyn Step>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            kind: StepKind::Single(step),
        }
    }

    /// Creates a descriptor for a spawn step.
    #[must_use]
    pub fn spawn(
        name: impl Into<String>,
        input: StepInput,
        output: Option<String>,
        step: Arc<dyn SpawnStep>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            kind: StepKind::Spawn(step),
        }
    }

    /// Single-valued step from an untyped async closure.
    #[must_use]
    pub fn from_fn<F, Fut>(name: impl Into<String>, input: StepInput, func: F) -> Self
    where
        F: Fn(Option<Payload>, EventContext, StepArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Payload>>> + Send + 'static,
    {
        let name = name.into();
        let step = FnStep::new(name.clone(), func);
        Self::new(name, input, None, Arc::new(step))
    }

    /// Typed step: `I` in, `O` out.
    #[must_use]
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        I: DataObject,
        O: DataObject,
        F: Fn(I, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let func = Arc::new(func);
        let name = name.into();
        let step = FnStep::new(name.clone(), move |payload: Option<Payload>, ctx, _args| {
            let func = Arc::clone(&func);
            async move {
                let input = payload
                    .ok_or_else(|| anyhow::anyhow!("missing {} payload", I::DATATYPE))?
                    .to_data::<I>()?;
                let output = func(input, ctx).await?;
                Ok::<_, anyhow::Error>(Some(Payload::from_data(&output)?))
            }
        });
        Self::new(name, StepInput::of::<I>(), Some(O::DATATYPE.to_string()), Arc::new(step))
    }

    /// Typed first step taking no payload, only the request arguments.
    #[must_use]
    pub fn initial<O, F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        O: DataObject,
        F: Fn(EventContext, StepArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let func = Arc::new(func);
        let name = name.into();
        let step = FnStep::new(name.clone(), move |_payload, ctx, args| {
            let func = Arc::clone(&func);
            async move {
                let output = func(ctx, args).await?;
                Ok::<_, anyhow::Error>(Some(Payload::from_data(&output)?))
            }
        });
        Self::new(name, StepInput::None, Some(O::DATATYPE.to_string()), Arc::new(step))
    }

    /// Spawn step from a closure returning a stream of payloads.
    #[must_use]
    pub fn spawn_fn<F, S>(name: impl Into<String>, input: StepInput, func: F) -> Self
    where
        F: Fn(Option<Payload>, EventContext, StepArgs) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Payload>> + Send + 'static,
    {
        let name = name.into();
        let step = FnSpawnStep::new(name.clone(), func);
        Self::spawn(name, input, None, Arc::new(step))
    }

    /// Typed spawn step: one `I` in, many `O` out.
    #[must_use]
    pub fn spawn_typed<I, O, F, S>(name: impl Into<String>, func: F) -> Self
    where
        I: DataObject,
        O: DataObject,
        F: Fn(I, EventContext) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<O>> + Send + 'static,
    {
        let name = name.into();
        let step = FnSpawnStep::new(name.clone(), move |payload: Option<Payload>, ctx, _args| {
            let input = payload
                .ok_or_else(|| anyhow::anyhow!("missing {} payload", I::DATATYPE))
                .and_then(|p| p.to_data::<I>().map_err(anyhow::Error::from));
            match input {
                Ok(input) => func(input, ctx)
                    .map(|item| item.and_then(|o| Payload::from_data(&o).map_err(anyhow::Error::from)))
                    .boxed(),
                Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
            }
        });
        Self::spawn(name, StepInput::of::<I>(), Some(O::DATATYPE.to_string()), Arc::new(step))
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared input.
    #[must_use]
    pub const fn input(&self) -> &StepInput {
        &self.input
    }

    /// Declared output datatype, when known.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// How the step runs.
    #[must_use]
    pub const fn kind(&self) -> &StepKind {
        &self.kind
    }

    /// Whether this is a spawn step.
    #[must_use]
    pub const fn is_spawn(&self) -> bool {
        matches!(self.kind, StepKind::Spawn(_))
    }

    /// Whether `payload` is accepted.
    #[must_use]
    pub fn accepts(&self, payload: Option<&Payload>) -> bool {
        self.input.accepts(payload)
    }

    /// Makes `registry` accept this step's input when read from a stream.
    pub fn register_input(&self, registry: &mut TypeRegistry) {
        match &self.input {
            StepInput::Type { datatype, frozen } => registry.register_name(datatype.clone(), *frozen),
            StepInput::Any => registry.accept_any(),
            StepInput::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Text {
        value: String,
    }

    impl DataObject for Text {
        const DATATYPE: &'static str = "Text";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Length {
        len: usize,
    }

    impl DataObject for Length {
        const DATATYPE: &'static str = "Length";
    }

    #[test]
    fn test_input_matching() {
        let text = Payload::new("Text", json!({}));
        assert!(StepInput::None.accepts(None));
        assert!(!StepInput::None.accepts(Some(&text)));
        assert!(StepInput::named("Text").accepts(Some(&text)));
        assert!(!StepInput::named("Other").accepts(Some(&text)));
        assert!(StepInput::Any.accepts(Some(&text)));
        assert!(!StepInput::Any.accepts(None));
    }

    #[tokio::test]
    async fn test_typed_step_converts_payloads() {
        let desc = StepDescriptor::typed("measure", |t: Text, _ctx| async move {
            Ok(Length { len: t.value.len() })
        });
        assert_eq!(desc.output(), Some("Length"));
        assert!(!desc.is_spawn());

        let StepKind::Single(step) = desc.kind() else {
            panic!("expected single step");
        };
        let input = Payload::from_data(&Text {
            value: "abcd".to_string(),
        })
        .unwrap();
        let out = step
            .invoke(Some(input), &EventContext::new("a", "e"), &StepArgs::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.to_data::<Length>().unwrap().len, 4);
    }

    #[test]
    fn test_register_input() {
        let mut registry = TypeRegistry::new();
        StepDescriptor::typed("measure", |t: Text, _ctx| async move {
            Ok(Length { len: t.value.len() })
        })
        .register_input(&mut registry);
        assert!(registry.contains("Text"));
        assert!(!registry.contains("Length"));

        StepDescriptor::from_fn("log", StepInput::Any, |p: Option<Payload>, _c, _a| async move { Ok(p) })
            .register_input(&mut registry);
        assert!(registry.contains("Length"));
    }
}
