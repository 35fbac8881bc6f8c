//! Stage splitting.
//!
//! An event's step list may contain shuffle markers. Steps before the first
//! marker form stage 0, named after the event. Each later run of steps forms
//! a STREAM stage named `{event}${first_step}` that reads an auto-named
//! stream fed by the previous stage. The last stage writes to the event's
//! configured write stream.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::config::{
    EventDescriptor, EventType, ReadStreamDescriptor, WriteStreamDescriptor, AUTO,
};
use crate::errors::{ConfigurationError, ContractErrorInfo, EngineResult};
use crate::payload::TypeRegistry;
use crate::steps::{EventDefinition, EventItem, ServiceGenerator, StepDescriptor};

/// Steps of one stage keyed by name; insertion order is dispatch priority.
pub type EffectiveStepSet = IndexMap<String, StepDescriptor>;

/// Separator between an event name and the first step of a later stage.
pub const STAGE_SEPARATOR: char = '$';

/// Name of the stream bridging into the stage that starts at `step_name`.
#[must_use]
pub fn auto_stream_name(app_key: &str, event_name: &str, step_name: &str) -> String {
    format!("{app_key}.{event_name}.{step_name}")
}

/// Name of the stage that starts at `step_name`.
#[must_use]
pub fn stage_event_name(event_name: &str, step_name: &str) -> String {
    format!("{event_name}{STAGE_SEPARATOR}{step_name}")
}

/// One independently runnable part of an event.
#[derive(Debug, Clone)]
pub struct EventStage {
    /// Runtime event name.
    pub name: String,
    /// Name of the declared event this stage belongs to.
    pub base_event: String,
    /// Position among the event's stages.
    pub index: usize,
    /// Steps run by this stage.
    pub steps: EffectiveStepSet,
    /// Configuration with this stage's stream descriptors.
    pub descriptor: EventDescriptor,
    /// Datatypes accepted when reading this stage's input stream.
    pub registry: TypeRegistry,
    /// Generator, kept on stage 0 of SERVICE events.
    pub service: Option<Arc<dyn ServiceGenerator>>,
}

fn split_error(event_name: &str, message: String) -> ConfigurationError {
    ConfigurationError::new(message).with_error_info(
        ContractErrorInfo::new("CONFIG-005-SPLIT", "Event cannot be split into stages")
            .with_fix_hint("Every shuffle marker must be surrounded by steps and step names must be unique.")
            .with_context_entry("event", event_name),
    )
}

/// Groups declared items into runs of steps separated by shuffle markers.
fn group_steps(definition: &EventDefinition) -> EngineResult<Vec<Vec<StepDescriptor>>> {
    let event_name = definition.name();
    let mut groups: Vec<Vec<StepDescriptor>> = vec![Vec::new()];
    for item in definition.items() {
        match item {
            EventItem::Step(step) => {
                if let Some(current) = groups.last_mut() {
                    current.push(step.clone());
                }
            }
            EventItem::Shuffle => groups.push(Vec::new()),
        }
    }

    if let Some(position) = groups.iter().position(Vec::is_empty) {
        let message = if groups.len() == 1 {
            format!("event '{event_name}' has no steps")
        } else {
            format!("event '{event_name}' has an empty stage at position {position}")
        };
        return Err(split_error(event_name, message).into());
    }
    Ok(groups)
}

fn to_step_set(event_name: &str, steps: Vec<StepDescriptor>) -> EngineResult<EffectiveStepSet> {
    let mut set = EffectiveStepSet::new();
    for (index, step) in steps.into_iter().enumerate() {
        if step.is_spawn() && index > 0 {
            return Err(ConfigurationError::spawn_not_first(step.name(), index).into());
        }
        let name = step.name().to_string();
        if set.insert(name.clone(), step).is_some() {
            return Err(split_error(
                event_name,
                format!("event '{event_name}' declares step '{name}' twice in one stage"),
            )
            .into());
        }
    }
    Ok(set)
}

/// Splits an event into its runtime stages.
pub fn split_event_stages(
    app_key: &str,
    definition: &EventDefinition,
    descriptor: &EventDescriptor,
) -> EngineResult<Vec<EventStage>> {
    let event_name = definition.name();
    let groups = group_steps(definition)?;
    let stage_count = groups.len();

    let first_steps: Vec<String> = groups
        .iter()
        .map(|g| g.first().map(|s| s.name().to_string()).unwrap_or_default())
        .collect();
    let source_queues: Vec<String> = descriptor
        .read_stream
        .as_ref()
        .map_or_else(|| vec![AUTO.to_string()], |r| r.queues.clone());

    let mut stages = Vec::with_capacity(stage_count);
    for (index, group) in groups.into_iter().enumerate() {
        let steps = to_step_set(event_name, group)?;
        let mut registry = TypeRegistry::new();
        for step in steps.values() {
            step.register_input(&mut registry);
        }

        let mut stage_descriptor = descriptor.clone();
        let name = if index == 0 {
            event_name.to_string()
        } else {
            let stage_name = stage_event_name(event_name, &first_steps[index]);
            stage_descriptor.event_type = EventType::Stream;
            stage_descriptor.read_stream = Some(
                ReadStreamDescriptor::new(
                    auto_stream_name(app_key, event_name, &first_steps[index]),
                    format!("{app_key}.{stage_name}"),
                )
                .with_queues(source_queues.clone()),
            );
            stage_name
        };
        if index + 1 < stage_count {
            stage_descriptor.write_stream = Some(WriteStreamDescriptor::new(auto_stream_name(
                app_key,
                event_name,
                &first_steps[index + 1],
            )));
        }

        tracing::debug!(
            event_name,
            stage = %name,
            steps = steps.len(),
            "Prepared event stage"
        );
        stages.push(EventStage {
            name,
            base_event: event_name.to_string(),
            index,
            steps,
            descriptor: stage_descriptor,
            registry,
            service: if index == 0 { definition.service().cloned() } else { None },
        });
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventType, QueueStrategy};
    use crate::payload::Payload;
    use crate::steps::StepInput;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn step(name: &str, input: StepInput) -> StepDescriptor {
        StepDescriptor::from_fn(name, input, |p: Option<Payload>, _c, _a| async move { Ok(p) })
    }

    fn post_event() -> EventDescriptor {
        EventDescriptor::new(EventType::Post).with_write_stream(WriteStreamDescriptor::new("results"))
    }

    #[test]
    fn test_split_on_shuffle() {
        let definition = EventDefinition::new("order")
            .step(step("a", StepInput::None))
            .shuffle()
            .step(step("b", StepInput::named("A")))
            .step(step("c", StepInput::named("B")));

        let stages = split_event_stages("shop.1x0", &definition, &post_event()).unwrap();
        assert_eq!(stages.len(), 2);

        let first = &stages[0];
        assert_eq!(first.name, "order");
        assert_eq!(first.steps.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(first.descriptor.event_type, EventType::Post);
        assert_eq!(
            first.descriptor.write_stream.as_ref().unwrap().name,
            "shop.1x0.order.b"
        );
        assert_eq!(
            first.descriptor.write_stream.as_ref().unwrap().queue_strategy,
            QueueStrategy::Propagate
        );

        let second = &stages[1];
        assert_eq!(second.name, "order$b");
        assert_eq!(second.base_event, "order");
        assert_eq!(second.steps.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(second.descriptor.event_type, EventType::Stream);
        let read = second.descriptor.read_stream.as_ref().unwrap();
        assert_eq!(read.name, "shop.1x0.order.b");
        assert_eq!(read.consumer_group, "shop.1x0.order$b");
        assert_eq!(second.descriptor.write_stream.as_ref().unwrap().name, "results");
        assert!(second.registry.contains("A"));
        assert!(second.registry.contains("B"));
    }

    #[test]
    fn test_split_is_deterministic() {
        let definition = EventDefinition::new("e")
            .step(step("a", StepInput::None))
            .shuffle()
            .step(step("b", StepInput::Any))
            .shuffle()
            .step(step("c", StepInput::Any));
        let one = split_event_stages("app.1", &definition, &post_event()).unwrap();
        let two = split_event_stages("app.1", &definition, &post_event()).unwrap();

        let streams = |stages: &[EventStage]| -> Vec<Option<String>> {
            stages
                .iter()
                .map(|s| s.descriptor.read_stream.as_ref().map(|r| r.name.clone()))
                .collect()
        };
        assert_eq!(streams(&one), streams(&two));
        assert_eq!(
            streams(&one),
            vec![None, Some("app.1.e.b".to_string()), Some("app.1.e.c".to_string())]
        );
        assert_eq!(one[2].name, "e$c");
        assert!(one[1].registry.accepts_any());
        assert!(!one[0].registry.accepts_any());
        assert_eq!(one[1].descriptor.write_stream.as_ref().unwrap().name, "app.1.e.c");
    }

    #[test]
    fn test_without_shuffle_is_single_stage() {
        let definition = EventDefinition::new("e").step(step("a", StepInput::None));
        let stages = split_event_stages("app.1", &definition, &post_event()).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].descriptor, post_event());
    }

    #[test]
    fn test_empty_stage_is_rejected() {
        let definition = EventDefinition::new("e")
            .step(step("a", StepInput::None))
            .shuffle();
        let err = split_event_stages("app.1", &definition, &post_event()).unwrap_err();
        assert!(err.is_configuration());

        let empty = EventDefinition::new("e");
        assert!(split_event_stages("app.1", &empty, &post_event()).is_err());
    }

    #[test]
    fn test_spawn_must_open_its_stage() {
        let spawn = StepDescriptor::spawn_fn("gen", StepInput::Any, |_p, _c, _a| {
            stream::iter(vec![Ok(Payload::new("N", json!(1)))])
        });
        let definition = EventDefinition::new("e")
            .step(step("a", StepInput::None))
            .step(spawn.clone());
        assert!(split_event_stages("app.1", &definition, &post_event())
            .unwrap_err()
            .is_configuration());

        let definition = EventDefinition::new("e")
            .step(step("a", StepInput::None))
            .shuffle()
            .step(spawn);
        assert!(split_event_stages("app.1", &definition, &post_event()).is_ok());
    }

    #[test]
    fn test_duplicate_step_names_are_rejected() {
        let definition = EventDefinition::new("e")
            .step(step("a", StepInput::None))
            .step(step("a", StepInput::Any));
        assert!(split_event_stages("app.1", &definition, &post_event()).is_err());
    }
}
