use indexmap::IndexMap;
use std::sync::Arc;

use super::{ServiceGenerator, StepDescriptor};

/// One entry of an event's declared step list.
#[derive(Debug, Clone)]
pub enum EventItem {
    /// A step.
    Step(StepDescriptor),
    /// Stage boundary: following steps run as a separate stream-fed event.
    Shuffle,
}

/// The code side of an event: its ordered steps and optional service generator.
#[derive(Debug, Clone)]
pub struct EventDefinition {
    name: String,
    items: Vec<EventItem>,
    service: Option<Arc<dyn ServiceGenerator>>,
}

impl EventDefinition {
    /// Creates an event with no steps.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            service: None,
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.items.push(EventItem::Step(step));
        self
    }

    /// Appends a stage boundary.
    #[must_use]
    pub fn shuffle(mut self) -> Self {
        self.items.push(EventItem::Shuffle);
        self
    }

    /// Sets the generator for SERVICE events.
    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn ServiceGenerator>) -> Self {
        self.service = Some(service);
        self
    }

    /// Event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared items in order.
    #[must_use]
    pub fn items(&self) -> &[EventItem] {
        &self.items
    }

    /// The service generator, if any.
    #[must_use]
    pub fn service(&self) -> Option<&Arc<dyn ServiceGenerator>> {
        self.service.as_ref()
    }
}

/// All event definitions of an application, keyed by event name.
#[derive(Debug, Clone, Default)]
pub struct AppDefinition {
    events: IndexMap<String, EventDefinition>,
}

impl AppDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event definition.
    #[must_use]
    pub fn event(mut self, event: EventDefinition) -> Self {
        self.events.insert(event.name().to_string(), event);
        self
    }

    /// Looks up an event definition.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&EventDefinition> {
        self.events.get(name)
    }

    /// Event names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }
}
