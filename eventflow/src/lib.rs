//! # Eventflow
//!
//! An event-driven application engine.
//!
//! Applications declare events as ordered lists of typed steps. Eventflow
//! provides:
//!
//! - **Type-dispatched pipelines**: each payload runs through the next step that accepts its datatype
//! - **Spawn steps and stage splitting**: fan out a sequence of payloads, or cut an event into stream-connected stages
//! - **Collectors**: concurrent sibling sub-steps with declared dependencies
//! - **Stream consumers**: read loops with batching, acknowledgement and backoff on backend errors
//! - **Peer clients**: round-robin calls to other applications behind circuit breakers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use eventflow::prelude::*;
//!
//! let config = AppConfig::new(AppDescriptor::new("shop", "1.0"))
//!     .with_event("price", EventDescriptor::new(EventType::Post));
//! let definition = AppDefinition::new().event(
//!     EventDefinition::new("price").step(StepDescriptor::typed("price", price_order)),
//! );
//!
//! let mut engine = AppEngine::new(config, definition);
//! engine.start().await?;
//! let priced = engine.execute("price", context, Some(order), StepArgs::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod balancer;
pub mod client;
pub mod collector;
pub mod compression;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod payload;
pub mod pipeline;
pub mod retry;
pub mod steps;
pub mod streams;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::balancer::{CircuitBreakLoadBalancer, CircuitBreakerSettings, CircuitState};
    pub use crate::client::{AppsClient, ClientTransport};
    pub use crate::collector::{CollectStep, Collector, CollectorSpec};
    pub use crate::compression::Compression;
    pub use crate::config::{
        AppConfig, AppConnection, AppDescriptor, EngineSettings, EventDescriptor, EventType,
        QueueStrategy, ReadStreamDescriptor, WriteStreamDescriptor,
    };
    pub use crate::context::{EventContext, TrackIds};
    pub use crate::engine::AppEngine;
    pub use crate::errors::{ConfigurationError, ContractErrorInfo, EngineError, EngineResult};
    pub use crate::observability::{init_tracing, LogFormat, StreamStats};
    pub use crate::payload::{DataObject, Payload, Serialization, TypeRegistry};
    pub use crate::retry::{RetryConfig, RetryState};
    pub use crate::steps::{
        AppDefinition, EventDefinition, ServiceGenerator, StepArgs, StepDescriptor, StepInput,
    };
    pub use crate::streams::{Broker, BrokerConfig, BrokerStreamManager, StreamManager};
    pub use crate::utils::{generate_id, iso_timestamp, Timestamp};
}
