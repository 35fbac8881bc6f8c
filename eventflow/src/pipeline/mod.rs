//! Pipeline execution.
//!
//! This module provides:
//! - Stage splitting of event step lists at shuffle markers
//! - The type-dispatching step executor with spawn support and pacing

mod executor;
mod split;

pub use executor::{execute_steps, find_next_step, ExecutionSettings, PipelineExecutor};
pub use split::{
    auto_stream_name, split_event_stages, stage_event_name, EffectiveStepSet, EventStage,
    STAGE_SEPARATOR,
};
