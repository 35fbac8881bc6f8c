//! Observability utilities: subscriber setup and loop statistics.

mod logging;
mod stats;

pub use logging::{init_tracing, init_tracing_with_default, LogFormat};
pub use stats::StreamStats;
