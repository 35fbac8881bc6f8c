//! Execution context and track ids.

mod event;
pub mod track;

pub use event::EventContext;
pub use track::TrackIds;
