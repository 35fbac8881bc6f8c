//! Application engine: request execution and long-running event loops.

mod app_engine;
mod latch;
mod loops;


pub use app_engine::AppEngine;
pub use latch::RunLatch;
