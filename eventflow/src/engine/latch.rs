//! Run/stop latch held by a long-running loop.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// Binary run latch: at most one loop holds it at a time.
///
/// A loop acquires the latch, checks [`RunLatch::is_running`] once per cycle
/// and releases it on exit. [`RunLatch::stop`] asks the holder to finish.
#[derive(Debug, Default)]
pub struct RunLatch {
    state: AtomicU8,
    notify: Notify,
}

impl RunLatch {
    /// Creates an idle latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the latch. Returns false if another loop holds it.
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether the holder should keep running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Whether some loop holds the latch, running or stopping.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state.load(Ordering::SeqCst) != IDLE
    }

    /// Asks the holder to stop. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let stopped = self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.notify.notify_waiters();
        stopped
    }

    /// Gives the latch back.
    pub fn release(&self) {
        self.state.store(IDLE, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once a stop was requested or the latch was released.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

/// Releases a latch when dropped.
#[derive(Debug)]
pub(crate) struct LatchGuard<'a>(pub(crate) &'a RunLatch);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
