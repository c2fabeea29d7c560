//! Cooperative server shutdown.

use asupersync::sync::Notify;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag for the accept loop.
///
/// Cloning yields another handle to the same signal. This server serves one
/// request per connection, so there is no drain phase: triggering stops the
/// accept loop and in-flight connections finish on their own.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopping: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create a signal in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Wait until shutdown is requested.
    pub async fn triggered(&self) {
        loop {
            if self.is_shutting_down() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_shutting_down() {
                return;
            }
            notified.await;
        }
    }
}
