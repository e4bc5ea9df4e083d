//! Cancellable one-shot delay used for aggregation windows.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// A delay that runs a callback once it elapses, unless cancelled first.
///
/// Resetting a window is cancel-and-replace: drop (or `cancel`) the old
/// timer and start a new one. Dropping aborts the sleeping task, so a
/// replaced timer never fires.
pub struct WindowTimer {
    handle: Option<JoinHandle<()>>,
}

impl WindowTimer {
    /// Start a timer that calls `on_expire` after `duration`.
    pub fn start<F>(duration: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + duration;
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            on_expire();
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stop the timer. No-op if it already fired.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the handle without aborting.
    ///
    /// Used from inside the expiry callback itself, where aborting would
    /// target the running task.
    pub fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for WindowTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
