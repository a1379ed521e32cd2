//! Per-connection liveness timers.
//!
//! Every registered connection owns one single-shot timer armed for the
//! configured heartbeat timeout. Receiving a heartbeat cancels and
//! re-arms it; expiry runs the eviction future. Cancellation is
//! synchronous from the caller's point of view (the task is aborted and
//! the owning epoch advanced before the connection entry is touched), so
//! a stale timer can never evict a reused index.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a single-shot liveness timer.
///
/// Dropping the handle aborts the underlying task. Because an aborted
/// task may already be past its sleep, expiry futures must re-check the
/// connection's timer epoch before acting.
#[derive(Debug)]
pub struct HeartbeatTimer {
    handle: JoinHandle<()>,
}

impl HeartbeatTimer {
    /// Arm a timer that runs `on_expire` after `timeout`.
    pub fn arm<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_expire.await;
        });
        Self { handle }
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
