//! Graceful shutdown coordination.
//!
//! A root cancellation token broadcasts shutdown; open SSE streams hold a
//! guard so the binary can wait for them to drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Shutdown coordinator for graceful termination.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    /// Cancelled once shutdown starts; request tokens are children of it.
    root: CancellationToken,
    /// Open stream count.
    active_streams: AtomicU64,
    /// Waiters for stream drain.
    drain_notify: Notify,
    /// Next request ID.
    next_request_id: AtomicU64,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                root: CancellationToken::new(),
                active_streams: AtomicU64::new(0),
                drain_notify: Notify::new(),
                next_request_id: AtomicU64::new(1),
            }),
        }
    }

    /// Signal shutdown to everything holding a child token.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Resolves once shutdown has been signaled.
    pub async fn wait_for_shutdown(&self) {
        self.inner.root.cancelled().await
    }

    /// Token cancelled on shutdown or when the caller cancels it.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.root.child_token()
    }

    /// Monotonic request id for log correlation.
    pub fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get current open stream count.
    pub fn active_streams(&self) -> u64 {
        self.inner.active_streams.load(Ordering::Relaxed)
    }

    /// Register an open stream and return a guard that unregisters on drop.
    pub fn register_stream(&self) -> StreamGuard {
        let new_count = self.inner.active_streams.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_streams(new_count);

        StreamGuard {
            coordinator: self.clone(),
        }
    }

    /// Wait for all open streams to finish.
    pub async fn wait_for_drain(&self) {
        loop {
            // Register interest before reading the count so a notify between
            // the load and the await is not lost.
            let notified = self.inner.drain_notify.notified();
            if self.active_streams() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn unregister_stream(&self) {
        let result = self.inner.active_streams.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |curr| curr.checked_sub(1),
        );

        match result {
            Ok(prev) => {
                let new_count = prev - 1;
                metrics::set_active_streams(new_count);
                if new_count == 0 {
                    self.inner.drain_notify.notify_waiters();
                }
            }
            Err(_) => {
                tracing::error!("unregister_stream called with active_streams already at 0");
                metrics::set_active_streams(0);
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for an open SSE stream.
pub struct StreamGuard {
    coordinator: ShutdownCoordinator,
}

impl StreamGuard {
    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.coordinator.is_shutdown()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.coordinator.unregister_stream();
    }
}
