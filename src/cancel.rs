//! Cancellation scope for outbound calls.
//!
//! Every suspension point on an upstream call runs through a [`CallScope`],
//! which combines a fixed deadline with the caller's own cancellation token
//! and reports which of the two fired.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, FetchError};

/// Why an outbound call stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    TimedOut(Duration),
    Cancelled,
}

/// Deadline plus caller cancellation shared by every await of one call.
#[derive(Debug, Clone)]
pub struct CallScope {
    deadline: Instant,
    timeout: Duration,
    caller: CancellationToken,
}

impl CallScope {
    /// Start a scope whose deadline is `timeout` from now.
    pub fn new(timeout: Duration, caller: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            caller,
        }
    }

    /// Run `fut` until it completes, the deadline passes, or the caller cancels.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        if self.caller.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        tokio::select! {
            biased;

            _ = self.caller.cancelled() => Err(Interrupt::Cancelled),
            result = tokio::time::timeout_at(self.deadline, fut) => {
                result.map_err(|_| Interrupt::TimedOut(self.timeout))
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.caller.is_cancelled()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl From<Interrupt> for BackendError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::TimedOut(after) => BackendError::Timeout(after),
            Interrupt::Cancelled => BackendError::Aborted,
        }
    }
}

impl From<Interrupt> for FetchError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::TimedOut(after) => FetchError::Timeout(after),
            Interrupt::Cancelled => FetchError::Aborted,
        }
    }
}
