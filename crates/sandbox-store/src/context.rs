//! Cancellation and deadline plumbing threaded through every blocking
//! operation in this crate, in lieu of a `Context`-shaped parameter.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation signal plus an optional deadline, cloned cheaply and shared
/// across every task waiting on the same logical request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// A context that never cancels and never expires.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derives a child context bounded by `timeout` from now, in addition to
    /// whatever cancellation or deadline the parent already carries.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Cancels this context and every clone derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.is_expired()
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Races `fut` against cancellation and the deadline, returning whichever
    /// resolves first. Never mutates caller state on the cancellation path;
    /// that responsibility stays with `fut`'s caller.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ContextError>
    where
        F: std::future::Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(self.error_for_expiry());
        }

        tokio::pin!(fut);
        loop {
            match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ContextError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Err(ContextError::DeadlineExceeded),
                        out = &mut fut => return Ok(out),
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ContextError::Cancelled),
                        out = &mut fut => return Ok(out),
                    }
                }
            }
        }
    }

    fn error_for_expiry(&self) -> ContextError {
        if self.cancel.is_cancelled() {
            ContextError::Cancelled
        } else {
            ContextError::DeadlineExceeded
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}
