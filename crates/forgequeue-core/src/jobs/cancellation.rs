//! §4.5 cancellation token passed into every job handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Raised by `throw_if_cancelled` when a handler is asked to stop.
#[derive(Debug, Clone)]
pub struct JobCancellationSignal {
    pub reason: Option<String>,
}

impl std::fmt::Display for JobCancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "job cancelled: {}", reason),
            None => write!(f, "job cancelled"),
        }
    }
}

impl std::error::Error for JobCancellationSignal {}

struct Inner {
    cancelled: AtomicBool,
    reason: std::sync::Mutex<Option<String>>,
    notify: Notify,
}

/// Single-shot, cooperative cancellation carrier. Cheap to clone; every
/// clone shares the same underlying state. Second cancels are no-ops
/// that preserve the first reason.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: std::sync::Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap().clone()
    }

    /// Resolves once cancellation has been signalled. Already-cancelled
    /// tokens resolve immediately.
    pub async fn when_cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }

    pub fn throw_if_cancelled(&self) -> Result<(), JobCancellationSignal> {
        if self.is_cancelled() {
            Err(JobCancellationSignal {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }

    /// Entry point used only by the processor when a cancellation request
    /// arrives on the bus.
    pub(crate) fn cancel(&self, reason: Option<String>) {
        let already_cancelled = self.inner.cancelled.swap(true, Ordering::SeqCst);
        if !already_cancelled {
            *self.inner.reason.lock().unwrap() = reason;
            self.inner.notify.notify_waiters();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_single_shot() {
        let token = CancellationToken::new();
        token.cancel(Some("first".to_string()));
        token.cancel(Some("second".to_string()));
        assert_eq!(token.reason(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_when_cancelled_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.when_cancelled().await;
        });
        token.cancel(Some("shutdown".to_string()));
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_throw_if_cancelled() {
        let token = CancellationToken::new();
        assert!(token.throw_if_cancelled().is_ok());
        token.cancel(Some("stop".to_string()));
        let err = token.throw_if_cancelled().unwrap_err();
        assert_eq!(err.reason, Some("stop".to_string()));
    }
}
