//! Cancellation primitives shared by sessions and callers.
//!
//! `CancellationToken` is the cancellation scope of a session (and of the
//! change feed). `CallContext` is what a producer hands to `submit`: an
//! optional deadline plus an optional token, whichever fires first.

use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token for cooperative cancellation of async loops.
///
/// This token can be cloned and shared across tasks. When `cancel()` is called
/// on any clone, all clones observe the cancellation, and every task parked
/// in `cancelled().await` wakes up.
///
/// # Example
///
/// ```
/// use evalbridge_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    ///
    /// Returns true only for the call that actually flipped the token.
    pub fn cancel(&self) -> bool {
        let first = !self.state.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.state.notify.notify_waiters();
        }
        first
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel() is not missed.
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BridgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Caller-side context for a single `submit`.
///
/// An empty context never fires; the call then ends only through a reply,
/// the registry timeout, or session teardown.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
}

impl CallContext {
    /// A context with neither deadline nor token.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: None,
        }
    }

    /// Attach a cancellation token to this context.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the token is cancelled or the deadline has passed.
    pub fn is_done(&self) -> bool {
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        let cancelled = self.token.as_ref().is_some_and(|t| t.is_cancelled());
        expired || cancelled
    }

    /// Resolve once the deadline passes or the token is cancelled.
    pub async fn done(&self) {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let token = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = deadline => {}
            _ = token => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token2.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_fires() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        let start = Instant::now();
        ctx.done().await;

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_context_token_fires() {
        let token = CancellationToken::new();
        let ctx = CallContext::background().with_token(token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), ctx.done())
            .await
            .expect("token should end the context");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_context_never_fires() {
        let ctx = CallContext::background();
        let result = tokio::time::timeout(Duration::from_secs(3600), ctx.done()).await;
        assert!(result.is_err());
        assert!(!ctx.is_done());
    }
}
