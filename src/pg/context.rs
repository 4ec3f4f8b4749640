//! Cancellation and deadlines for database calls.
//!
//! A [`Context`] pairs a [`CancellationToken`] with an optional deadline.
//! Operations check it before blocking on the network and race their I/O
//! against it; a context that fires mid-operation leaves the connection in an
//! unknown protocol state, which the pool then refuses to recycle.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{PgError, PgResult};

/// Cancellation scope for one or more operations.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never fires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Wrap an existing token, e.g. a server's shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Same cancellation scope, with a deadline `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, or `None` while it is live.
    pub fn err(&self) -> Option<PgError> {
        if self.token.is_cancelled() {
            Some(PgError::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(PgError::Timeout)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> PgError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => PgError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => PgError::Timeout,
            },
            None => {
                self.token.cancelled().await;
                PgError::Cancelled
            }
        }
    }

    /// Run `fut` unless the context fires first.
    pub async fn run<T, F>(&self, fut: F) -> PgResult<T>
    where
        F: Future<Output = PgResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            res = fut => res,
            err = self.done() => Err(err),
        }
    }
}

/// Diagnostic for calls made without any deadline.
pub(crate) fn deadline_check(ctx: &Context, sql: &str) {
    if ctx.deadline().is_none() {
        tracing::debug!(sql, "no deadline for query");
    }
}
