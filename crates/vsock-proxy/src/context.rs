//! Process-wide cancellation and logging context.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Span;

/// Cancellation token plus the logger span of the running service.
///
/// Exactly one is created per process and cloned into every operation that can
/// observe shutdown. Cancellation is one-shot: once cancelled, a context stays
/// cancelled, and no child scopes are handed out.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    token: CancellationToken,
    span: Span,
}

impl ProcessContext {
    pub fn new(span: Span) -> Self {
        Self {
            token: CancellationToken::new(),
            span,
        }
    }

    /// Request shutdown of everything holding a clone of this context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Parent span for everything logged on behalf of the service.
    pub fn span(&self) -> &Span {
        &self.span
    }
}
