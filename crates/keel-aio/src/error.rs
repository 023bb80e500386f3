//! AIO error types.

use std::fmt;

use crate::AioRequest;

/// Result type for queue operations.
pub type AioResult<T> = Result<T, AioError>;

/// Errors from the asynchronous I/O queue.
#[derive(Debug, thiserror::Error)]
pub enum AioError {
    /// The kernel refused to create an I/O context.
    #[error("failed to set up aio context for {depth} requests: {source}")]
    Setup {
        depth: u32,
        #[source]
        source: std::io::Error,
    },

    /// The kernel rejected a submission.
    #[error("aio submission failed: {0}")]
    Submit(#[source] std::io::Error),

    /// Transient resource exhaustion persisted across every retry.
    #[error("aio submission still exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The kernel reported an error while polling for completions.
    #[error("aio reap failed: {0}")]
    Reap(#[source] std::io::Error),

    /// A completion arrived carrying a token the queue never issued.
    #[error("completion for unknown request token {token}")]
    UnknownCompletion { token: u64 },

    /// A request with no buffer segments was submitted.
    #[error("aio request has no buffer segments")]
    EmptyRequest,

    /// A request carried more segments than one vectored write accepts.
    #[error("aio request has {count} segments (max {max})")]
    TooManySegments { count: usize, max: usize },
}

/// A failed submission, returning ownership of the request to the caller.
#[derive(thiserror::Error)]
#[error("{error}")]
pub struct SubmitError<T> {
    #[source]
    error: AioError,
    request: AioRequest<T>,
}

impl<T> SubmitError<T> {
    pub(crate) fn new(error: AioError, request: AioRequest<T>) -> Self {
        Self { error, request }
    }

    /// Returns the underlying error.
    pub fn error(&self) -> &AioError {
        &self.error
    }

    /// Splits into the error and the request that was not submitted.
    pub fn into_parts(self) -> (AioError, AioRequest<T>) {
        (self.error, self.request)
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("fd", &self.request.fd())
            .field("offset", &self.request.offset())
            .finish_non_exhaustive()
    }
}
