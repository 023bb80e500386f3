//! Kernel-facing AIO context trait.
//!
//! The [`AioContext`] trait is the seam between [`AioQueue`](crate::AioQueue)
//! and the operating system's asynchronous I/O facility. The production
//! implementation is [`LinuxAio`](crate::LinuxAio); tests drive the queue
//! with scripted contexts.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bytes::Bytes;

/// One completion as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Token supplied at submission.
    pub token: u64,
    /// Bytes written, or a negated errno.
    pub result: i64,
}

/// Abstraction over a kernel asynchronous I/O context.
///
/// Implementations must be usable from many submitting and reaping threads at
/// once.
pub trait AioContext: Send + Sync {
    /// Submits one vectored write of `segments` at `offset` on `fd`.
    ///
    /// The context owns `segments` until the event carrying `token` is
    /// returned from [`next_event`](Self::next_event). Transient resource
    /// exhaustion is reported as an error whose raw OS code is `EAGAIN`.
    fn submit_pwritev(
        &self,
        token: u64,
        fd: RawFd,
        offset: u64,
        segments: Vec<Bytes>,
    ) -> io::Result<()>;

    /// Waits up to `timeout` for at most one completed event.
    ///
    /// Returns `Ok(None)` when nothing completed in time.
    fn next_event(&self, timeout: Duration) -> io::Result<Option<RawEvent>>;
}

/// Returns true for submission errors worth retrying.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EAGAIN)
}
