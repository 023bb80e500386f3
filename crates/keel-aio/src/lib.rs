//! # keel-aio: Kernel Asynchronous I/O Queue for Keel
//!
//! Storage backends that write straight to a file descriptor (instead of
//! through a network device) batch their multi-segment writes through an
//! [`AioQueue`]. The queue is bounded to a fixed number of in-flight requests,
//! retries submissions that fail on transient kernel resource exhaustion, and
//! hands completed requests back to reapers one at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │        storage backend threads         │
//! │   submit(AioRequest)    reap(timeout)  │
//! └──────────┬─────────────────────▲───────┘
//!            │                     │ Completion
//! ┌──────────▼─────────────────────┴───────┐
//! │                AioQueue                │
//! │  pending requests · in-flight counter  │
//! │  wait/notify for idle reapers          │
//! └──────────┬─────────────────────▲───────┘
//!            │ AioContext          │
//! ┌──────────▼─────────────────────┴───────┐
//! │  LinuxAio (io_setup / io_submit /      │
//! │            io_getevents)               │
//! └────────────────────────────────────────┘
//! ```
//!
//! Requests are identified by a token the queue assigns at submission; the
//! kernel echoes the token back with each completion and the queue returns the
//! owned [`AioRequest`] that carried it. No address reinterpretation is
//! involved.

mod context;
mod error;
#[cfg(target_os = "linux")]
mod linux;
mod queue;
mod request;

pub use context::{AioContext, RawEvent};
pub use error::{AioError, AioResult, SubmitError};
#[cfg(target_os = "linux")]
pub use linux::LinuxAio;
pub use queue::{AioQueue, Completion, QueueSettings};
pub use request::{AioRequest, MAX_SEGMENTS};

#[cfg(test)]
mod tests;
