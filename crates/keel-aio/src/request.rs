//! Write descriptors submitted to the queue.

use std::os::fd::RawFd;

use bytes::Bytes;

/// Maximum number of buffer segments in one vectored write (`IOV_MAX`).
pub const MAX_SEGMENTS: usize = 1024;

/// A single vectored write: destination descriptor, byte offset, ordered
/// buffer segments, and an opaque context owned by the caller.
///
/// The submitter owns the request until it is handed to
/// [`AioQueue::submit`](crate::AioQueue::submit); the queue owns it while it
/// is in flight and returns it from [`AioQueue::reap`](crate::AioQueue::reap).
/// Segment buffers therefore stay alive for as long as the kernel may read
/// them.
///
/// The descriptor is borrowed by number. The caller keeps the file open until
/// the request is reaped.
#[derive(Debug)]
pub struct AioRequest<T> {
    fd: RawFd,
    offset: u64,
    segments: Vec<Bytes>,
    context: T,
}

impl<T> AioRequest<T> {
    /// Creates an empty write against `fd` carrying `context`.
    pub fn new(fd: RawFd, context: T) -> Self {
        Self {
            fd,
            offset: 0,
            segments: Vec::new(),
            context,
        }
    }

    /// Creates a vectored write of `segments` at `offset`.
    pub fn pwritev(fd: RawFd, offset: u64, segments: Vec<Bytes>, context: T) -> Self {
        Self {
            fd,
            offset,
            segments,
            context,
        }
    }

    /// Sets the byte offset the write lands at.
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Appends one buffer segment.
    pub fn push_segment(&mut self, segment: impl Into<Bytes>) {
        self.segments.push(segment.into());
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Total bytes across all segments.
    pub fn len_bytes(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Returns true if the request carries no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn context(&self) -> &T {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut T {
        &mut self.context
    }

    /// Consumes the request, returning the caller's context.
    pub fn into_context(self) -> T {
        self.context
    }
}
