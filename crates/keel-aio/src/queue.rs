//! Bounded submit/reap queue over an [`AioContext`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::context::{AioContext, is_transient};
use crate::error::{AioError, AioResult, SubmitError};
use crate::request::{AioRequest, MAX_SEGMENTS};

/// Default maximum number of in-flight requests.
const DEFAULT_MAX_IN_FLIGHT: u32 = 128;

/// Default number of retries on transient exhaustion.
const DEFAULT_SUBMIT_RETRIES: u32 = 10;

/// Default pause between retries.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_micros(500);

/// Queue sizing and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Kernel context depth.
    pub max_in_flight: u32,
    /// Retries after the first attempt when the kernel reports `EAGAIN`.
    pub submit_retries: u32,
    /// Sleep between retries.
    pub retry_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            submit_retries: DEFAULT_SUBMIT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// A reaped request together with the kernel's verdict.
#[derive(Debug)]
pub struct Completion<T> {
    request: AioRequest<T>,
    result: io::Result<usize>,
}

impl<T> Completion<T> {
    /// The request as it was submitted.
    pub fn request(&self) -> &AioRequest<T> {
        &self.request
    }

    /// Bytes written, or the error the kernel reported for this request.
    pub fn result(&self) -> Result<usize, &io::Error> {
        self.result.as_ref().copied()
    }

    /// Splits into the request and its result.
    pub fn into_parts(self) -> (AioRequest<T>, io::Result<usize>) {
        (self.request, self.result)
    }
}

/// A bounded-depth queue of asynchronous vectored writes.
///
/// # Concurrency
///
/// Any number of threads may [`submit`](Self::submit) and
/// [`reap`](Self::reap) concurrently. Completions arrive in whatever order
/// the kernel finishes them; there is no ordering between distinct in-flight
/// requests. In-flight I/O cannot be cancelled.
///
/// # Lifecycle
///
/// The queue is created once when a backend starts and dropped once at
/// shutdown. Dropping it with requests still in flight is a fatal invariant
/// violation and panics.
pub struct AioQueue<C: AioContext, T> {
    context: C,
    settings: QueueSettings,
    in_flight: AtomicUsize,
    next_token: AtomicU64,
    /// Requests the kernel currently owns, keyed by submission token.
    pending: Mutex<HashMap<u64, AioRequest<T>>>,
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
}

#[cfg(target_os = "linux")]
impl<T: Send> AioQueue<crate::LinuxAio, T> {
    /// Creates a queue over a native Linux AIO context.
    ///
    /// A failure here means the environment cannot provide kernel AIO; the
    /// owning backend should abort rather than retry.
    pub fn open(settings: QueueSettings) -> AioResult<Self> {
        let context =
            crate::LinuxAio::new(settings.max_in_flight).map_err(|source| AioError::Setup {
                depth: settings.max_in_flight,
                source,
            })?;
        Ok(Self::with_context(context, settings))
    }
}

impl<C: AioContext, T: Send> AioQueue<C, T> {
    /// Creates a queue over an existing context.
    pub fn with_context(context: C, settings: QueueSettings) -> Self {
        assert!(settings.max_in_flight > 0, "max_in_flight must be positive");
        Self {
            context,
            settings,
            in_flight: AtomicUsize::new(0),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::with_capacity(settings.max_in_flight as usize)),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
        }
    }

    /// Returns the number of requests submitted but not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Enqueues one vectored write.
    ///
    /// Transient kernel exhaustion (`EAGAIN`) is retried up to
    /// `submit_retries` times with `retry_delay` between attempts. Any other
    /// failure is returned immediately. On failure the request is handed
    /// back inside the error.
    pub fn submit(&self, request: AioRequest<T>) -> Result<(), SubmitError<T>> {
        if request.is_empty() {
            return Err(SubmitError::new(AioError::EmptyRequest, request));
        }
        if request.segments().len() > MAX_SEGMENTS {
            let count = request.segments().len();
            return Err(SubmitError::new(
                AioError::TooManySegments {
                    count,
                    max: MAX_SEGMENTS,
                },
                request,
            ));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let fd = request.fd();
        let offset = request.offset();
        let segments = request.segments().to_vec();

        self.pending_lock().insert(token, request);
        // Counted before the kernel sees the request so a concurrent reaper
        // can never observe its completion ahead of the increment.
        let was = self.in_flight.fetch_add(1, Ordering::AcqRel);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self
                .context
                .submit_pwritev(token, fd, offset, segments.clone())
            {
                Ok(()) => break,
                Err(e) if is_transient(&e) && attempts <= self.settings.submit_retries => {
                    tracing::warn!(token, attempts, "aio submit exhausted, retrying");
                    std::thread::sleep(self.settings.retry_delay);
                }
                Err(e) => {
                    // A submit that raised the count from a nonzero value
                    // skipped the wakeup; its work is still in flight.
                    let remaining = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
                    if remaining > 0 {
                        self.wake_reapers();
                    }
                    let request = self
                        .pending_lock()
                        .remove(&token)
                        .expect("unsubmitted request must still be pending");
                    let error = if is_transient(&e) {
                        AioError::RetriesExhausted { attempts }
                    } else {
                        AioError::Submit(e)
                    };
                    tracing::debug!(token, fd, offset, %error, "aio submit failed");
                    return Err(SubmitError::new(error, request));
                }
            }
        }

        tracing::trace!(token, fd, offset, "aio request submitted");
        if was == 0 {
            self.wake_reapers();
        }
        Ok(())
    }

    /// Reaps at most one completed request.
    ///
    /// With nothing in flight, waits up to `timeout` for a submission
    /// (spurious wakeups are tolerated), then polls the kernel for the rest
    /// of the budget. Returns `Ok(None)` if the timeout elapsed first.
    pub fn reap(&self, timeout: Duration) -> AioResult<Option<Completion<T>>> {
        let deadline = Instant::now() + timeout;

        if self.in_flight() == 0 {
            let mut guard = self.idle_lock();
            while self.in_flight() == 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                guard = self
                    .idle_cond
                    .wait_timeout(guard, remaining)
                    .expect("aio idle lock poisoned")
                    .0;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(event) = self
            .context
            .next_event(remaining)
            .map_err(AioError::Reap)?
        else {
            return Ok(None);
        };

        // Every event retires one submission, matched or not.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let Some(request) = self.pending_lock().remove(&event.token) else {
            tracing::error!(
                token = event.token,
                res = event.result,
                "aio completion for unknown token"
            );
            return Err(AioError::UnknownCompletion { token: event.token });
        };

        let result = if event.result < 0 {
            Err(io::Error::from_raw_os_error((-event.result) as i32))
        } else {
            Ok(event.result as usize)
        };
        tracing::trace!(token = event.token, res = event.result, "aio request reaped");
        Ok(Some(Completion { request, result }))
    }

    fn wake_reapers(&self) {
        let _guard = self.idle_lock();
        self.idle_cond.notify_all();
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AioRequest<T>>> {
        self.pending.lock().expect("aio pending lock poisoned")
    }

    fn idle_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.idle_lock.lock().expect("aio idle lock poisoned")
    }
}

impl<C: AioContext, T> Drop for AioQueue<C, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let in_flight = self.in_flight.load(Ordering::Acquire);
        assert!(
            in_flight == 0,
            "aio queue dropped with {in_flight} requests in flight"
        );
    }
}
