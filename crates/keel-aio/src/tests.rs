//! Queue tests against a scripted context and, on Linux, the kernel.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use test_case::test_case;

use crate::{AioContext, AioError, AioQueue, AioRequest, QueueSettings, RawEvent};

// ============================================================================
// Scripted context
// ============================================================================

/// Completes every accepted submission immediately, after first failing the
/// next `failures` submissions with the scripted errno.
#[derive(Default)]
struct ScriptedContext {
    /// Parks the next submission: it signals the first channel, waits on the
    /// second, then fails with `EBADF`.
    held: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    failures: Mutex<VecDeque<i32>>,
    completed: Mutex<VecDeque<RawEvent>>,
    ready: Condvar,
    submit_calls: AtomicU32,
    /// Hand completions back newest-first.
    lifo: bool,
}

impl ScriptedContext {
    fn failing(errnos: &[i32]) -> Self {
        Self {
            failures: Mutex::new(errnos.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn lifo() -> Self {
        Self {
            lifo: true,
            ..Self::default()
        }
    }
}

impl AioContext for Arc<ScriptedContext> {
    fn submit_pwritev(
        &self,
        token: u64,
        _fd: RawFd,
        _offset: u64,
        segments: Vec<Bytes>,
    ) -> io::Result<()> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let held = self.held.lock().unwrap().take();
        if let Some((entered, release)) = held {
            entered.send(()).unwrap();
            release.recv().unwrap();
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if let Some(errno) = self.failures.lock().unwrap().pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let written: usize = segments.iter().map(Bytes::len).sum();
        self.completed.lock().unwrap().push_back(RawEvent {
            token,
            result: written as i64,
        });
        self.ready.notify_all();
        Ok(())
    }

    fn next_event(&self, timeout: Duration) -> io::Result<Option<RawEvent>> {
        let completed = self.completed.lock().unwrap();
        let (mut completed, _) = self
            .ready
            .wait_timeout_while(completed, timeout, |q| q.is_empty())
            .unwrap();
        Ok(if self.lifo {
            completed.pop_back()
        } else {
            completed.pop_front()
        })
    }
}

fn settings() -> QueueSettings {
    QueueSettings {
        max_in_flight: 8,
        submit_retries: 3,
        retry_delay: Duration::from_micros(10),
    }
}

fn request(tag: u32, payload: &'static [u8]) -> AioRequest<u32> {
    AioRequest::pwritev(3, 0, vec![Bytes::from_static(payload)], tag)
}

// ============================================================================
// Submit / reap
// ============================================================================

#[test]
fn reap_returns_submitted_request_identity() {
    let ctx = Arc::new(ScriptedContext::default());
    let queue = AioQueue::with_context(ctx, settings());

    queue.submit(request(7, b"hello")).unwrap();
    assert_eq!(queue.in_flight(), 1);

    let completion = queue.reap(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(*completion.request().context(), 7);
    assert_eq!(completion.result().unwrap(), 5);
    assert_eq!(queue.in_flight(), 0);
}

#[test]
fn reap_with_nothing_in_flight_times_out() {
    let ctx = Arc::new(ScriptedContext::default());
    let queue: AioQueue<_, u32> = AioQueue::with_context(ctx, settings());

    let start = Instant::now();
    let reaped = queue.reap(Duration::from_millis(50)).unwrap();
    assert!(reaped.is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn out_of_order_completions_map_to_their_requests() {
    let ctx = Arc::new(ScriptedContext::lifo());
    let queue = AioQueue::with_context(ctx, settings());

    queue.submit(request(1, b"a")).unwrap();
    queue.submit(request(2, b"bb")).unwrap();
    queue.submit(request(3, b"ccc")).unwrap();

    let mut seen = Vec::new();
    while let Some(c) = queue.reap(Duration::from_millis(100)).unwrap() {
        let (req, res) = c.into_parts();
        assert_eq!(res.unwrap(), req.len_bytes());
        seen.push(req.into_context());
    }
    assert_eq!(seen, vec![3, 2, 1]);
    assert_eq!(queue.in_flight(), 0);
}

#[test]
fn blocked_reaper_wakes_on_submit() {
    let ctx = Arc::new(ScriptedContext::default());
    let queue = Arc::new(AioQueue::with_context(ctx, settings()));

    let reaper = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let start = Instant::now();
            let c = queue.reap(Duration::from_secs(10)).unwrap();
            (c.map(|c| c.into_parts().0.into_context()), start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(20));
    queue.submit(request(42, b"wake")).unwrap();

    let (tag, waited) = reaper.join().unwrap();
    assert_eq!(tag, Some(42));
    assert!(waited < Duration::from_secs(10));
}

#[test]
fn failed_submit_wakes_reaper_for_overlapping_success() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let ctx = Arc::new(ScriptedContext {
        held: Mutex::new(Some((entered_tx, release_rx))),
        ..ScriptedContext::default()
    });
    let queue = Arc::new(AioQueue::with_context(ctx, settings()));

    let reaper = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let start = Instant::now();
            let c = queue.reap(Duration::from_secs(5)).unwrap();
            (c.map(|c| c.into_parts().0.into_context()), start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(20));

    // First submitter takes the count from 0 to 1 and stalls in the kernel.
    let failing = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.submit(request(1, b"held")))
    };
    entered_rx.recv().unwrap();

    // Second goes from 1 to 2 and succeeds, then the first fails back to 1.
    queue.submit(request(2, b"ok")).unwrap();
    release_tx.send(()).unwrap();

    let err = failing.join().unwrap().unwrap_err();
    assert!(matches!(err.error(), AioError::Submit(e) if e.raw_os_error() == Some(libc::EBADF)));

    let (tag, waited) = reaper.join().unwrap();
    assert_eq!(tag, Some(2));
    assert!(waited < Duration::from_secs(2), "reaper slept {waited:?}");
    assert_eq!(queue.in_flight(), 0);
}

#[test]
fn unknown_completion_retires_its_in_flight_slot() {
    let ctx = Arc::new(ScriptedContext::default());
    let queue = AioQueue::with_context(Arc::clone(&ctx), settings());

    queue.submit(request(5, b"stray")).unwrap();
    ctx.completed.lock().unwrap().front_mut().unwrap().token = u64::MAX;

    let err = queue.reap(Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, AioError::UnknownCompletion { token: u64::MAX }));
    assert_eq!(queue.in_flight(), 0);

    // Nothing is left in flight, so shutdown is clean.
    drop(queue);
}

// ============================================================================
// Submission failures
// ============================================================================

#[test_case(&[libc::EAGAIN], 2 ; "one transient failure")]
#[test_case(&[libc::EAGAIN, libc::EAGAIN, libc::EAGAIN], 4 ; "retries up to the limit")]
fn transient_exhaustion_is_retried(errnos: &[i32], expected_calls: u32) {
    let ctx = Arc::new(ScriptedContext::failing(errnos));
    let queue = AioQueue::with_context(Arc::clone(&ctx), settings());

    queue.submit(request(1, b"x")).unwrap();
    assert_eq!(ctx.submit_calls.load(Ordering::SeqCst), expected_calls);
    assert!(queue.reap(Duration::from_secs(1)).unwrap().is_some());
}

#[test]
fn persistent_exhaustion_returns_request() {
    let ctx = Arc::new(ScriptedContext::failing(&[libc::EAGAIN; 4]));
    let queue = AioQueue::with_context(Arc::clone(&ctx), settings());

    let err = queue.submit(request(9, b"x")).unwrap_err();
    assert!(matches!(
        err.error(),
        AioError::RetriesExhausted { attempts: 4 }
    ));
    let (_, req) = err.into_parts();
    assert_eq!(req.into_context(), 9);
    assert_eq!(queue.in_flight(), 0);
}

#[test]
fn hard_failure_is_not_retried() {
    let ctx = Arc::new(ScriptedContext::failing(&[libc::EBADF]));
    let queue = AioQueue::with_context(Arc::clone(&ctx), settings());

    let err = queue.submit(request(1, b"x")).unwrap_err();
    assert!(matches!(err.error(), AioError::Submit(e) if e.raw_os_error() == Some(libc::EBADF)));
    assert_eq!(ctx.submit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.in_flight(), 0);
}

#[test]
fn empty_request_is_rejected_before_the_kernel() {
    let ctx = Arc::new(ScriptedContext::default());
    let queue = AioQueue::with_context(Arc::clone(&ctx), settings());

    let err = queue.submit(AioRequest::new(3, 0u32)).unwrap_err();
    assert!(matches!(err.error(), AioError::EmptyRequest));
    assert_eq!(ctx.submit_calls.load(Ordering::SeqCst), 0);
}

#[test]
#[should_panic(expected = "requests in flight")]
fn dropping_with_requests_in_flight_panics() {
    let ctx = Arc::new(ScriptedContext::default());
    let queue = AioQueue::with_context(ctx, settings());
    queue.submit(request(1, b"leak")).unwrap();
    drop(queue);
}

// ============================================================================
// Kernel AIO
// ============================================================================

#[cfg(target_os = "linux")]
#[test]
fn linux_pwritev_lands_at_offset() {
    use std::os::fd::AsRawFd;

    // Sandboxes without kernel AIO cannot run this test.
    let Ok(queue) = AioQueue::<crate::LinuxAio, &str>::open(settings()) else {
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aio.dat");
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();

    let mut req = AioRequest::new(file.as_raw_fd(), "segments").at_offset(4);
    req.push_segment(Bytes::from_static(b"keel "));
    req.push_segment(Bytes::from_static(b"aio"));
    queue.submit(req).unwrap();

    let completion = queue.reap(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(*completion.request().context(), "segments");
    assert_eq!(completion.result().unwrap(), 8);

    let data = std::fs::read(&path).unwrap();
    assert_eq!(&data[..4], &[0, 0, 0, 0]);
    assert_eq!(&data[4..], b"keel aio");
}

#[cfg(target_os = "linux")]
#[test]
fn linux_context_owns_segments_until_reaped() {
    use std::os::fd::AsRawFd;

    let Ok(aio) = crate::LinuxAio::new(4) else {
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owned.dat");
    let file = std::fs::File::create(&path).unwrap();

    // The buffer's only owner after this call is the context.
    aio.submit_pwritev(
        11,
        file.as_raw_fd(),
        0,
        vec![Bytes::from(b"owned".to_vec())],
    )
    .unwrap();

    // The token stays claimed until its event is returned.
    let dup = aio
        .submit_pwritev(11, file.as_raw_fd(), 0, vec![Bytes::from_static(b"dup")])
        .unwrap_err();
    assert_eq!(dup.kind(), io::ErrorKind::AlreadyExists);

    let event = aio.next_event(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(event, RawEvent { token: 11, result: 5 });
    assert_eq!(std::fs::read(&path).unwrap(), b"owned");
}
