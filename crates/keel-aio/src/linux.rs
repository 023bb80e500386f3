//! Linux native AIO context (`io_setup` / `io_submit` / `io_getevents`).
//!
//! libc exposes the raw syscall numbers but not the `aio_abi.h` structures,
//! so the control block and event layouts are declared here.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;

use crate::context::{AioContext, RawEvent};

/// `IOCB_CMD_PWRITEV` from `linux/aio_abi.h`.
const IOCB_CMD_PWRITEV: u16 = 8;

/// Kernel I/O control block (`struct iocb`).
///
/// `aio_key` and `aio_rw_flags` swap places on big-endian targets; both are
/// always zero here so the declared order does not matter.
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: i32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// Kernel completion record (`struct io_event`).
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

/// Native Linux asynchronous I/O context sized for a fixed number of
/// in-flight requests.
///
/// Segment buffers handed to [`submit_pwritev`](AioContext::submit_pwritev)
/// are held here, keyed by token, until their completion is returned.
#[derive(Debug)]
pub struct LinuxAio {
    ctx: libc::c_ulong,
    depth: u32,
    buffers: Mutex<HashMap<u64, Vec<Bytes>>>,
}

impl LinuxAio {
    /// Creates a context able to hold `depth` in-flight requests.
    pub fn new(depth: u32) -> io::Result<Self> {
        let mut ctx: libc::c_ulong = 0;
        // SAFETY: `ctx` is a valid, zero-initialised out-pointer for the
        // duration of the call, as io_setup requires.
        let r = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                depth as libc::c_long,
                &raw mut ctx,
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(depth, "aio context created");
        Ok(Self {
            ctx,
            depth,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the number of requests the context was sized for.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<u64, Vec<Bytes>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AioContext for LinuxAio {
    fn submit_pwritev(
        &self,
        token: u64,
        fd: RawFd,
        offset: u64,
        segments: Vec<Bytes>,
    ) -> io::Result<()> {
        let iov: Vec<libc::iovec> = segments
            .iter()
            .map(|seg| libc::iovec {
                iov_base: seg.as_ptr() as *mut libc::c_void,
                iov_len: seg.len(),
            })
            .collect();

        let mut cb = Iocb {
            aio_data: token,
            aio_lio_opcode: IOCB_CMD_PWRITEV,
            aio_fildes: fd as u32,
            aio_buf: iov.as_ptr() as u64,
            aio_nbytes: iov.len() as u64,
            aio_offset: offset as i64,
            ..Iocb::default()
        };
        let mut cbs: [*mut Iocb; 1] = [&raw mut cb];

        // Parked before the kernel can complete the write and a reaper can
        // release them.
        match self.buffers().entry(token) {
            Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("aio token {token} is already in flight"),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(segments);
            }
        }

        // SAFETY: the control block and iovec array are live for the whole
        // call and the kernel copies both during submission. The segment
        // buffers they point at stay in `self.buffers` until `next_event`
        // returns this token or `io_destroy` has drained the context.
        let r = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                cbs.as_mut_ptr(),
            )
        };
        let err = match r {
            r if r < 0 => io::Error::last_os_error(),
            0 => io::Error::from_raw_os_error(libc::EAGAIN),
            _ => return Ok(()),
        };
        self.buffers().remove(&token);
        Err(err)
    }

    fn next_event(&self, timeout: Duration) -> io::Result<Option<RawEvent>> {
        let mut events = [IoEvent::default(); 1];
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        // SAFETY: `events` has room for the single event requested and `ts`
        // outlives the call.
        let r = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                1 as libc::c_long,
                1 as libc::c_long,
                events.as_mut_ptr(),
                &raw const ts,
            )
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(err);
        }
        if r == 0 {
            return Ok(None);
        }
        let token = events[0].data;
        self.buffers().remove(&token);
        Ok(Some(RawEvent {
            token,
            result: events[0].res,
        }))
    }
}

impl Drop for LinuxAio {
    fn drop(&mut self) {
        // SAFETY: `ctx` was produced by io_setup and is destroyed exactly once.
        // io_destroy waits for outstanding requests, so `buffers` is only
        // released after the kernel is done with them.
        let r = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        assert!(
            r == 0,
            "io_destroy failed: {}",
            io::Error::last_os_error()
        );
    }
}
