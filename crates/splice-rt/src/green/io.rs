// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness waits.
//!
//! Inside a worker these park the task in the reactor; on a plain thread
//! they fall back to `poll(2)` and block. Either way a deadline that passes
//! surfaces as `ETIMEDOUT`.

use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::reactor::{Interest, TimerKey, Token};
use super::worker::Handle;
use crate::timeout::deadline_after;

pub fn timed_out() -> io::Error {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
}

/// True for errors that mean "try again once the fd is ready".
pub fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EINPROGRESS) | Some(libc::EALREADY)
    ) || err.kind() == io::ErrorKind::WouldBlock
}

/// Future that resolves once `fd` is ready for `interest`, or fails with
/// `ETIMEDOUT` at `deadline`.
pub struct Readiness {
    handle: Handle,
    fd: RawFd,
    interest: Interest,
    deadline: Option<Instant>,
    token: Option<Token>,
    timer: Option<TimerKey>,
    armed: bool,
}

impl Readiness {
    pub fn new(handle: Handle, fd: RawFd, interest: Interest, deadline: Option<Instant>) -> Self {
        Self {
            handle,
            fd,
            interest,
            deadline,
            token: None,
            timer: None,
            armed: false,
        }
    }

    fn disarm(&mut self) {
        if let Some(token) = self.token.take() {
            self.handle.reactor().deregister(self.fd, token);
        }
        if let Some(timer) = self.timer.take() {
            self.handle.reactor().cancel_timer(timer);
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Future for Readiness {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.armed {
            // Any wake counts as ready; the caller retries its syscall
            // and parks again on a spurious one.
            self.disarm();
            self.armed = false;
            if self.expired() {
                return Poll::Ready(Err(timed_out()));
            }
            return Poll::Ready(Ok(()));
        }

        if self.expired() {
            return Poll::Ready(Err(timed_out()));
        }

        match self
            .handle
            .reactor()
            .register(self.fd, self.interest, cx.waker().clone())
        {
            Ok(token) => self.token = Some(token),
            // Regular files are always ready.
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => return Poll::Ready(Ok(())),
            Err(e) => return Poll::Ready(Err(e)),
        }
        if let Some(deadline) = self.deadline {
            let key = self.handle.reactor().add_timer(deadline, cx.waker().clone());
            self.timer = Some(key);
        }
        self.armed = true;
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn poll_events(interest: Interest) -> libc::c_short {
    match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
    }
}

fn poll_timeout_ms(deadline: Option<Instant>) -> libc::c_int {
    match deadline {
        None => -1,
        Some(d) => d
            .saturating_duration_since(Instant::now())
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// Wait until `fd` is ready for `interest`.
pub async fn wait_fd(fd: RawFd, interest: Interest, deadline: Option<Instant>) -> io::Result<()> {
    if let Some(handle) = Handle::try_current() {
        return Readiness::new(handle, fd, interest, deadline).await;
    }
    let mut pfd = libc::pollfd {
        fd,
        events: poll_events(interest),
        revents: 0,
    };
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(deadline)) };
        if n > 0 {
            return Ok(());
        }
        if n == 0 {
            return Err(timed_out());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One entry of a multi-fd readiness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
    pub except: bool,
}

/// Readiness observed for one `PollFd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReady {
    pub readable: bool,
    pub writable: bool,
    pub except: bool,
}

impl PollReady {
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.except
    }
}

pub(crate) fn poll_now(fds: &[PollFd], timeout_ms: libc::c_int) -> io::Result<Vec<PollReady>> {
    let mut raw: Vec<libc::pollfd> = fds
        .iter()
        .map(|p| {
            let mut events = 0;
            if p.read {
                events |= libc::POLLIN;
            }
            if p.write {
                events |= libc::POLLOUT;
            }
            if p.except {
                events |= libc::POLLPRI;
            }
            libc::pollfd {
                fd: p.fd,
                events,
                revents: 0,
            }
        })
        .collect();

    loop {
        let n = unsafe { libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout_ms) };
        if n >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let hangup = libc::POLLHUP | libc::POLLERR;
    Ok(fds
        .iter()
        .zip(&raw)
        .map(|(want, got)| PollReady {
            readable: want.read && got.revents & (libc::POLLIN | hangup) != 0,
            writable: want.write && got.revents & (libc::POLLOUT | hangup) != 0,
            except: want.except && got.revents & libc::POLLPRI != 0,
        })
        .collect())
}

/// Wait until at least one of `fds` is ready or `timeout` elapses. A zero
/// timeout checks once without waiting; `None` waits indefinitely.
///
/// The result has one entry per input, all-false on timeout.
pub async fn poll_fds(fds: &[PollFd], timeout: Option<Duration>) -> io::Result<Vec<PollReady>> {
    let deadline = timeout.and_then(deadline_after);
    loop {
        let ready = poll_now(fds, 0)?;
        if ready.iter().any(PollReady::any) || timeout == Some(Duration::ZERO) {
            return Ok(ready);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(ready);
        }
        let Some(handle) = Handle::try_current() else {
            return poll_now(fds, poll_timeout_ms(deadline));
        };
        WaitAny {
            handle,
            fds,
            deadline,
            tokens: Vec::new(),
            timer: None,
            armed: false,
        }
        .await;
    }
}

/// Parks on every fd of a `poll_fds` query at once.
struct WaitAny<'a> {
    handle: Handle,
    fds: &'a [PollFd],
    deadline: Option<Instant>,
    tokens: Vec<(RawFd, Token)>,
    timer: Option<TimerKey>,
    armed: bool,
}

impl WaitAny<'_> {
    fn disarm(&mut self) {
        for (fd, token) in self.tokens.drain(..) {
            self.handle.reactor().deregister(fd, token);
        }
        if let Some(timer) = self.timer.take() {
            self.handle.reactor().cancel_timer(timer);
        }
    }
}

impl Future for WaitAny<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.armed {
            self.disarm();
            return Poll::Ready(());
        }
        let this = &mut *self;
        for p in this.fds {
            let interests = [
                (p.read || p.except, Interest::Readable),
                (p.write, Interest::Writable),
            ];
            for (wanted, interest) in interests {
                if !wanted {
                    continue;
                }
                match this.handle.reactor().register(p.fd, interest, cx.waker().clone()) {
                    Ok(token) => this.tokens.push((p.fd, token)),
                    Err(_) => {
                        // Unwatchable fd: let the caller re-poll it directly.
                        this.disarm();
                        return Poll::Ready(());
                    }
                }
            }
        }
        if let Some(deadline) = this.deadline {
            this.timer = Some(this.handle.reactor().add_timer(deadline, cx.waker().clone()));
        }
        this.armed = true;
        Poll::Pending
    }
}

impl Drop for WaitAny<'_> {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let next = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if next != flags && unsafe { libc::fcntl(fd, libc::F_SETFL, next) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::WorkerCensus;
    use crate::green::worker::Worker;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn wait_fd_times_out_in_worker() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let (r, w) = pipe();
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let err = worker
            .block_on(wait_fd(r, Interest::Readable, deadline))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
        close(&[r, w]);
    }

    #[test]
    fn wait_fd_blocks_without_worker() {
        let (r, w) = pipe();
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        crate::green::worker::block_on(wait_fd(r, Interest::Readable, None)).unwrap();
        close(&[r, w]);
    }

    #[test]
    fn poll_fds_reports_ready_entries() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let fds = [
            PollFd { fd: r1, read: true, write: false, except: false },
            PollFd { fd: r2, read: true, write: false, except: false },
        ];

        let ready = worker.block_on(async {
            let writer = crate::green::worker::spawn(async move {
                crate::timeout::sleep(Duration::from_millis(5)).await;
                unsafe { libc::write(w2, b"y".as_ptr() as *const libc::c_void, 1) };
            });
            let ready = poll_fds(&fds, Some(Duration::from_secs(5))).await;
            writer.await.unwrap();
            ready
        });
        let ready = ready.unwrap();
        assert!(!ready[0].readable);
        assert!(ready[1].readable);
        close(&[r1, w1, r2, w2]);
    }

    #[test]
    fn poll_fds_zero_timeout_checks_once() {
        let (r, w) = pipe();
        let fds = [PollFd { fd: r, read: true, write: false, except: false }];
        let ready = crate::green::worker::block_on(poll_fds(&fds, Some(Duration::ZERO))).unwrap();
        assert!(!ready[0].any());
        close(&[r, w]);
    }
}
