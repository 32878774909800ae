// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll readiness plus a deadline-ordered timer set.
//!
//! Owned by a single worker. Registrations are one-shot: when an fd fires,
//! every waker parked on that direction is woken and dropped. Level-triggered,
//! so a spurious wakeup just makes the task retry its syscall and park again.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::Waker;
use std::time::{Duration, Instant};

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Identifies one parked waker so it can be withdrawn on drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

/// Identifies one pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey(Instant, u64);

impl TimerKey {
    pub fn deadline(&self) -> Instant {
        self.0
    }
}

/// Per-fd waiters, split by direction.
#[derive(Default)]
struct Registration {
    readers: Vec<(Token, Waker)>,
    writers: Vec<(Token, Waker)>,
}

impl Registration {
    fn events(&self) -> u32 {
        let mut ev = 0u32;
        if !self.readers.is_empty() {
            ev |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if !self.writers.is_empty() {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }

    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }
}

/// Central I/O reactor backed by epoll (Linux).
pub struct Reactor {
    epoll_fd: RawFd,
    /// Eventfd for interrupting `epoll_wait` from other threads.
    wake_fd: RawFd,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    timers: Mutex<BTreeMap<TimerKey, Waker>>,
    next_token: AtomicU64,
    shutdown: AtomicBool,
}

impl Reactor {
    /// Create a new reactor with an epoll instance and wake eventfd.
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            registrations: Mutex::new(HashMap::new()),
            timers: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        })
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Park `waker` until `fd` is ready for `interest`.
    ///
    /// Regular files cannot be watched by epoll; the kernel answers EPERM,
    /// which is passed through so callers can treat the fd as always ready.
    pub fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> io::Result<Token> {
        let token = Token(self.token());
        let mut regs = self.registrations.lock().unwrap();
        let existed = regs.contains_key(&fd);
        let reg = regs.entry(fd).or_default();
        match interest {
            Interest::Readable => reg.readers.push((token, waker)),
            Interest::Writable => reg.writers.push((token, waker)),
        }

        let mut ev = libc::epoll_event {
            events: reg.events(),
            u64: fd as u64,
        };
        let op = if existed {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match interest {
                Interest::Readable => reg.readers.retain(|(t, _)| *t != token),
                Interest::Writable => reg.writers.retain(|(t, _)| *t != token),
            }
            if !existed {
                regs.remove(&fd);
            }
            return Err(err);
        }
        Ok(token)
    }

    /// Withdraw a parked waker. Unknown tokens are ignored.
    pub fn deregister(&self, fd: RawFd, token: Token) {
        let mut regs = self.registrations.lock().unwrap();
        let Some(reg) = regs.get_mut(&fd) else {
            return;
        };
        reg.readers.retain(|(t, _)| *t != token);
        reg.writers.retain(|(t, _)| *t != token);
        if reg.is_empty() {
            regs.remove(&fd);
            self.epoll_del(fd);
        } else {
            let mut ev = libc::epoll_event {
                events: reg.events(),
                u64: fd as u64,
            };
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        }
    }

    /// Drop every waiter on `fd`, waking them so they observe the close.
    pub fn forget(&self, fd: RawFd) {
        let reg = self.registrations.lock().unwrap().remove(&fd);
        if let Some(reg) = reg {
            self.epoll_del(fd);
            for (_, waker) in reg.readers.into_iter().chain(reg.writers) {
                waker.wake();
            }
        }
    }

    fn epoll_del(&self, fd: RawFd) {
        // ENOENT / EBADF are expected if the fd was already closed.
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Wake `waker` once `deadline` has passed.
    pub fn add_timer(&self, deadline: Instant, waker: Waker) -> TimerKey {
        let key = TimerKey(deadline, self.token());
        self.timers.lock().unwrap().insert(key, waker);
        key
    }

    pub fn cancel_timer(&self, key: TimerKey) {
        self.timers.lock().unwrap().remove(&key);
    }

    /// Time until the earliest pending timer, if any.
    pub fn next_timeout(&self) -> Option<Duration> {
        let timers = self.timers.lock().unwrap();
        timers
            .keys()
            .next()
            .map(|key| key.0.saturating_duration_since(Instant::now()))
    }

    pub fn has_waiters(&self) -> bool {
        !self.registrations.lock().unwrap().is_empty() || !self.timers.lock().unwrap().is_empty()
    }

    /// Run one poll cycle, waiting at most `timeout` (forever on `None`),
    /// clamped to the next timer. Returns the number of wakers fired.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let wait = match (timeout, self.next_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let timeout_ms = match wait {
            // Round up so a sub-millisecond timer does not spin.
            Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        // Collect wakers under the lock, wake outside it.
        let mut to_wake = Vec::new();
        {
            let mut regs = self.registrations.lock().unwrap();
            for event in events.iter().take(n as usize) {
                let fd = event.u64 as RawFd;
                if fd == self.wake_fd {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    continue;
                }
                let Some(reg) = regs.get_mut(&fd) else {
                    continue;
                };
                let flags = event.events;
                let hangup = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
                if flags & ((libc::EPOLLIN | libc::EPOLLRDHUP) as u32 | hangup) != 0 {
                    to_wake.extend(reg.readers.drain(..).map(|(_, w)| w));
                }
                if flags & (libc::EPOLLOUT as u32 | hangup) != 0 {
                    to_wake.extend(reg.writers.drain(..).map(|(_, w)| w));
                }
                if reg.is_empty() {
                    regs.remove(&fd);
                    self.epoll_del(fd);
                } else {
                    let mut ev = libc::epoll_event {
                        events: reg.events(),
                        u64: fd as u64,
                    };
                    unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
                }
            }
        }

        {
            let now = Instant::now();
            let mut timers = self.timers.lock().unwrap();
            let later = timers.split_off(&TimerKey(now, u64::MAX));
            let expired = std::mem::replace(&mut *timers, later);
            to_wake.extend(expired.into_values());
        }

        let woken = to_wake.len();
        for waker in to_wake {
            waker.wake();
        }
        Ok(woken)
    }

    /// Drop every parked waker and timer without waking them.
    pub fn clear(&self) {
        let regs = std::mem::take(&mut *self.registrations.lock().unwrap());
        for &fd in regs.keys() {
            self.epoll_del(fd);
        }
        let timers = std::mem::take(&mut *self.timers.lock().unwrap());
        // Dropped outside the locks: a dropped task may deregister itself.
        drop(regs);
        drop(timers);
    }

    /// Interrupt a blocked `poll_once` from any thread.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let regs = self.registrations.get_mut().unwrap_or_else(|e| e.into_inner());
        let fds: Vec<RawFd> = regs.keys().copied().collect();
        for fd in fds {
            self.epoll_del(fd);
        }
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    struct CountingWaker {
        hits: AtomicUsize,
    }

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.hits.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let cw = Arc::new(CountingWaker {
            hits: AtomicUsize::new(0),
        });
        let waker = Waker::from(cw.clone());
        (cw, waker)
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn reactor_lifecycle() {
        let reactor = Reactor::new().unwrap();
        reactor.request_shutdown();
        assert!(reactor.should_shutdown());
    }

    #[test]
    fn dropping_with_live_registrations_releases_them() {
        let (read_fd, write_fd) = pipe();
        let (cw, waker) = counting();
        {
            let reactor = Reactor::new().unwrap();
            reactor.register(read_fd, Interest::Readable, waker).unwrap();
            assert!(reactor.has_waiters());
        }
        assert_eq!(cw.hits.load(Ordering::Acquire), 0);
        assert_eq!(Arc::strong_count(&cw), 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn pipe_readiness_is_one_shot() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();
        let (cw, waker) = counting();

        reactor.register(read_fd, Interest::Readable, waker).unwrap();
        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        assert_eq!(reactor.poll_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(cw.hits.load(Ordering::Acquire), 1);

        // Registration was consumed; data still pending but nobody is parked.
        assert_eq!(reactor.poll_once(Some(Duration::from_millis(1))).unwrap(), 0);
        assert!(!reactor.has_waiters());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn deregister_withdraws_waker() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();
        let (cw, waker) = counting();

        let token = reactor.register(read_fd, Interest::Readable, waker).unwrap();
        reactor.deregister(read_fd, token);
        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        assert_eq!(reactor.poll_once(Some(Duration::from_millis(5))).unwrap(), 0);
        assert_eq!(cw.hits.load(Ordering::Acquire), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn regular_file_is_rejected_with_eperm() {
        let reactor = Reactor::new().unwrap();
        let file = tempfile::tempfile().unwrap();
        let (_cw, waker) = counting();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        let err = reactor.register(fd, Interest::Readable, waker).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
        assert!(!reactor.has_waiters());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let reactor = Reactor::new().unwrap();
        let (cw, waker) = counting();
        let now = Instant::now();
        reactor.add_timer(now + Duration::from_millis(5), waker.clone());
        let late = reactor.add_timer(now + Duration::from_secs(60), waker);

        let woken = reactor.poll_once(None).unwrap();
        assert_eq!(woken, 1);
        assert!(now.elapsed() >= Duration::from_millis(5));
        assert_eq!(cw.hits.load(Ordering::Acquire), 1);

        reactor.cancel_timer(late);
        assert!(reactor.next_timeout().is_none());
    }

    #[test]
    fn timeout_no_events() {
        let reactor = Reactor::new().unwrap();
        assert_eq!(reactor.poll_once(Some(Duration::from_millis(1))).unwrap(), 0);
    }
}
