// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative socket.
//!
//! The fd is always non-blocking. Operations that would block park the
//! current task in the reactor (or block in `poll(2)` on a plain thread)
//! until ready or until the per-direction timeout passes.

use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::green::io::{poll_now, set_nonblocking, timed_out, wait_fd, would_block, PollFd};
use crate::green::reactor::Interest;
use crate::green::worker::Handle;
use crate::net::{self, from_raw, resolve, split_host_port, SockAddr};
use crate::tls::{HandshakeStatus, Role, SharedEngine, TlsOptions, TlsSession};
use crate::timeout::deadline_after;

/// Address family and type of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
    UnixStream,
    UnixDgram,
}

impl SocketKind {
    fn domain(self) -> libc::c_int {
        match self {
            SocketKind::Tcp | SocketKind::Udp => libc::AF_INET,
            SocketKind::Tcp6 | SocketKind::Udp6 => libc::AF_INET6,
            SocketKind::UnixStream | SocketKind::UnixDgram => libc::AF_UNIX,
        }
    }

    fn sock_type(self) -> libc::c_int {
        if self.is_stream() {
            libc::SOCK_STREAM
        } else {
            libc::SOCK_DGRAM
        }
    }

    pub fn is_stream(self) -> bool {
        matches!(self, SocketKind::Tcp | SocketKind::Tcp6 | SocketKind::UnixStream)
    }

    pub fn is_inet(self) -> bool {
        !self.is_unix()
    }

    pub fn is_unix(self) -> bool {
        matches!(self, SocketKind::UnixStream | SocketKind::UnixDgram)
    }

    pub fn is_v6(self) -> bool {
        matches!(self, SocketKind::Tcp6 | SocketKind::Udp6)
    }
}

/// Per-direction timeouts. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl Timeouts {
    pub fn uniform(timeout: Option<Duration>) -> Self {
        Self {
            connect: timeout,
            read: timeout,
            write: timeout,
        }
    }
}

/// A blocking send that stopped early.
#[derive(Debug)]
pub struct PartialWrite {
    /// Bytes delivered before the failure.
    pub written: usize,
    pub error: io::Error,
}

impl std::fmt::Display for PartialWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "write stopped after {} bytes: {}", self.written, self.error)
    }
}

impl std::error::Error for PartialWrite {}

/// Errors that carry no OS code report this one.
pub const NO_OS_CODE: i32 = -1;

/// OS error code of `err`, or [`NO_OS_CODE`].
pub fn error_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(NO_OS_CODE)
}

struct Secure {
    engine: SharedEngine,
    options: TlsOptions,
    session: Option<Box<dyn TlsSession>>,
    /// Decrypted bytes not yet handed to the reader.
    plain: Vec<u8>,
}

pub struct CoSocket {
    fd: Option<OwnedFd>,
    kind: SocketKind,
    timeouts: Timeouts,
    last_error: Option<(i32, String)>,
    secure: Option<Secure>,
}

impl std::fmt::Debug for CoSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoSocket")
            .field("fd", &self.raw_fd())
            .field("kind", &self.kind)
            .field("tls", &self.tls_established())
            .finish()
    }
}

impl CoSocket {
    pub fn new(kind: SocketKind) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                kind.domain(),
                kind.sock_type() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self::from_owned(unsafe { OwnedFd::from_raw_fd(fd) }, kind))
    }

    /// Adopt an existing fd, switching it to non-blocking mode.
    pub fn from_fd(fd: OwnedFd, kind: SocketKind) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd(), true)?;
        Ok(Self::from_owned(fd, kind))
    }

    fn from_owned(fd: OwnedFd, kind: SocketKind) -> Self {
        Self {
            fd: Some(fd),
            kind,
            timeouts: Timeouts::default(),
            last_error: None,
            secure: None,
        }
    }

    /// Connected pair of unix stream sockets.
    pub fn pair() -> io::Result<(CoSocket, CoSocket)> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((
            Self::from_owned(a, SocketKind::UnixStream),
            Self::from_owned(b, SocketKind::UnixStream),
        ))
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// The descriptor, or -1 once closed.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.read = timeout;
    }

    /// Code and message of the most recent failure.
    pub fn last_error(&self) -> Option<(i32, &str)> {
        self.last_error.as_ref().map(|(c, m)| (*c, m.as_str()))
    }

    pub fn err_code(&self) -> i32 {
        self.last_error.as_ref().map_or(0, |(c, _)| *c)
    }

    pub fn err_msg(&self) -> &str {
        self.last_error.as_ref().map_or("", |(_, m)| m.as_str())
    }

    pub fn set_last_error(&mut self, code: i32, message: impl Into<String>) {
        self.last_error = Some((code, message.into()));
    }

    fn record<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            self.last_error = Some((error_code(e), e.to_string()));
        }
        result
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn deadline(timeout: Option<Duration>) -> Option<Instant> {
        timeout.and_then(deadline_after)
    }

    async fn target_addr(&self, target: &str) -> io::Result<SockAddr> {
        if self.kind.is_unix() {
            return Ok(SockAddr::Unix(target.into()));
        }
        let (host, port) = split_host_port(target)?;
        Ok(SockAddr::Inet(resolve(host, port, self.kind.is_v6()).await?))
    }

    pub async fn connect(&mut self, target: &str, timeout: Option<Duration>) -> io::Result<()> {
        let result = self.connect_inner(target, timeout).await;
        self.record(result)
    }

    async fn connect_inner(&mut self, target: &str, timeout: Option<Duration>) -> io::Result<()> {
        let addr = self.target_addr(target).await?;
        self.connect_addr(&addr, timeout.or(self.timeouts.connect)).await
    }

    pub async fn connect_addr(
        &mut self,
        addr: &SockAddr,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let fd = self.fd()?;
        let raw = net::to_raw(addr)?;
        let ret = unsafe { libc::connect(fd, raw.as_ptr(), raw.len) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        wait_fd(fd, Interest::Writable, Self::deadline(timeout)).await?;
        match self.get_opt(libc::SOL_SOCKET, libc::SO_ERROR)? {
            0 => Ok(()),
            code => Err(io::Error::from_raw_os_error(code)),
        }
    }

    pub async fn bind(&mut self, target: &str) -> io::Result<()> {
        let result = async {
            let addr = self.target_addr(target).await?;
            self.bind_addr(&addr)
        }
        .await;
        self.record(result)
    }

    pub fn bind_addr(&mut self, addr: &SockAddr) -> io::Result<()> {
        let fd = self.fd()?;
        let raw = net::to_raw(addr)?;
        if unsafe { libc::bind(fd, raw.as_ptr(), raw.len) } < 0 {
            return self.record(Err(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> io::Result<()> {
        let fd = self.fd()?;
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return self.record(Err(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Accept one peer. The new socket inherits this socket's timeouts and
    /// secure-channel configuration (without a session).
    pub async fn accept(&mut self, timeout: Option<Duration>) -> io::Result<CoSocket> {
        let result = self.accept_inner(timeout).await;
        self.record(result)
    }

    async fn accept_inner(&mut self, timeout: Option<Duration>) -> io::Result<CoSocket> {
        let fd = self.fd()?;
        let deadline = Self::deadline(timeout.or(self.timeouts.read));
        loop {
            let client = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if client >= 0 {
                let mut sock = Self::from_owned(unsafe { OwnedFd::from_raw_fd(client) }, self.kind);
                sock.timeouts = self.timeouts;
                if let Some(secure) = &self.secure {
                    sock.enable_tls(secure.engine.clone(), secure.options.clone());
                }
                return Ok(sock);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                _ if would_block(&err) => wait_fd(fd, Interest::Readable, deadline).await?,
                _ => return Err(err),
            }
        }
    }

    fn raw_send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn raw_recv(&self, fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Write every byte of `buf` to the wire, waiting as needed.
    async fn wire_send_all(&self, buf: &[u8]) -> Result<usize, PartialWrite> {
        let fd = self.fd().map_err(|error| PartialWrite { written: 0, error })?;
        let deadline = Self::deadline(self.timeouts.write);
        let mut written = 0;
        while written < buf.len() {
            match self.raw_send(fd, &buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if would_block(&e) => {
                    if let Err(error) = wait_fd(fd, Interest::Writable, deadline).await {
                        return Err(PartialWrite { written, error });
                    }
                }
                Err(error) => return Err(PartialWrite { written, error }),
            }
        }
        Ok(written)
    }

    /// Read at least one byte from the wire, waiting up to the read timeout.
    async fn wire_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd()?;
        let deadline = Self::deadline(self.timeouts.read);
        loop {
            match self.raw_recv(fd, buf, 0) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if would_block(&e) => wait_fd(fd, Interest::Readable, deadline).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Deliver all of `buf`, suspending until done. Stops at the first error
    /// or at the write timeout and reports how far it got.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<usize, PartialWrite> {
        let result = match self.secure.as_mut().and_then(|s| s.session.as_mut()) {
            Some(session) => {
                let mut wire = Vec::with_capacity(buf.len() + 64);
                match session.seal(buf, &mut wire) {
                    // Ciphertext either all lands or the plaintext count is unknown.
                    Ok(()) => self
                        .wire_send_all(&wire)
                        .await
                        .map(|_| buf.len())
                        .map_err(|p| PartialWrite { written: 0, error: p.error }),
                    Err(error) => Err(PartialWrite { written: 0, error }),
                }
            }
            None => self.wire_send_all(buf).await,
        };
        if let Err(p) = &result {
            self.last_error = Some((error_code(&p.error), p.error.to_string()));
        }
        result
    }

    /// One send attempt. Returns `EAGAIN` instead of waiting.
    ///
    /// On a secure channel the attempt is refused with `EAGAIN` unless the
    /// socket is writable right now. Once a record is sealed it is written
    /// whole, so a peer that stops reading mid-record can still make this
    /// wait up to the write timeout.
    pub async fn send_nowait(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tls_established() {
            let writable = self.fd().and_then(|fd| {
                let probe = PollFd { fd, read: false, write: true, except: false };
                poll_now(&[probe], 0)
            });
            let result = match writable {
                Ok(ready) if ready.iter().any(|r| r.writable) => {
                    self.send_all(buf).await.map_err(|p| p.error)
                }
                Ok(_) => Err(io::Error::from_raw_os_error(libc::EAGAIN)),
                Err(e) => Err(e),
            };
            return self.record(result);
        }
        let result = self.fd().and_then(|fd| self.raw_send(fd, buf));
        self.record(result)
    }

    /// Receive up to `buf.len()` bytes, suspending until data, EOF, error,
    /// or the read timeout.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.recv_inner(buf, true).await;
        self.record(result)
    }

    /// One receive attempt. Returns `EAGAIN` instead of waiting.
    pub async fn recv_nowait(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.recv_inner(buf, false).await;
        self.record(result)
    }

    async fn recv_inner(&mut self, buf: &mut [u8], wait: bool) -> io::Result<usize> {
        if !self.tls_established() {
            return if wait {
                self.wire_recv(buf).await
            } else {
                let fd = self.fd()?;
                self.raw_recv(fd, buf, 0)
            };
        }

        let mut wire = vec![0u8; buf.len().max(4096)];
        loop {
            if let Some(secure) = self.secure.as_mut() {
                if !secure.plain.is_empty() {
                    let n = buf.len().min(secure.plain.len());
                    buf[..n].copy_from_slice(&secure.plain[..n]);
                    secure.plain.drain(..n);
                    return Ok(n);
                }
            }
            let n = if wait {
                self.wire_recv(&mut wire).await?
            } else {
                let fd = self.fd()?;
                self.raw_recv(fd, &mut wire, 0)?
            };
            if n == 0 {
                return Ok(0);
            }
            if let Some(Secure {
                session: Some(session),
                plain,
                ..
            }) = self.secure.as_mut()
            {
                session.open(&wire[..n], plain)?;
            }
            if !wait && self.secure.as_ref().is_some_and(|s| s.plain.is_empty()) {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
        }
    }

    /// Look at pending bytes without consuming them. Never waits.
    pub fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self
            .fd()
            .and_then(|fd| self.raw_recv(fd, buf, libc::MSG_PEEK | libc::MSG_DONTWAIT));
        self.record(result)
    }

    pub async fn send_to(&mut self, buf: &[u8], target: &str) -> io::Result<usize> {
        let result = async {
            let addr = self.target_addr(target).await?;
            self.send_to_addr(buf, &addr).await
        }
        .await;
        self.record(result)
    }

    async fn send_to_addr(&self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
        let fd = self.fd()?;
        let raw = net::to_raw(addr)?;
        let deadline = Self::deadline(self.timeouts.write);
        loop {
            let n = unsafe {
                libc::sendto(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                    raw.as_ptr(),
                    raw.len,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if !would_block(&err) {
                return Err(err);
            }
            wait_fd(fd, Interest::Writable, deadline).await?;
        }
    }

    /// Receive one datagram (or stream chunk) along with its source.
    pub async fn recv_from(&mut self, buf: &mut [u8], peek: bool) -> io::Result<(usize, SockAddr)> {
        let result = self.recv_from_inner(buf, peek).await;
        self.record(result)
    }

    async fn recv_from_inner(&self, buf: &mut [u8], peek: bool) -> io::Result<(usize, SockAddr)> {
        let fd = self.fd()?;
        let deadline = Self::deadline(self.timeouts.read);
        let flags = if peek { libc::MSG_PEEK } else { 0 };
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n >= 0 {
                return Ok((n as usize, from_raw(&storage, len)));
            }
            let err = io::Error::last_os_error();
            if !would_block(&err) {
                return Err(err);
            }
            wait_fd(fd, Interest::Readable, deadline).await?;
        }
    }

    pub fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        let result = self.fd().and_then(|fd| {
            if unsafe { libc::shutdown(fd, how) } < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        });
        self.record(result)
    }

    /// Close the fd. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.tls_established() {
            self.tls_shutdown();
        }
        let Some(fd) = self.fd.take() else {
            return false;
        };
        if let Some(handle) = Handle::try_current() {
            handle.reactor().forget(fd.as_raw_fd());
        }
        drop(fd);
        true
    }

    /// Whether the peer is still there: pending data or a would-block both
    /// count as alive, EOF or an error as dead.
    pub fn check_liveness(&self) -> bool {
        let Ok(fd) = self.fd() else {
            return false;
        };
        let mut probe = [0u8; 1];
        match self.raw_recv(fd, &mut probe, libc::MSG_PEEK | libc::MSG_DONTWAIT) {
            Ok(n) => n > 0 || !self.kind.is_stream(),
            Err(e) => would_block(&e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SockAddr> {
        self.name(false)
    }

    pub fn peer_addr(&self) -> io::Result<SockAddr> {
        self.name(true)
    }

    fn name(&self, peer: bool) -> io::Result<SockAddr> {
        let fd = self.fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ptr = &mut storage as *mut _ as *mut libc::sockaddr;
        let ret = unsafe {
            if peer {
                libc::getpeername(fd, ptr, &mut len)
            } else {
                libc::getsockname(fd, ptr, &mut len)
            }
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(from_raw(&storage, len))
    }

    pub fn set_opt(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        let fd = self.fd()?;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn get_opt(&self, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
        let fd = self.fd()?;
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                level,
                name,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_BROADCAST, on as libc::c_int)
    }

    pub fn set_ipv6_only(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, on as libc::c_int)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    /// Arm the secure channel. The handshake happens in `tls_handshake`.
    pub fn enable_tls(&mut self, engine: SharedEngine, options: TlsOptions) {
        self.secure = Some(Secure {
            engine,
            options,
            session: None,
            plain: Vec::new(),
        });
    }

    pub fn tls_enabled(&self) -> bool {
        self.secure.is_some()
    }

    /// Decrypted bytes already waiting for the next `recv`.
    pub fn pending(&self) -> usize {
        self.secure.as_ref().map_or(0, |s| s.plain.len())
    }

    /// Record a read that ran out of time before reaching the socket.
    pub fn note_read_timeout(&mut self) -> io::Error {
        let e = timed_out();
        self.last_error = Some((error_code(&e), e.to_string()));
        e
    }

    pub fn tls_established(&self) -> bool {
        self.secure.as_ref().is_some_and(|s| s.session.is_some())
    }

    pub fn tls_options_mut(&mut self) -> Option<&mut TlsOptions> {
        self.secure.as_mut().map(|s| &mut s.options)
    }

    pub fn tls_session(&self) -> Option<&dyn TlsSession> {
        self.secure.as_ref().and_then(|s| s.session.as_deref())
    }

    /// Run the handshake to completion over the wire.
    pub async fn tls_handshake(&mut self, role: Role) -> io::Result<()> {
        let result = self.tls_handshake_inner(role).await;
        self.record(result)
    }

    async fn tls_handshake_inner(&mut self, role: Role) -> io::Result<()> {
        let secure = self
            .secure
            .as_ref()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::Unsupported, "secure channel not enabled")
            })?;
        let mut session = secure.engine.session(role, &secure.options)?;

        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();
        let mut chunk = vec![0u8; 4096];
        loop {
            outgoing.clear();
            let status = session.handshake(&incoming, &mut outgoing)?;
            if !outgoing.is_empty() {
                self.wire_send_all(&outgoing).await.map_err(|p| p.error)?;
            }
            if status == HandshakeStatus::Done {
                break;
            }
            let n = self.wire_recv(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during handshake",
                ));
            }
            incoming.clear();
            incoming.extend_from_slice(&chunk[..n]);
        }

        let mut plain = Vec::new();
        // Application data that arrived with the final handshake record.
        session.open(&[], &mut plain)?;
        if let Some(secure) = self.secure.as_mut() {
            secure.plain = plain;
            secure.session = Some(session);
        }
        Ok(())
    }

    /// Send a close alert (best effort) and drop the session.
    pub fn tls_shutdown(&mut self) {
        let Some(mut session) = self.secure.as_mut().and_then(|s| s.session.take()) else {
            return;
        };
        let mut alert = Vec::new();
        session.close_notify(&mut alert);
        if let Ok(fd) = self.fd() {
            let _ = self.raw_send(fd, &alert);
        }
        if let Some(secure) = self.secure.as_mut() {
            secure.plain.clear();
        }
    }
}

impl Drop for CoSocket {
    fn drop(&mut self) {
        self.close();
    }
}
