// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative socket behind the generic stream contract.
//!
//! Blocking mode suspends the calling task until the whole operation is
//! done (or the socket's timeout passes); non-blocking mode makes exactly
//! one attempt. Outcomes are normalized by the `settle_*` functions so the
//! caller sees the classic contract: progress, retry, or end of stream.

use std::io;
use std::net::Shutdown;
use std::os::unix::io::{OwnedFd, RawFd};
use std::time::Duration;

use async_trait::async_trait;
use splice_rt::green::io::would_block;
use splice_rt::net::{split_host_port, SockAddr};
use splice_rt::socket::error_code;
use splice_rt::tls::{Role, TlsOptions};
use splice_rt::{CoSocket, PartialWrite, SocketKind, Timeouts};

use super::options::{ContextOptions, ContextRef};
use super::{
    fstat, CastAs, CryptoMeta, CryptoOp, FileStat, OptionReply, Stream, StreamCell, StreamMeta,
    StreamOption, XportOp,
};
use crate::error::StreamError;

/// How one read or write attempt ended, as the caller should see it.
#[derive(Debug, PartialEq)]
pub(crate) struct Settled {
    pub result: Result<usize, StreamError>,
    /// The stream is finished after this attempt.
    pub eof: bool,
}

fn settle_error(err: &io::Error) -> Settled {
    let timed_out = err.raw_os_error() == Some(libc::ETIMEDOUT);
    if timed_out || would_block(err) {
        Settled {
            result: Err(StreamError::WouldBlock { timed_out }),
            eof: false,
        }
    } else {
        Settled {
            result: Err(StreamError::from_io(err)),
            eof: true,
        }
    }
}

pub(crate) fn settle_read(attempt: io::Result<usize>) -> Settled {
    match attempt {
        Ok(n) => Settled { result: Ok(n), eof: n == 0 },
        Err(e) => settle_error(&e),
    }
}

/// Single non-blocking send. A short count is progress.
pub(crate) fn settle_write(requested: usize, attempt: io::Result<usize>) -> Settled {
    match attempt {
        Ok(0) if requested > 0 => Settled { result: Ok(0), eof: true },
        Ok(n) => Settled { result: Ok(n), eof: false },
        Err(e) => settle_error(&e),
    }
}

/// Blocking send-all. Anything short of `requested` is a failure and the
/// partial count is not reported.
pub(crate) fn settle_blocking_write(
    requested: usize,
    attempt: Result<usize, PartialWrite>,
) -> Settled {
    match attempt {
        Ok(n) if n == requested => Settled { result: Ok(n), eof: false },
        Ok(_) => settle_error(&io::Error::from(io::ErrorKind::WriteZero)),
        Err(partial) => settle_error(&partial.error),
    }
}

fn stream_type(kind: SocketKind) -> &'static str {
    match kind {
        SocketKind::Tcp | SocketKind::Tcp6 => "tcp_socket/coroutine",
        SocketKind::Udp | SocketKind::Udp6 => "udp_socket/coroutine",
        SocketKind::UnixStream => "unix_socket/coroutine",
        SocketKind::UnixDgram => "udg_socket/coroutine",
    }
}

fn io_err(err: io::Error) -> StreamError {
    StreamError::from_io(&err)
}

pub struct SocketStream {
    sock: Option<CoSocket>,
    blocking: bool,
    eof: bool,
    timed_out: bool,
    role: Role,
    context: ContextRef,
    label: &'static str,
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream")
            .field("sock", &self.sock)
            .field("blocking", &self.blocking)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl SocketStream {
    /// Wrap a socket this side will connect (or listen) with.
    pub fn new(sock: CoSocket, context: ContextRef) -> Self {
        Self::with_role(sock, context, Role::Client)
    }

    fn with_role(sock: CoSocket, context: ContextRef, role: Role) -> Self {
        Self {
            label: stream_type(sock.kind()),
            sock: Some(sock),
            blocking: true,
            eof: false,
            timed_out: false,
            role,
            context,
        }
    }

    /// Adopt an already-open descriptor, applying `timeout` in every
    /// direction.
    pub fn from_fd(fd: OwnedFd, kind: SocketKind, timeout: Option<Duration>) -> io::Result<Self> {
        let mut sock = CoSocket::from_fd(fd, kind)?;
        sock.set_timeouts(Timeouts::uniform(timeout));
        Ok(Self::new(sock, ContextOptions::default().into_ref()))
    }

    pub fn socket(&self) -> Option<&CoSocket> {
        self.sock.as_ref()
    }

    pub fn context(&self) -> &ContextRef {
        &self.context
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn sock_mut(&mut self) -> Result<&mut CoSocket, StreamError> {
        self.sock.as_mut().ok_or(StreamError::Closed)
    }

    fn settle(&mut self, settled: Settled) -> Result<usize, StreamError> {
        if settled.eof {
            self.eof = true;
        }
        self.timed_out = matches!(settled.result, Err(StreamError::WouldBlock { timed_out: true }));
        settled.result
    }

    /// Connect, binding first to the `bindto` option if one is set. Secure
    /// sockets then negotiate the channel; failing that fails the connect.
    pub async fn connect(
        &mut self,
        target: &str,
        timeout: Option<Duration>,
    ) -> Result<(), StreamError> {
        let bindto = self.context.lock().unwrap().socket.bindto.clone();
        let sock = self.sock_mut()?;
        if sock.kind().is_inet() && sock.kind().is_stream() {
            if let Err(e) = sock.set_tcp_nodelay(true) {
                tracing::debug!(error = %e, "TCP_NODELAY not applied");
            }
        }

        if let Some(local) = bindto {
            let (host, port) = split_host_port(&local)
                .map_err(|e| StreamError::InvalidArgument(e.to_string()))?;
            let local = if host == "0" { format!(":{}", port) } else { local.clone() };
            sock.bind(&local).await.map_err(io_err)?;
        }

        sock.connect(target, timeout).await.map_err(io_err)?;

        if sock.tls_enabled() {
            self.crypto_setup()?;
            self.crypto_enable(true).await?;
        }
        Ok(())
    }

    /// Bind, applying the `socket` bind options first for inet sockets.
    pub async fn bind(&mut self, target: &str) -> Result<(), StreamError> {
        let opts = self.context.lock().unwrap().socket.clone();
        let sock = self.sock_mut()?;
        if sock.kind().is_inet() {
            sock.set_reuse_addr(true).map_err(io_err)?;
            if opts.ipv6_v6only {
                sock.set_ipv6_only(true).map_err(io_err)?;
            }
            if opts.so_reuseport {
                sock.set_reuse_port(true).map_err(io_err)?;
            }
            if opts.so_broadcast {
                sock.set_broadcast(true).map_err(io_err)?;
            }
        }
        sock.bind(target).await.map_err(io_err)
    }

    pub fn listen(&mut self, backlog: i32) -> Result<(), StreamError> {
        self.sock_mut()?.listen(backlog).map_err(io_err)
    }

    /// Wait for a peer. On a secure listener the peer must complete the
    /// handshake; if it does not, it is dropped and its error becomes the
    /// listener's.
    pub async fn accept(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(SocketStream, Option<SockAddr>), StreamError> {
        let nodelay = self.context.lock().unwrap().socket.tcp_nodelay;
        let listener = self.sock_mut()?;
        let mut client = listener.accept(timeout).await.map_err(io_err)?;

        if client.tls_enabled() {
            if let Err(e) = client.tls_handshake(Role::Server).await {
                let (code, message) = match client.last_error() {
                    Some((code, message)) => (code, message.to_string()),
                    None => (error_code(&e), e.to_string()),
                };
                listener.set_last_error(code, message.clone());
                drop(client);
                return Err(StreamError::Socket { code, message });
            }
        }

        if nodelay && client.kind().is_inet() {
            if let Err(e) = client.set_tcp_nodelay(true) {
                tracing::debug!(error = %e, "TCP_NODELAY not applied to accepted peer");
            }
        }
        let peer = client.peer_addr().ok();
        Ok((SocketStream::with_role(client, self.context.clone(), Role::Server), peer))
    }

    pub fn shutdown(&mut self, how: Shutdown) -> Result<(), StreamError> {
        self.sock_mut()?.shutdown(how).map_err(io_err)
    }

    /// Arm the secure channel if needed and load the `ssl` options into it.
    pub fn crypto_setup(&mut self) -> Result<(), StreamError> {
        let (engine, ssl) = {
            let ctx = self.context.lock().unwrap();
            (ctx.tls_engine.clone(), ctx.ssl.clone())
        };
        let sock = self.sock_mut()?;
        if !sock.tls_enabled() {
            let engine = engine
                .ok_or_else(|| {
                    StreamError::CryptoSetupFailed("no secure transport engine configured".into())
                })?;
            sock.enable_tls(engine, TlsOptions::default());
        }
        if let Some(tls) = sock.tls_options_mut() {
            ssl.apply_to(tls);
        }
        Ok(())
    }

    /// Turn the secure channel on or off. Turning off an active channel
    /// shuts it down and still reports failure.
    pub async fn crypto_enable(&mut self, activate: bool) -> Result<(), StreamError> {
        let role = self.role;
        let established = self.sock_mut()?.tls_established();
        if activate && !established {
            self.crypto_setup()?;
            self.sock_mut()?
                .tls_handshake(role)
                .await
                .map_err(|e| StreamError::CryptoSetupFailed(e.to_string()))?;
        } else if !activate && established {
            self.sock_mut()?.tls_shutdown();
            return Err(StreamError::CryptoSetupFailed("secure channel was shut down".into()));
        }

        if self.sock_mut()?.tls_established() {
            self.capture_peer_certs()?;
        }
        Ok(())
    }

    fn capture_peer_certs(&mut self) -> Result<(), StreamError> {
        let (want_cert, want_chain) = {
            let ctx = self.context.lock().unwrap();
            (ctx.ssl.capture_peer_cert, ctx.ssl.capture_peer_cert_chain)
        };
        if !want_cert {
            return Ok(());
        }
        let session = self
            .sock
            .as_ref()
            .and_then(|s| s.tls_session())
            .ok_or(StreamError::Closed)?;
        let cert = session
            .peer_certificate()
            .ok_or_else(|| StreamError::CryptoSetupFailed("peer presented no certificate".into()))?;
        let chain = if want_chain {
            Some(session.peer_chain()).filter(|c| !c.is_empty())
        } else {
            None
        };

        let mut ctx = self.context.lock().unwrap();
        ctx.ssl.peer_certificate = Some(cert);
        if want_chain {
            ctx.ssl.peer_certificate_chain = chain;
        }
        Ok(())
    }

    pub fn meta(&self) -> StreamMeta {
        let crypto = self.sock.as_ref().and_then(|s| s.tls_session()).map(|session| {
            let cipher = session.cipher();
            CryptoMeta {
                protocol: session.protocol(),
                cipher_name: cipher.name,
                cipher_bits: cipher.bits,
                cipher_version: cipher.version,
            }
        });
        StreamMeta {
            timed_out: self.timed_out,
            eof: self.is_eof(),
            blocked: self.blocking,
            crypto,
        }
    }

    async fn xport(&mut self, op: XportOp) -> Result<OptionReply, StreamError> {
        match op {
            XportOp::Connect { target, timeout } => {
                self.connect(&target, timeout).await?;
                Ok(OptionReply::Done)
            }
            XportOp::Bind { target } => {
                self.bind(&target).await?;
                Ok(OptionReply::Done)
            }
            XportOp::Listen { backlog } => {
                self.listen(backlog)?;
                Ok(OptionReply::Done)
            }
            XportOp::Accept { timeout } => {
                let (client, peer) = self.accept(timeout).await?;
                Ok(OptionReply::Accepted {
                    stream: StreamCell::new(client),
                    peer,
                })
            }
            XportOp::GetName => {
                Ok(OptionReply::Name(self.sock_mut()?.local_addr().map_err(io_err)?))
            }
            XportOp::GetPeerName => {
                Ok(OptionReply::Name(self.sock_mut()?.peer_addr().map_err(io_err)?))
            }
            XportOp::Send { data, to } => {
                let sock = self.sock_mut()?;
                let sent = match to {
                    Some(target) => sock.send_to(&data, &target).await.map_err(io_err),
                    None => sock.send_all(&data).await.map_err(|p| io_err(p.error)),
                };
                if let Err(e) = &sent {
                    tracing::warn!(error = %e, bytes = data.len(), "send failed");
                }
                Ok(OptionReply::Sent(sent?))
            }
            XportOp::Recv { len, peek, want_addr } => {
                let sock = self.sock_mut()?;
                let mut buf = vec![0u8; len];
                let (n, from) = if peek {
                    (sock.peek(&mut buf).map_err(io_err)?, None)
                } else if want_addr {
                    let (n, addr) = sock.recv_from(&mut buf, false).await.map_err(io_err)?;
                    (n, Some(addr))
                } else {
                    (sock.recv(&mut buf).await.map_err(io_err)?, None)
                };
                buf.truncate(n);
                Ok(OptionReply::Received { data: buf, from })
            }
            XportOp::Shutdown(how) => {
                self.shutdown(how)?;
                Ok(OptionReply::Done)
            }
        }
    }
}

#[async_trait]
impl Stream for SocketStream {
    fn label(&self) -> &'static str {
        self.label
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let blocking = self.blocking;
        let sock = self.sock_mut()?;
        let attempt = if blocking {
            sock.recv(buf).await
        } else {
            sock.recv_nowait(buf).await
        };
        self.settle(settle_read(attempt))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let blocking = self.blocking;
        let sock = self.sock_mut()?;
        let settled = if blocking {
            settle_blocking_write(buf.len(), sock.send_all(buf).await)
        } else {
            settle_write(buf.len(), sock.send_nowait(buf).await)
        };
        if let Err(e) = &settled.result {
            if !matches!(e, StreamError::WouldBlock { timed_out: false }) {
                tracing::warn!(bytes = buf.len(), error = %e, "send failed");
            }
        }
        self.settle(settled)
    }

    fn read_wait(&self) -> Option<(RawFd, Option<Duration>)> {
        let sock = self.sock.as_ref().filter(|_| self.blocking)?;
        if sock.pending() > 0 {
            return None;
        }
        Some((sock.raw_fd(), sock.timeouts().read))
    }

    fn read_timed_out(&mut self) -> StreamError {
        let Some(sock) = self.sock.as_mut() else {
            return StreamError::Closed;
        };
        let err = sock.note_read_timeout();
        match self.settle(settle_read(Err(err))) {
            Err(e) => e,
            Ok(_) => StreamError::WouldBlock { timed_out: true },
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if let Some(mut sock) = self.sock.take() {
            sock.close();
        }
        Ok(())
    }

    fn cast(&self, _as: CastAs) -> Result<RawFd, StreamError> {
        self.sock.as_ref().map(CoSocket::raw_fd).ok_or(StreamError::Closed)
    }

    fn stat(&self) -> Result<FileStat, StreamError> {
        let fd = self.cast(CastAs::Fd)?;
        fstat(fd).map_err(io_err)
    }

    async fn set_option(&mut self, option: StreamOption) -> Result<OptionReply, StreamError> {
        match option {
            StreamOption::Blocking(on) => {
                Ok(OptionReply::Previous(std::mem::replace(&mut self.blocking, on)))
            }
            StreamOption::ReadTimeout(timeout) => {
                self.sock_mut()?.set_read_timeout(timeout);
                Ok(OptionReply::Done)
            }
            StreamOption::CheckLiveness => {
                Ok(OptionReply::Alive(self.sock_mut()?.check_liveness()))
            }
            StreamOption::MetaData => Ok(OptionReply::Meta(self.meta())),
            StreamOption::Xport(op) => self.xport(op).await,
            StreamOption::Crypto(CryptoOp::Setup) => {
                self.crypto_setup()?;
                Ok(OptionReply::Done)
            }
            StreamOption::Crypto(CryptoOp::Enable(on)) => {
                self.crypto_enable(on).await?;
                Ok(OptionReply::Done)
            }
        }
    }

    fn is_eof(&self) -> bool {
        self.eof || self.sock.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_rt::{Worker, WorkerCensus};

    fn errno(code: i32) -> io::Error {
        io::Error::from_raw_os_error(code)
    }

    fn worker() -> Worker {
        Worker::with_census(&WorkerCensus::new()).unwrap()
    }

    fn pair() -> (SocketStream, SocketStream) {
        let (a, b) = CoSocket::pair().unwrap();
        let ctx = ContextOptions::default().into_ref();
        (SocketStream::new(a, ctx.clone()), SocketStream::new(b, ctx))
    }

    #[test]
    fn short_blocking_write_on_reset_is_a_failure() {
        let s = settle_blocking_write(
            100,
            Err(PartialWrite {
                written: 40,
                error: errno(libc::ECONNRESET),
            }),
        );
        assert!(s.eof);
        assert_eq!(s.result.unwrap_err().code(), Some(libc::ECONNRESET));
    }

    #[test]
    fn short_blocking_write_on_timeout_is_a_retry() {
        let s = settle_blocking_write(
            100,
            Err(PartialWrite {
                written: 40,
                error: errno(libc::ETIMEDOUT),
            }),
        );
        assert!(!s.eof);
        assert_eq!(s.result, Err(StreamError::WouldBlock { timed_out: true }));
    }

    #[test]
    fn full_blocking_write_reports_count() {
        assert_eq!(
            settle_blocking_write(100, Ok(100)),
            Settled { result: Ok(100), eof: false }
        );
    }

    #[test]
    fn nonblocking_write_outcomes() {
        assert_eq!(settle_write(100, Ok(40)).result, Ok(40));
        let again = settle_write(100, Err(errno(libc::EAGAIN)));
        assert_eq!(again.result, Err(StreamError::WouldBlock { timed_out: false }));
        assert!(!again.eof);
        assert!(settle_write(100, Err(errno(libc::EPIPE))).eof);
    }

    #[test]
    fn read_outcomes() {
        assert_eq!(settle_read(Ok(7)), Settled { result: Ok(7), eof: false });
        assert_eq!(settle_read(Ok(0)), Settled { result: Ok(0), eof: true });
        assert!(!settle_read(Err(errno(libc::ETIMEDOUT))).eof);
        let reset = settle_read(Err(errno(libc::ECONNRESET)));
        assert!(reset.eof);
        assert_eq!(reset.result.unwrap_err().code(), Some(libc::ECONNRESET));
    }

    #[test]
    fn pair_moves_bytes_then_reports_eof() {
        let (mut a, mut b) = pair();
        let got = worker().block_on(async move {
            assert_eq!(a.write(b"hello").await, Ok(5));
            a.close().await.unwrap();
            let mut buf = [0u8; 16];
            let n = b.read(&mut buf).await.unwrap();
            let tail = b.read(&mut buf[n..]).await.unwrap();
            (buf[..n].to_vec(), tail, b.is_eof())
        });
        assert_eq!(got, (b"hello".to_vec(), 0, true));
    }

    #[test]
    fn empty_write_is_not_eof() {
        let (mut a, _b) = pair();
        let n = worker().block_on(async { a.write(b"").await });
        assert_eq!(n, Ok(0));
        assert!(!a.is_eof());
    }

    #[test]
    fn nonblocking_read_without_data_is_a_retry() {
        let (mut a, _b) = pair();
        let out = worker().block_on(async move {
            let prev = a.set_option(StreamOption::Blocking(false)).await.unwrap();
            let mut buf = [0u8; 4];
            (prev, a.read(&mut buf).await, a.is_eof())
        });
        assert!(matches!(out.0, OptionReply::Previous(true)));
        assert_eq!(out.1, Err(StreamError::WouldBlock { timed_out: false }));
        assert!(!out.2);
    }

    #[test]
    fn read_timeout_surfaces_in_metadata() {
        let (mut a, _b) = pair();
        let meta = worker().block_on(async move {
            a.set_option(StreamOption::ReadTimeout(Some(Duration::from_millis(10))))
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(a.read(&mut buf).await, Err(StreamError::WouldBlock { timed_out: true }));
            a.meta()
        });
        assert!(meta.timed_out);
        assert!(!meta.eof);
        assert!(meta.crypto.is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let (mut a, _b) = pair();
        worker().block_on(async {
            a.close().await.unwrap();
            a.close().await.unwrap();
        });
        assert!(a.is_eof());
        assert_eq!(a.cast(CastAs::Fd), Err(StreamError::Closed));
    }

    #[test]
    fn stat_reports_a_socket() {
        let (a, _b) = pair();
        assert!(a.stat().unwrap().is_socket());
        assert_eq!(a.label(), "unix_socket/coroutine");
    }

    #[test]
    fn crypto_without_engine_fails_setup() {
        let (mut a, _b) = pair();
        let err = worker().block_on(async { a.crypto_enable(true).await }).unwrap_err();
        assert_eq!(
            err,
            StreamError::CryptoSetupFailed("no secure transport engine configured".into())
        );
    }

    #[test]
    fn liveness_probe() {
        let (mut a, mut b) = pair();
        let alive = worker().block_on(async move {
            let before = a.set_option(StreamOption::CheckLiveness).await.unwrap();
            b.close().await.unwrap();
            let after = a.set_option(StreamOption::CheckLiveness).await.unwrap();
            (before, after)
        });
        assert!(matches!(alive, (OptionReply::Alive(true), OptionReply::Alive(false))));
    }
}
