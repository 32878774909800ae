// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The generic byte-stream contract and the streams that implement it.
//!
//! Every stream the host hands to script code is a `Box<dyn Stream>`
//! inside a [`StreamCell`]. The contract mirrors a classic stream layer:
//! read and write move bytes, everything else goes through `set_option`.
//!
//! Read/write results:
//! - `Ok(n)` with `n > 0`: progress
//! - `Ok(0)`: end of stream (`is_eof` turns true)
//! - `Err(StreamError::WouldBlock { .. })`: no progress, try again
//! - any other error: the stream is finished (`is_eof` turns true)

pub mod bridge;
pub mod factory;
pub mod fd;
pub mod file;
pub mod options;

use std::net::Shutdown;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::lock::{Mutex, MutexGuard};
use indexmap::IndexMap;
use splice_rt::net::SockAddr;
use splice_rt::timeout::deadline_after;
use splice_rt::{wait_fd, Interest};

use crate::error::StreamError;
use crate::value::Value;

pub use bridge::SocketStream;
pub use options::{ContextOptions, ContextRef, SocketOptions, SslOptions};

/// What a caller wants a stream's descriptor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastAs {
    Fd,
    FdForSelect,
    Socket,
}

/// Subset of `struct stat` the host exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub mtime: i64,
}

impl FileStat {
    pub fn is_socket(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFSOCK
    }

    pub fn is_fifo(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFIFO
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

pub fn fstat(fd: RawFd) -> std::io::Result<FileStat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(FileStat {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u64,
        uid: st.st_uid as u32,
        gid: st.st_gid as u32,
        size: st.st_size as i64,
        mtime: st.st_mtime as i64,
    })
}

/// Transport-level requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XportOp {
    /// Connect to `host:port` (or a path for unix sockets).
    Connect { target: String, timeout: Option<Duration> },
    Bind { target: String },
    Listen { backlog: i32 },
    Accept { timeout: Option<Duration> },
    GetName,
    GetPeerName,
    /// Send to the connected peer, or to `to` for datagrams.
    Send { data: Vec<u8>, to: Option<String> },
    Recv { len: usize, peek: bool, want_addr: bool },
    Shutdown(Shutdown),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOp {
    Setup,
    Enable(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOption {
    Blocking(bool),
    ReadTimeout(Option<Duration>),
    CheckLiveness,
    MetaData,
    Xport(XportOp),
    Crypto(CryptoOp),
}

/// Negotiated secure-channel parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoMeta {
    pub protocol: String,
    pub cipher_name: String,
    pub cipher_bits: u32,
    pub cipher_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMeta {
    pub timed_out: bool,
    pub eof: bool,
    pub blocked: bool,
    pub crypto: Option<CryptoMeta>,
}

impl StreamMeta {
    pub fn to_value(&self) -> Value {
        let mut map = IndexMap::new();
        if let Some(c) = &self.crypto {
            let mut crypto = IndexMap::new();
            crypto.insert("protocol".to_string(), Value::from(c.protocol.as_str()));
            crypto.insert("cipher_name".to_string(), Value::from(c.cipher_name.as_str()));
            crypto.insert("cipher_bits".to_string(), Value::Int(c.cipher_bits as i64));
            crypto.insert("cipher_version".to_string(), Value::from(c.cipher_version.as_str()));
            map.insert("crypto".to_string(), Value::Map(crypto));
        }
        map.insert("timed_out".to_string(), Value::Bool(self.timed_out));
        map.insert("eof".to_string(), Value::Bool(self.eof));
        map.insert("blocked".to_string(), Value::Bool(self.blocked));
        Value::Map(map)
    }
}

#[derive(Debug)]
pub enum OptionReply {
    Done,
    /// Previous value of a toggled setting.
    Previous(bool),
    Alive(bool),
    Meta(StreamMeta),
    Accepted { stream: StreamRef, peer: Option<SockAddr> },
    Name(SockAddr),
    Sent(usize),
    Received { data: Vec<u8>, from: Option<SockAddr> },
}

#[async_trait]
pub trait Stream: Send {
    /// Short name of the implementation, e.g. `"tcp_socket/coroutine"`.
    fn label(&self) -> &'static str;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError>;

    async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError>;

    async fn flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    /// Release the underlying resource. Closing twice is harmless.
    async fn close(&mut self) -> Result<(), StreamError>;

    fn cast(&self, as_: CastAs) -> Result<RawFd, StreamError>;

    fn stat(&self) -> Result<FileStat, StreamError>;

    async fn set_option(&mut self, option: StreamOption) -> Result<OptionReply, StreamError> {
        let _ = option;
        Err(StreamError::Unsupported("set_option"))
    }

    /// Bytes already read from the source but not yet handed out.
    fn buffered(&self) -> usize {
        0
    }

    /// Where a blocking read would park: the descriptor and how long it may
    /// wait. [`StreamCell::read`] waits there without holding the stream.
    fn read_wait(&self) -> Option<(RawFd, Option<Duration>)> {
        None
    }

    /// Stands in for `read` once the wait from [`Stream::read_wait`] ran out.
    fn read_timed_out(&mut self) -> StreamError {
        StreamError::WouldBlock { timed_out: true }
    }

    fn is_eof(&self) -> bool;
}

/// Shared handle to an open stream.
pub struct StreamCell {
    id: u64,
    label: &'static str,
    inner: Mutex<Box<dyn Stream>>,
}

pub type StreamRef = Arc<StreamCell>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl StreamCell {
    pub fn new(stream: impl Stream + 'static) -> StreamRef {
        Self::from_box(Box::new(stream))
    }

    pub fn from_box(stream: Box<dyn Stream>) -> StreamRef {
        Arc::new(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            label: stream.label(),
            inner: Mutex::new(stream),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Exclusive access for the duration of one operation.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Stream>> {
        self.inner.lock().await
    }

    /// Read up to `len` bytes.
    ///
    /// The wait for data happens with the stream unlocked, so writers and
    /// selectors on the same stream are not held up behind a slow reader.
    pub async fn read(&self, len: usize) -> Result<Vec<u8>, StreamError> {
        let park = if len == 0 { None } else { self.lock().await.read_wait() };
        if let Some((fd, timeout)) = park {
            let deadline = timeout.and_then(deadline_after);
            if let Err(e) = wait_fd(fd, Interest::Readable, deadline).await {
                if e.raw_os_error() == Some(libc::ETIMEDOUT) {
                    return Err(self.lock().await.read_timed_out());
                }
                // Anything else resurfaces from the read itself.
            }
        }
        let mut buf = vec![0u8; len];
        let n = self.lock().await.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.lock().await.write(data).await
    }

    pub async fn close(&self) -> Result<(), StreamError> {
        self.lock().await.close().await
    }

    pub async fn set_option(&self, option: StreamOption) -> Result<OptionReply, StreamError> {
        self.lock().await.set_option(option).await
    }
}

impl std::fmt::Debug for StreamCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamCell(#{} {})", self.id, self.label)
    }
}
