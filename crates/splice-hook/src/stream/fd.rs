// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Streams over plain descriptors: pipes and stdio.
//!
//! The cooperative flavor switches the fd to non-blocking mode and parks
//! the task until it is ready; the plain flavor makes ordinary blocking
//! syscalls.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use async_trait::async_trait;
use splice_rt::green::io::{set_nonblocking, would_block};
use splice_rt::{wait_fd, Interest};

use super::{fstat, CastAs, FileStat, OptionReply, Stream, StreamMeta, StreamOption};
use crate::error::StreamError;

enum Descriptor {
    Owned(OwnedFd),
    /// Not ours to close (process stdio).
    Borrowed(RawFd),
}

impl Descriptor {
    fn raw(&self) -> RawFd {
        match self {
            Descriptor::Owned(fd) => fd.as_raw_fd(),
            Descriptor::Borrowed(fd) => *fd,
        }
    }
}

pub struct FdStream {
    fd: Option<Descriptor>,
    cooperative: bool,
    eof: bool,
}

impl FdStream {
    pub fn owned(fd: OwnedFd, cooperative: bool) -> io::Result<Self> {
        Self::open(Descriptor::Owned(fd), cooperative)
    }

    pub fn borrowed(fd: RawFd, cooperative: bool) -> io::Result<Self> {
        Self::open(Descriptor::Borrowed(fd), cooperative)
    }

    fn open(fd: Descriptor, cooperative: bool) -> io::Result<Self> {
        if cooperative {
            set_nonblocking(fd.raw(), true)?;
        }
        Ok(Self {
            fd: Some(fd),
            cooperative,
            eof: false,
        })
    }

    pub fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn raw(&self) -> Result<RawFd, StreamError> {
        self.fd.as_ref().map(Descriptor::raw).ok_or(StreamError::Closed)
    }
}

fn sys_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sys_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[async_trait]
impl Stream for FdStream {
    fn label(&self) -> &'static str {
        if self.cooperative {
            "STDIO/coroutine"
        } else {
            "STDIO"
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let fd = self.raw()?;
        loop {
            match sys_read(fd, buf) {
                Ok(n) => {
                    if n == 0 && !buf.is_empty() {
                        self.eof = true;
                    }
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if self.cooperative && would_block(&e) => {
                    wait_fd(fd, Interest::Readable, None).await?;
                }
                Err(e) => {
                    self.eof = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Writes everything, waiting for room as needed.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        let fd = self.raw()?;
        let mut written = 0;
        while written < buf.len() {
            match sys_write(fd, &buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if self.cooperative && would_block(&e) => {
                    wait_fd(fd, Interest::Writable, None).await?;
                }
                Err(e) => {
                    tracing::warn!(bytes = buf.len(), error = %e, "write failed");
                    self.eof = true;
                    return Err(e.into());
                }
            }
        }
        Ok(written)
    }

    fn read_wait(&self) -> Option<(RawFd, Option<Duration>)> {
        self.fd.as_ref().filter(|_| self.cooperative).map(|fd| (fd.raw(), None))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.fd = None;
        Ok(())
    }

    fn cast(&self, _as: CastAs) -> Result<RawFd, StreamError> {
        self.raw()
    }

    fn stat(&self) -> Result<FileStat, StreamError> {
        Ok(fstat(self.raw()?)?)
    }

    async fn set_option(&mut self, option: StreamOption) -> Result<OptionReply, StreamError> {
        match option {
            StreamOption::MetaData => Ok(OptionReply::Meta(StreamMeta {
                eof: self.is_eof(),
                blocked: true,
                ..StreamMeta::default()
            })),
            _ => Err(StreamError::Unsupported("this option on a descriptor stream")),
        }
    }

    fn is_eof(&self) -> bool {
        self.eof || self.fd.is_none()
    }
}

/// Anonymous pipe as `(read end, write end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::os::unix::io::FromRawFd;

    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_rt::{spawn, Worker, WorkerCensus};

    #[test]
    fn plain_pipe_round_trip() {
        let (r, w) = pipe().unwrap();
        let mut reader = FdStream::owned(r, false).unwrap();
        let mut writer = FdStream::owned(w, false).unwrap();
        let out = splice_rt::block_on(async move {
            writer.write(b"abc").await.unwrap();
            writer.close().await.unwrap();
            let mut buf = [0u8; 8];
            let n = reader.read(&mut buf).await.unwrap();
            let end = reader.read(&mut buf).await.unwrap();
            (buf[..n].to_vec(), end, reader.is_eof())
        });
        assert_eq!(out, (b"abc".to_vec(), 0, true));
    }

    #[test]
    fn cooperative_read_waits_for_writer_task() {
        let (r, w) = pipe().unwrap();
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let out = worker.block_on(async move {
            let mut reader = FdStream::owned(r, true).unwrap();
            let mut writer = FdStream::owned(w, true).unwrap();
            let producer = spawn(async move {
                splice_rt::sleep(std::time::Duration::from_millis(5)).await;
                writer.write(b"late").await.unwrap();
            });
            let mut buf = [0u8; 8];
            let n = reader.read(&mut buf).await.unwrap();
            producer.await.unwrap();
            buf[..n].to_vec()
        });
        assert_eq!(out, b"late");
    }

    #[test]
    fn borrowed_descriptor_is_left_open() {
        let (r, _w) = pipe().unwrap();
        let raw = r.as_raw_fd();
        let mut s = FdStream::borrowed(raw, false).unwrap();
        splice_rt::block_on(s.close()).unwrap();
        assert!(fstat(raw).is_ok());
        assert!(s.stat().is_err());
        assert_eq!(s.label(), "STDIO");
    }
}
