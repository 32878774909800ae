// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Regular-file streams.
//!
//! Regular files are always "ready" as far as epoll is concerned, so the
//! cooperative flavor moves each syscall onto a helper thread with
//! `run_blocking` instead of waiting for readiness.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use splice_rt::run_blocking;

use super::{fstat, CastAs, FileStat, OptionReply, Stream, StreamMeta, StreamOption};
use crate::error::StreamError;

/// `fopen`-style mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<Self, StreamError> {
        let mut chars = mode.chars().filter(|c| *c != 'b' && *c != 't');
        let base = chars.next();
        let plus = chars.any(|c| c == '+');
        let m = |read, write, append, truncate, create, create_new| OpenMode {
            read,
            write,
            append,
            truncate,
            create,
            create_new,
        };
        Ok(match base {
            Some('r') => m(true, plus, false, false, false, false),
            Some('w') => m(plus, true, false, true, true, false),
            Some('a') => m(plus, true, true, false, true, false),
            Some('x') => m(plus, true, false, false, false, true),
            Some('c') => m(plus, true, false, false, true, false),
            _ => {
                return Err(StreamError::InvalidArgument(format!("`{}` is not a valid mode", mode)))
            }
        })
    }

    fn options(&self) -> OpenOptions {
        let mut o = OpenOptions::new();
        o.read(self.read)
            .write(self.write && !self.append)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new);
        o
    }
}

pub struct FileStream {
    file: Option<Arc<File>>,
    path: PathBuf,
    cooperative: bool,
    eof: bool,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("path", &self.path)
            .field("cooperative", &self.cooperative)
            .finish()
    }
}

impl FileStream {
    pub async fn open(path: &Path, mode: &str, cooperative: bool) -> Result<Self, StreamError> {
        let options = OpenMode::parse(mode)?.options();
        let owned = path.to_path_buf();
        let file = if cooperative {
            run_blocking(move || options.open(owned)).await
        } else {
            options.open(owned)
        };
        Ok(Self {
            file: Some(Arc::new(file?)),
            path: path.to_path_buf(),
            cooperative,
            eof: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<Arc<File>, StreamError> {
        self.file.clone().ok_or(StreamError::Closed)
    }
}

#[async_trait]
impl Stream for FileStream {
    fn label(&self) -> &'static str {
        if self.cooperative {
            "plainfile/coroutine"
        } else {
            "plainfile"
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let file = self.file()?;
        let result = if self.cooperative {
            let len = buf.len();
            let (chunk, result) = run_blocking(move || {
                let mut chunk = vec![0u8; len];
                let result = (&*file).read(&mut chunk);
                (chunk, result)
            })
            .await;
            result.map(|n| {
                buf[..n].copy_from_slice(&chunk[..n]);
                n
            })
        } else {
            (&*file).read(buf)
        };
        match result {
            Ok(n) => {
                if n == 0 && !buf.is_empty() {
                    self.eof = true;
                }
                Ok(n)
            }
            Err(e) => {
                self.eof = true;
                Err(e.into())
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        let file = self.file()?;
        let result = if self.cooperative {
            let data = buf.to_vec();
            run_blocking(move || (&*file).write_all(&data).map(|_| data.len())).await
        } else {
            (&*file).write_all(buf).map(|_| buf.len())
        };
        result.map_err(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "file write failed");
            StreamError::from(e)
        })
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        Ok((&*self.file()?).flush()?)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.file = None;
        Ok(())
    }

    fn cast(&self, _as: CastAs) -> Result<RawFd, StreamError> {
        self.file.as_ref().map(|f| f.as_raw_fd()).ok_or(StreamError::Closed)
    }

    fn stat(&self) -> Result<FileStat, StreamError> {
        Ok(fstat(self.cast(CastAs::Fd)?)?)
    }

    async fn set_option(&mut self, option: StreamOption) -> Result<OptionReply, StreamError> {
        match option {
            StreamOption::MetaData => Ok(OptionReply::Meta(StreamMeta {
                eof: self.is_eof(),
                blocked: true,
                ..StreamMeta::default()
            })),
            _ => Err(StreamError::Unsupported("this option on a file stream")),
        }
    }

    fn is_eof(&self) -> bool {
        self.eof || self.file.is_none()
    }
}
