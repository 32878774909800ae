// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Process-wide stream-op tables: how plain files are opened and how raw
//! descriptors (stdio, pipes) are wrapped.

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::StreamError;
use crate::stream::fd::FdStream;
use crate::stream::file::FileStream;
use crate::stream::{StreamCell, StreamRef};

type OpenFn =
    dyn Fn(PathBuf, String) -> BoxFuture<'static, Result<StreamRef, StreamError>> + Send + Sync;

/// Opener for the plain-file wrapper.
#[derive(Clone)]
pub struct FileOps {
    name: &'static str,
    open: Arc<OpenFn>,
}

impl FileOps {
    pub fn new<F>(name: &'static str, open: F) -> Self
    where
        F: Fn(PathBuf, String) -> BoxFuture<'static, Result<StreamRef, StreamError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            open: Arc::new(open),
        }
    }

    pub fn plain() -> Self {
        Self::with_mode("plainfile", false)
    }

    /// Offloads every syscall so a task never stalls its worker.
    pub fn cooperative() -> Self {
        Self::with_mode("plainfile/coroutine", true)
    }

    fn with_mode(name: &'static str, cooperative: bool) -> Self {
        Self::new(name, move |path, mode| {
            async move {
                let stream = FileStream::open(&path, &mode, cooperative).await?;
                Ok(StreamCell::new(stream))
            }
            .boxed()
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn open(&self, path: &Path, mode: &str) -> Result<StreamRef, StreamError> {
        (self.open)(path.to_path_buf(), mode.to_string()).await
    }

    pub fn ptr_eq(&self, other: &FileOps) -> bool {
        Arc::ptr_eq(&self.open, &other.open)
    }
}

impl fmt::Debug for FileOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileOps({})", self.name)
    }
}

type AdoptFn = dyn Fn(RawFd) -> Result<StreamRef, StreamError> + Send + Sync;

/// Wraps descriptors the process already has open, without taking
/// ownership of them.
#[derive(Clone)]
pub struct StdioOps {
    name: &'static str,
    adopt: Arc<AdoptFn>,
}

impl StdioOps {
    pub fn new<F>(name: &'static str, adopt: F) -> Self
    where
        F: Fn(RawFd) -> Result<StreamRef, StreamError> + Send + Sync + 'static,
    {
        Self {
            name,
            adopt: Arc::new(adopt),
        }
    }

    pub fn plain() -> Self {
        Self::with_mode("STDIO", false)
    }

    pub fn cooperative() -> Self {
        Self::with_mode("STDIO/coroutine", true)
    }

    fn with_mode(name: &'static str, cooperative: bool) -> Self {
        Self::new(name, move |fd| Ok(StreamCell::new(FdStream::borrowed(fd, cooperative)?)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn adopt(&self, fd: RawFd) -> Result<StreamRef, StreamError> {
        (self.adopt)(fd)
    }

    pub fn ptr_eq(&self, other: &StdioOps) -> bool {
        Arc::ptr_eq(&self.adopt, &other.adopt)
    }
}

impl fmt::Debug for StdioOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StdioOps({})", self.name)
    }
}

#[derive(Debug, Clone)]
pub struct OpsTables {
    pub file: FileOps,
    pub stdio: StdioOps,
}

impl Default for OpsTables {
    fn default() -> Self {
        Self {
            file: FileOps::plain(),
            stdio: StdioOps::plain(),
        }
    }
}

/// Tables displaced by the FILE and STDIO hooks.
#[derive(Debug, Default)]
pub struct OpsHooks {
    file: Option<FileOps>,
    stdio: Option<StdioOps>,
}

impl OpsHooks {
    pub fn hook_file(&mut self, tables: &mut OpsTables) {
        if self.file.is_none() {
            self.file = Some(std::mem::replace(&mut tables.file, FileOps::cooperative()));
            tracing::debug!("file ops hooked");
        }
    }

    pub fn unhook_file(&mut self, tables: &mut OpsTables) {
        if let Some(saved) = self.file.take() {
            tables.file = saved;
            tracing::debug!("file ops restored");
        }
    }

    pub fn hook_stdio(&mut self, tables: &mut OpsTables) {
        if self.stdio.is_none() {
            self.stdio = Some(std::mem::replace(&mut tables.stdio, StdioOps::cooperative()));
            tracing::debug!("stdio ops hooked");
        }
    }

    pub fn unhook_stdio(&mut self, tables: &mut OpsTables) {
        if let Some(saved) = self.stdio.take() {
            tables.stdio = saved;
            tracing::debug!("stdio ops restored");
        }
    }

    pub fn is_file_hooked(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_stdio_hooked(&self) -> bool {
        self.stdio.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_restore_the_exact_tables() {
        let mut tables = OpsTables::default();
        let file = tables.file.clone();
        let stdio = tables.stdio.clone();
        let mut hooks = OpsHooks::default();

        hooks.hook_file(&mut tables);
        hooks.hook_file(&mut tables);
        hooks.hook_stdio(&mut tables);
        assert_eq!(tables.file.name(), "plainfile/coroutine");
        assert_eq!(tables.stdio.name(), "STDIO/coroutine");

        hooks.unhook_file(&mut tables);
        hooks.unhook_stdio(&mut tables);
        hooks.unhook_stdio(&mut tables);
        assert!(tables.file.ptr_eq(&file));
        assert!(tables.stdio.ptr_eq(&stdio));
        assert!(!hooks.is_file_hooked() && !hooks.is_stdio_hooked());
    }

    #[test]
    fn plain_opener_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let ops = FileOps::plain();
        let (label, data) = splice_rt::block_on(async {
            let stream = ops.open(&path, "r").await.unwrap();
            (stream.label(), stream.read(8).await.unwrap())
        });
        assert_eq!((label, data), ("plainfile", b"abc".to_vec()));
    }
}
