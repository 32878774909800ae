// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types, one enum per layer.

use std::fmt;
use std::io;

use thiserror::Error;

/// Who else might be touching shared hook state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// More than one worker is alive.
    Workers(usize),
    /// The request came from a secondary context.
    SecondaryContext,
}

impl fmt::Display for Contention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contention::Workers(n) => write!(f, "{} workers are active", n),
            Contention::SecondaryContext => write!(f, "only the primary context may change it"),
        }
    }
}

/// Registry and transition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("routine `{0}` is not defined in the routine table")]
    HookNotFound(String),

    #[error("cannot change `{category}` hooks: {contention}")]
    ConcurrentMutationRejected {
        category: &'static str,
        contention: Contention,
    },

    #[error("transport `{scheme}` refused the factory: {reason}")]
    TransportRegistrationConflict { scheme: String, reason: String },

    #[error("no `{0}` driver is registered")]
    DriverUnavailable(&'static str),

    #[error("driver `{driver}` could not switch mode: {reason}")]
    DriverToggleFailed { driver: &'static str, reason: String },

    #[error("`{dropped}` cannot be enabled together with `{kept}`")]
    ExclusiveCategories {
        kept: &'static str,
        dropped: &'static str,
    },

    #[error("class `{0}` is not defined")]
    ClassNotFound(String),
}

/// Failures surfaced by the generic stream contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("socket error {code}: {message}")]
    Socket { code: i32, message: String },

    /// No progress this time; the caller may retry.
    #[error("operation would block")]
    WouldBlock { timed_out: bool },

    #[error("unexpected end of stream")]
    Eof,

    #[error("stream is closed")]
    Closed,

    #[error("failed to set up secure channel: {0}")]
    CryptoSetupFailed(String),

    #[error("unable to find the socket transport `{0}`")]
    UnknownTransport(String),

    #[error("{0} is not supported by this stream")]
    Unsupported(&'static str),

    #[error("{0}")]
    InvalidArgument(String),
}

impl StreamError {
    pub fn from_io(err: &io::Error) -> Self {
        StreamError::Socket {
            code: splice_rt::socket::error_code(err),
            message: err.to_string(),
        }
    }

    /// OS error code, for socket failures.
    pub fn code(&self) -> Option<i32> {
        match self {
            StreamError::Socket { code, .. } => Some(*code),
            StreamError::WouldBlock { timed_out: true } => Some(libc::ETIMEDOUT),
            _ => None,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, StreamError::WouldBlock { .. })
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::from_io(&err)
    }
}

/// Failures of a routine call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("call to undefined routine `{0}`")]
    Undefined(String),

    #[error("{0}() has been disabled for security reasons")]
    Disabled(String),

    #[error("{routine}(): {message}")]
    InvalidArgument { routine: String, message: String },

    #[error("{routine}(): {source}")]
    Stream {
        routine: String,
        #[source]
        source: StreamError,
    },

    #[error("{routine}(): {message}")]
    Failed { routine: String, message: String },
}

impl CallError {
    pub fn invalid(routine: &str, message: impl Into<String>) -> Self {
        CallError::InvalidArgument {
            routine: routine.to_string(),
            message: message.into(),
        }
    }

    pub fn failed(routine: &str, message: impl Into<String>) -> Self {
        CallError::Failed {
            routine: routine.to_string(),
            message: message.into(),
        }
    }

    pub fn stream(routine: &str, source: StreamError) -> Self {
        CallError::Stream {
            routine: routine.to_string(),
            source,
        }
    }
}
