// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Join handles for green tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::task::{RawTask, ResultSlot, TaskState};

/// Error returned when awaiting a task that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Task panicked with the given message.
    Panicked(String),
    /// The worker was dropped before the task finished.
    Abandoned,
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            JoinError::Abandoned => write!(f, "task was abandoned by its worker"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Awaitable handle to a spawned task. Dropping it detaches the task.
pub struct JoinHandle<T> {
    raw: Arc<RawTask>,
    result: Arc<ResultSlot<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(raw: Arc<RawTask>, result: Arc<ResultSlot<T>>) -> Self {
        Self { raw, result }
    }

    pub fn is_finished(&self) -> bool {
        self.raw.state() == TaskState::Complete
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle").field("task", &self.raw).finish()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.raw.state() == TaskState::Complete {
            return Poll::Ready(match self.result.take() {
                Some(Ok(val)) => Ok(val),
                Some(Err(msg)) => Err(JoinError::Panicked(msg)),
                None => Err(JoinError::Abandoned),
            });
        }
        // Woken by mark_complete on the target task.
        self.raw.register_join_waker(cx.waker().clone());
        Poll::Pending
    }
}
