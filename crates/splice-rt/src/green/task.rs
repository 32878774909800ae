// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green task representation.
//!
//! Stackless tasks: a boxed future plus a small atomic state machine.
//! The worker owns the polling loop; wakers only move a task back onto
//! the worker's queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, waiting to be polled.
    Ready = 0,
    /// Currently being polled by the worker.
    Running = 1,
    /// Parked on I/O or a timer.
    Waiting = 2,
    /// Woken while running; must be polled again.
    Notified = 3,
    /// Finished (result stored).
    Complete = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Notified,
            _ => Self::Complete,
        }
    }
}

/// Type-erased future. The typed output is written to a `ResultSlot`
/// by the wrapping future.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Re-enqueue callback installed by the owning worker.
pub(crate) type ScheduleFn = Arc<dyn Fn(Arc<RawTask>) + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct TaskHeader {
    pub id: u64,
    pub state: AtomicU8,
    pub schedule_fn: ScheduleFn,
    /// Tasks awaiting our `JoinHandle`.
    pub join_wakers: Mutex<Vec<Waker>>,
}

pub(crate) struct RawTask {
    pub header: TaskHeader,
    pub future: Mutex<Option<BoxFuture>>,
}

impl std::fmt::Debug for RawTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.header.id)
            .field("state", &self.state())
            .finish()
    }
}

impl RawTask {
    pub fn new(future: BoxFuture, schedule_fn: ScheduleFn) -> Arc<Self> {
        Arc::new(Self {
            header: TaskHeader {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(TaskState::Ready as u8),
                schedule_fn,
                join_wakers: Mutex::new(Vec::new()),
            },
            future: Mutex::new(Some(future)),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.header.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: TaskState, to: TaskState) -> bool {
        self.header
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Poll the future once and settle the state. Returns true when the
    /// task completed.
    pub fn run(self: &Arc<Self>) -> bool {
        if !self.cas(TaskState::Ready, TaskState::Running) {
            return self.state() == TaskState::Complete;
        }

        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let done = {
            let mut slot = self.future.lock().unwrap();
            match slot.as_mut() {
                None => true,
                Some(fut) => match fut.as_mut().poll(&mut cx) {
                    Poll::Ready(()) => {
                        *slot = None;
                        true
                    }
                    Poll::Pending => false,
                },
            }
        };

        if done {
            self.mark_complete();
            return true;
        }

        if !self.cas(TaskState::Running, TaskState::Waiting) {
            // Woken mid-poll: go straight back on the queue.
            self.header
                .state
                .store(TaskState::Ready as u8, Ordering::Release);
            (self.header.schedule_fn)(self.clone());
        }
        false
    }

    pub fn mark_complete(&self) {
        self.header
            .state
            .store(TaskState::Complete as u8, Ordering::Release);
        let wakers = std::mem::take(&mut *self.header.join_wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn register_join_waker(&self, waker: Waker) {
        let mut wakers = self.header.join_wakers.lock().unwrap();
        // Re-check under the lock so a completion between the caller's
        // state check and here is not missed.
        if self.state() == TaskState::Complete {
            drop(wakers);
            waker.wake();
            return;
        }
        if !wakers.iter().any(|w| w.will_wake(&waker)) {
            wakers.push(waker);
        }
    }
}

struct TaskWaker {
    task: Arc<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let task = &self.task;
        if task.cas(TaskState::Waiting, TaskState::Ready) {
            (task.header.schedule_fn)(task.clone());
        } else {
            task.cas(TaskState::Running, TaskState::Notified);
        }
    }
}

/// Typed result slot shared between the spawned future and its handle.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<Result<T, String>>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, result: Result<T, String>) {
        *self.inner.lock().unwrap() = Some(result);
    }

    pub fn take(&self) -> Option<Result<T, String>> {
        self.inner.lock().unwrap().take()
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_schedule() -> (Arc<AtomicUsize>, ScheduleFn) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Arc::new(move |_t| {
            h.fetch_add(1, Ordering::AcqRel);
        }))
    }

    #[test]
    fn ready_future_completes_in_one_run() {
        let (_hits, schedule) = counting_schedule();
        let task = RawTask::new(Box::pin(async {}), schedule);
        assert!(task.run());
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[test]
    fn self_wake_during_poll_requeues() {
        struct YieldOnce(bool);
        impl Future for YieldOnce {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.0 {
                    return Poll::Ready(());
                }
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }

        let (hits, schedule) = counting_schedule();
        let task = RawTask::new(Box::pin(YieldOnce(false)), schedule);
        assert!(!task.run());
        assert_eq!(hits.load(Ordering::Acquire), 1);
        assert_eq!(task.state(), TaskState::Ready);
        assert!(task.run());
    }

    #[test]
    fn panic_message_downcasts() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload), "boom");
    }
}
