// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded worker: a run queue plus the reactor.
//!
//! One worker per OS thread. `block_on` drives a root future and every task
//! spawned onto the worker; when nothing is runnable the thread sleeps in
//! `epoll_wait` until I/O, a timer, or a cross-thread wake arrives.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use crate::census::{Enrollment, WorkerCensus};

use super::handle::JoinHandle;
use super::reactor::Reactor;
use super::task::{panic_message, RawTask, ResultSlot, ScheduleFn};

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
}

/// State shared between the worker thread, its tasks, and remote wakers.
pub(crate) struct Shared {
    queue: Mutex<VecDeque<Arc<RawTask>>>,
    pub(crate) reactor: Reactor,
    /// Set when the root future of `block_on` has been woken.
    root_woken: AtomicBool,
}

impl Shared {
    fn push(&self, task: Arc<RawTask>) {
        self.queue.lock().unwrap().push_back(task);
        self.reactor.wake();
    }

    fn pop(&self) -> Option<Arc<RawTask>> {
        self.queue.lock().unwrap().pop_front()
    }

    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Cloneable reference to a worker, usable from its tasks.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

impl Handle {
    /// The worker driving the current thread, if any.
    pub fn try_current() -> Option<Handle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.shared.reactor
    }

    /// Spawn a task onto this worker. It runs the next time the worker
    /// thread is inside `block_on`.
    pub fn spawn<T, F>(&self, future: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let result = Arc::new(ResultSlot::<T>::new());
        let slot = result.clone();
        let wrapped = CatchUnwind { inner: Box::pin(future), slot };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let schedule: ScheduleFn = Arc::new(move |task| {
            if let Some(shared) = weak.upgrade() {
                shared.push(task);
            }
        });

        let raw = RawTask::new(Box::pin(wrapped), schedule);
        self.shared.push(raw.clone());
        JoinHandle::new(raw, result)
    }
}

/// Captures the task's output (or its panic) into the result slot.
struct CatchUnwind<T> {
    inner: std::pin::Pin<Box<dyn Future<Output = T> + Send>>,
    slot: Arc<ResultSlot<T>>,
}

impl<T> Future for CatchUnwind<T> {
    type Output = ();

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let polled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.inner.as_mut().poll(cx)
        }));
        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                self.slot.set(Ok(value));
                Poll::Ready(())
            }
            Err(payload) => {
                self.slot.set(Err(panic_message(payload)));
                Poll::Ready(())
            }
        }
    }
}

/// A cooperative worker bound to the thread that calls `block_on`.
pub struct Worker {
    shared: Arc<Shared>,
    _enrollment: Enrollment,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queued", &self.shared.queued())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker enrolled in the process-wide census.
    pub fn new() -> io::Result<Self> {
        Self::with_census(WorkerCensus::global())
    }

    pub fn with_census(census: &WorkerCensus) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            reactor: Reactor::new()?,
            root_woken: AtomicBool::new(true),
        });
        Ok(Self {
            shared,
            _enrollment: census.enroll(),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Spawn onto this worker from outside it.
    pub fn spawn<T, F>(&self, future: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.handle().spawn(future)
    }

    /// Drive `future` to completion on the current thread, running spawned
    /// tasks while it is pending. The root future counts as a task.
    ///
    /// Panics if the thread is already driving a worker.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _enter = Enter::new(self.handle());
        let mut root = pin!(future);
        let root_waker = Waker::from(Arc::new(RootWaker {
            shared: Arc::downgrade(&self.shared),
        }));
        let mut cx = Context::from_waker(&root_waker);
        self.shared.root_woken.store(true, Ordering::Release);

        loop {
            if self.shared.root_woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(out) = in_task_scope(|| root.as_mut().poll(&mut cx)) {
                    return out;
                }
            }

            // Bound the batch so the root gets a turn between tasks
            // that keep re-waking each other.
            let batch = self.shared.queued();
            for _ in 0..batch {
                let Some(task) = self.shared.pop() else {
                    break;
                };
                in_task_scope(|| task.run());
            }

            if self.shared.root_woken.load(Ordering::Acquire) || self.shared.queued() > 0 {
                continue;
            }

            if let Err(e) = self.shared.reactor.poll_once(None) {
                tracing::warn!(%e, "reactor poll failed");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Break Arc cycles between parked tasks and the reactor they sit in.
        let queued = std::mem::take(&mut *self.shared.queue.lock().unwrap());
        drop(queued);
        self.shared.reactor.clear();
    }
}

struct RootWaker {
    shared: Weak<Shared>,
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.root_woken.store(true, Ordering::Release);
            shared.reactor.wake();
        }
    }
}

/// Installs the thread's current worker for the duration of `block_on`.
struct Enter {
    prev_in_task: bool,
}

impl Enter {
    fn new(handle: Handle) -> Self {
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            assert!(
                cur.is_none(),
                "cannot start a worker from within another worker's thread"
            );
            *cur = Some(handle);
        });
        Self {
            prev_in_task: IN_TASK.with(|t| t.get()),
        }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
        IN_TASK.with(|t| t.set(self.prev_in_task));
    }
}

fn in_task_scope<R>(f: impl FnOnce() -> R) -> R {
    let prev = IN_TASK.with(|t| t.replace(true));
    let out = f();
    IN_TASK.with(|t| t.set(prev));
    out
}

/// True while the current thread is polling a task on a worker.
pub fn in_task() -> bool {
    IN_TASK.with(|t| t.get())
}

/// Spawn onto the worker driving this thread.
///
/// Panics when called outside a worker.
pub fn spawn<T, F>(future: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    match Handle::try_current() {
        Some(handle) => handle.spawn(future),
        None => panic!("spawn called outside a worker context"),
    }
}

/// Run a future to completion by parking the calling thread between polls.
///
/// No worker is installed, so `in_task()` stays false inside it. This is the
/// entry point for callers that have no cooperative context.
pub fn block_on<F: Future>(future: F) -> F::Output {
    struct Parker(std::thread::Thread);
    impl Wake for Parker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(Parker(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
            return out;
        }
        std::thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn block_on_runs_spawned_tasks() {
        let census = WorkerCensus::new();
        let worker = Worker::with_census(&census).unwrap();
        assert_eq!(census.active(), 1);

        let out = worker.block_on(async {
            let a = spawn(async { 20 });
            let b = spawn(async { 22 });
            a.await.unwrap() + b.await.unwrap()
        });
        assert_eq!(out, 42);

        drop(worker);
        assert_eq!(census.active(), 0);
    }

    #[test]
    fn in_task_only_while_polling() {
        assert!(!in_task());
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let inside = worker.block_on(async { in_task() });
        assert!(inside);
        assert!(!in_task());
        assert!(Handle::try_current().is_none());
    }

    #[test]
    fn parker_block_on_is_not_a_task() {
        assert!(!block_on(async { in_task() }));
    }

    #[test]
    fn panicking_task_reports_join_error() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let err = worker
            .block_on(async { spawn(async { panic!("boom") }).await })
            .map(|()| ())
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn tasks_spawned_before_block_on_run() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let join = worker.spawn(async move {
            h.fetch_add(1, Ordering::AcqRel);
        });
        worker.block_on(join).unwrap();
        assert_eq!(hits.load(Ordering::Acquire), 1);
    }
}
