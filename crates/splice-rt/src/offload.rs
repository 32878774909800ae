// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run blocking work off the worker thread.
//!
//! The closure runs on a helper thread; the awaiting task is parked until
//! the helper stores its result. Used for calls with no non-blocking
//! counterpart: name resolution, regular-file I/O, `waitpid`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::green::worker::in_task;

struct Slot<T> {
    value: Option<std::thread::Result<T>>,
    waker: Option<Waker>,
}

/// Run `f` without blocking the current task.
///
/// Outside a task there is nothing to keep responsive, so `f` simply runs
/// inline.
pub async fn run_blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if !in_task() {
        return f();
    }

    let slot = Arc::new(Mutex::new(Slot {
        value: None,
        waker: None,
    }));
    let helper_slot = slot.clone();
    std::thread::spawn(move || {
        let value = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        let waker = {
            let mut s = helper_slot.lock().unwrap();
            s.value = Some(value);
            s.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    });

    match (Offloaded { slot }).await {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

struct Offloaded<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Future for Offloaded<T> {
    type Output = std::thread::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut s = self.slot.lock().unwrap();
        match s.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                s.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::WorkerCensus;
    use crate::green::worker::{spawn, Worker};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_inline_outside_task() {
        let here = std::thread::current().id();
        let there = crate::block_on(run_blocking(move || std::thread::current().id()));
        assert_eq!(here, there);
    }

    #[test]
    fn blocking_call_does_not_stall_worker() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let ticked = Arc::new(AtomicBool::new(false));
        let t = ticked.clone();

        let saw_tick = worker.block_on(async move {
            let ticker = spawn(async move {
                t.store(true, Ordering::Release);
            });
            let observed = ticked.clone();
            let saw = run_blocking(move || {
                std::thread::sleep(Duration::from_millis(20));
                observed.load(Ordering::Acquire)
            })
            .await;
            ticker.await.unwrap();
            saw
        });
        assert!(saw_tick);
    }
}
