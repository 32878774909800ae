// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep and timeout.
//!
//! Inside a worker, timers live in the reactor and suspend only the calling
//! task. On a plain thread the same futures block the OS thread.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::green::reactor::TimerKey;
use crate::green::worker::Handle;

/// Furthest deadline a timer is armed for. Longer waits are clamped here.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, or `None` when the sum does not fit in an [`Instant`].
/// Callers treat `None` as "no deadline".
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn far_future() -> Instant {
    let now = Instant::now();
    now.checked_add(FAR_FUTURE).unwrap_or(now)
}

/// Suspend the current task for `duration`. Durations past the far-future
/// horizon are clamped to it.
pub fn sleep(duration: Duration) -> Sleep {
    let deadline = match deadline_after(duration.min(FAR_FUTURE)) {
        Some(d) => d,
        None => far_future(),
    };
    sleep_until(deadline)
}

/// Suspend the current task until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        timer: None,
    }
}

/// Timer future returned by [`sleep`] and [`sleep_until`].
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    timer: Option<(Handle, TimerKey)>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_elapsed() {
            if let Some((handle, key)) = self.timer.take() {
                handle.reactor().cancel_timer(key);
            }
            return Poll::Ready(());
        }

        let Some(handle) = Handle::try_current() else {
            std::thread::sleep(self.deadline.saturating_duration_since(Instant::now()));
            return Poll::Ready(());
        };
        if let Some((old, key)) = self.timer.take() {
            old.reactor().cancel_timer(key);
        }
        let key = handle.reactor().add_timer(self.deadline, cx.waker().clone());
        self.timer = Some((handle, key));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((handle, key)) = self.timer.take() {
            handle.reactor().cancel_timer(key);
        }
    }
}

/// Timeout error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for Elapsed {}

/// Race `future` against a timer. Returns `Err(Elapsed)` if the timer wins.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, Elapsed> {
    Timeout {
        future: Box::pin(future),
        sleep: sleep(duration),
    }
    .await
}

struct Timeout<F: Future> {
    future: Pin<Box<F>>,
    sleep: Sleep,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(out) = self.future.as_mut().poll(cx) {
            return Poll::Ready(Ok(out));
        }
        // Never fall through to Sleep's blocking path here.
        if self.sleep.is_elapsed() {
            return Poll::Ready(Err(Elapsed));
        }
        if Handle::try_current().is_none() {
            // No reactor: the inner future has already blocked as long as
            // it is going to.
            return Poll::Pending;
        }
        match Pin::new(&mut self.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::WorkerCensus;
    use crate::green::worker::{spawn, Worker};
    use std::sync::{Arc, Mutex};

    #[test]
    fn sleep_blocks_thread_outside_worker() {
        let start = Instant::now();
        crate::block_on(sleep(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn sleeping_task_lets_others_run() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = log.clone();
        let l2 = log.clone();
        worker.block_on(async move {
            let slow = spawn(async move {
                sleep(Duration::from_millis(30)).await;
                l1.lock().unwrap().push("slow");
            });
            let fast = spawn(async move {
                sleep(Duration::from_millis(5)).await;
                l2.lock().unwrap().push("fast");
            });
            slow.await.unwrap();
            fast.await.unwrap();
        });

        assert_eq!(*log.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[test]
    fn timeout_elapses() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let out = worker.block_on(timeout(
            Duration::from_millis(5),
            sleep(Duration::from_secs(5)),
        ));
        assert_eq!(out, Err(Elapsed));
    }

    #[test]
    fn huge_durations_clamp_instead_of_overflowing() {
        let s = sleep(Duration::MAX);
        assert!(s.deadline() > Instant::now() + Duration::from_secs(86_400 * 365));
        assert!(!s.is_elapsed());
        assert_eq!(deadline_after(Duration::MAX), None);
        assert!(deadline_after(Duration::from_secs(1)).is_some());

        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let out = worker.block_on(timeout(Duration::from_millis(5), sleep(Duration::MAX)));
        assert_eq!(out, Err(Elapsed));
        let out = worker.block_on(timeout(Duration::MAX, async { 3 }));
        assert_eq!(out, Ok(3));
    }

    #[test]
    fn timeout_completes() {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let out = worker.block_on(timeout(Duration::from_secs(5), async { 7 }));
        assert_eq!(out, Ok(7));
    }
}
