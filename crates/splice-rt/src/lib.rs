// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative runtime for the splice hook layer.
//!
//! A worker is one OS thread running stackless tasks over an epoll reactor.
//! Code inside a task can suspend on sockets, timers, or offloaded blocking
//! calls without stalling the thread; the same primitives block the thread
//! when called from outside any worker.
//!
//! Components:
//! - census — count of live workers
//! - green — task, reactor, worker, readiness waits
//! - timeout — sleep/timeout
//! - offload — run blocking closures on a helper thread
//! - net/socket — addresses and the cooperative socket
//! - tls — pluggable secure-channel seam

pub mod census;
pub mod green;
pub mod net;
pub mod offload;
pub mod socket;
pub mod timeout;
pub mod tls;

pub use census::WorkerCensus;
pub use green::handle::{JoinError, JoinHandle};
pub use green::io::{poll_fds, wait_fd, PollFd, PollReady};
pub use green::reactor::Interest;
pub use green::worker::{block_on, in_task, spawn, Handle, Worker};
pub use offload::run_blocking;
pub use socket::{CoSocket, PartialWrite, SocketKind, Timeouts};
pub use timeout::{deadline_after, sleep, sleep_until, timeout, Elapsed};
