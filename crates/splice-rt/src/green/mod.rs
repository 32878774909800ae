// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green tasks on a single-threaded worker.
//!
//! Components:
//! - `task`    — task struct, state machine, waker
//! - `reactor` — epoll readiness plus timers
//! - `worker`  — run queue, `block_on`, `spawn`, `in_task`
//! - `io`      — readiness futures and multi-fd polling
//! - `handle`  — awaitable join handles

pub mod handle;
pub mod io;
pub mod reactor;
pub mod task;
pub mod worker;
