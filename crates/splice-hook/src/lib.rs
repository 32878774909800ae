// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reversible cooperative hooks over a host routine table.
//!
//! A [`HookContext`] redirects blocking routines (sleep, sockets, files,
//! child processes, the HTTP client) to task-aware versions, one category
//! per [`FeatureFlagSet`] bit, and puts every original back when the bit
//! is cleared. Socket transports are served by [`stream::SocketStream`],
//! which runs a cooperative socket behind the classic stream contract.

pub mod catalog;
pub mod classes;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod flags;
pub mod ops;
pub mod registry;
pub mod routines;
pub mod shared;
pub mod signature;
pub mod stream;
pub mod table;
pub mod transport;
pub mod value;

pub use config::HookConfig;
pub use context::HookContext;
pub use engine::{Diagnostic, Transition};
pub use error::{CallError, Contention, HookError, StreamError};
pub use flags::FeatureFlagSet;
pub use registry::{Callable, HookRegistry};
pub use shared::{Host, SharedScope};
pub use signature::{Param, Signature, TypeRef};
pub use table::{Handler, RoutineTable};
pub use value::Value;
