// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Dispatch between a routine's original and its companion.

use splice_rt::in_task;

use crate::table::Handler;

/// Handler that runs `companion` inside a task and `original` everywhere
/// else.
pub fn dispatcher(original: Handler, companion: Handler) -> Handler {
    Handler::new(move |args| {
        if in_task() {
            companion.call(args)
        } else {
            original.call(args)
        }
    })
}
