// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `gethostbyname` without stalling the worker.

use splice_rt::in_task;
use splice_rt::net::resolve;

use super::str_arg;
use crate::table::Handler;
use crate::value::Value;

/// Resolves to the first IPv4 address. Like the original, a name that
/// does not resolve comes back unchanged.
pub fn gethostbyname(original: Handler) -> Handler {
    Handler::new(move |args| {
        let original = original.clone();
        async move {
            if !in_task() {
                return original.call(args).await;
            }
            let host = str_arg("gethostbyname", &args, 0)?.to_string();
            match resolve(&host, 0, false).await {
                Ok(addr) => Ok(Value::Str(addr.ip().to_string())),
                Err(e) => {
                    tracing::debug!(host = %host, error = %e, "name did not resolve");
                    Ok(Value::Str(host))
                }
            }
        }
    })
}
