// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `putenv` that is safe to call from concurrent tasks.
//!
//! Environment writes are serialized behind the scope's env lock, and each
//! assignment string stays owned by the scope after the call returns.

use std::sync::Arc;

use super::str_arg;
use crate::error::CallError;
use crate::shared::SharedScope;
use crate::table::Handler;
use crate::value::Value;

/// `KEY=VALUE` sets, a bare `KEY` unsets.
fn parse(setting: &str) -> Result<(&str, Option<&str>), CallError> {
    if setting.is_empty() || setting.starts_with('=') {
        return Err(CallError::invalid(
            "putenv",
            "Argument #1 ($assignment) must have a valid syntax",
        ));
    }
    Ok(match setting.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (setting, None),
    })
}

pub fn putenv(shared: Arc<SharedScope>) -> Handler {
    Handler::new(move |args| {
        let shared = shared.clone();
        async move {
            let setting = str_arg("putenv", &args, 0)?.to_string();
            let (key, value) = parse(&setting)?;
            let _guard = shared.env_lock().lock().await;
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
            shared.keep_env_string(key, setting.clone());
            Ok(Value::Bool(true))
        }
    })
}
