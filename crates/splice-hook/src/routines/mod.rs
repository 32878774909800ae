// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Replacement routines and the per-category install plans.
//!
//! Routines with by-reference parameters return a map: `"return"` holds
//! the routine's result and every other key the new value of the
//! parameter with that name.

pub mod companion;
pub mod env;
pub mod proc;
pub mod resolve;
pub mod select;
pub mod sleep;

use std::sync::Arc;

use indexmap::IndexMap;

use crate::catalog;
use crate::classes::ClassLinks;
use crate::error::{CallError, HookError};
use crate::flags::FeatureFlagSet;
use crate::registry::HookRegistry;
use crate::shared::SharedScope;
use crate::signature::{Signature, TypeRef};
use crate::table::{Handler, RoutineTable};
use crate::value::Value;

/// One routine a category is about to redirect.
pub(crate) struct Planned {
    pub name: &'static str,
    pub original: Handler,
    pub handler: Handler,
    /// Signature to bind instead of the original's.
    pub signature: Option<Arc<Signature>>,
}

/// How a category's routines are replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    /// A cooperative implementation in this crate.
    Builtin,
    /// A companion routine under the script prefix, used inside tasks.
    Script,
    /// A companion routine under the native prefix, bound with its own
    /// signature.
    Native,
}

fn category(flag: FeatureFlagSet) -> Vec<(&'static str, Form)> {
    let with = |names: &'static [&'static str], form| names.iter().map(move |n| (*n, form));
    match flag {
        FeatureFlagSet::STREAM_FUNCTION => with(catalog::STREAM_FUNCTION, Form::Builtin).collect(),
        FeatureFlagSet::SLEEP => with(catalog::SLEEP, Form::Builtin).collect(),
        FeatureFlagSet::PROC => with(catalog::PROC, Form::Builtin).collect(),
        FeatureFlagSet::BLOCKING_FUNCTION => with(catalog::BLOCKING_NATIVE, Form::Builtin)
            .chain(with(catalog::BLOCKING_SCRIPT, Form::Script))
            .collect(),
        FeatureFlagSet::SOCKETS => with(catalog::SOCKET, Form::Script).collect(),
        FeatureFlagSet::HTTP_NATIVE => with(catalog::HTTP_NATIVE, Form::Native).collect(),
        FeatureFlagSet::HTTP_SCRIPT => with(catalog::HTTP_SCRIPT, Form::Script).collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn class_link(flag: FeatureFlagSet) -> Option<(&'static str, &'static str)> {
    match flag {
        FeatureFlagSet::SOCKETS => Some(catalog::SOCKET_CLASS_LINK),
        FeatureFlagSet::HTTP_NATIVE | FeatureFlagSet::HTTP_SCRIPT => Some(catalog::HTTP_CLASS_LINK),
        _ => None,
    }
}

fn builtin(name: &str, original: Handler, shared: &Arc<SharedScope>) -> Option<Handler> {
    let config = shared.config();
    Some(match name {
        "sleep" | "usleep" | "time_nanosleep" | "time_sleep_until" => {
            sleep::handler(name, original)?
        }
        "stream_select" => select::stream_select(original),
        "stream_socket_pair" => select::stream_socket_pair(original, config.socket_timeout),
        "proc_open" | "proc_close" | "proc_get_status" | "proc_terminate" => {
            proc::handler(name, original, config.proc_poll)?
        }
        "gethostbyname" => resolve::gethostbyname(original),
        _ => return None,
    })
}

/// Look up everything `flag` needs before touching the table, so a missing
/// routine leaves the category untouched.
pub(crate) fn plan(
    flag: FeatureFlagSet,
    table: &RoutineTable,
    registry: &HookRegistry,
    shared: &Arc<SharedScope>,
) -> Result<Vec<Planned>, HookError> {
    let mut planned = Vec::new();
    for (name, form) in category(flag) {
        let original = registry
            .lookup_original(table, name)
            .ok_or_else(|| HookError::HookNotFound(name.to_string()))?;
        let (handler, signature) = match form {
            Form::Builtin => (
                builtin(name, original.clone(), shared)
                    .ok_or_else(|| HookError::HookNotFound(name.to_string()))?,
                None,
            ),
            Form::Script => {
                let companion_name = catalog::script_companion(name);
                let companion = table
                    .get(&companion_name)
                    .ok_or(HookError::HookNotFound(companion_name))?;
                (companion::dispatcher(original.clone(), companion.handler.clone()), None)
            }
            Form::Native => {
                let companion_name = catalog::native_companion(name);
                let companion = table
                    .get(&companion_name)
                    .ok_or(HookError::HookNotFound(companion_name))?;
                (companion.handler.clone(), Some(companion.signature.clone()))
            }
        };
        planned.push(Planned {
            name,
            original,
            handler,
            signature,
        });
    }
    Ok(planned)
}

/// Redirect every routine in `flag`'s category. Nothing is changed unless
/// every lookup succeeds.
pub(crate) fn install(
    flag: FeatureFlagSet,
    table: &mut RoutineTable,
    registry: &mut HookRegistry,
    classes: &mut ClassLinks,
    shared: &Arc<SharedScope>,
    is_primary: bool,
) -> Result<(), HookError> {
    let planned = plan(flag, table, registry, shared)?;
    if let Some((child, parent)) = class_link(flag) {
        classes.attach(child, parent)?;
    }
    for p in planned {
        if is_primary {
            shared.record_original(p.name, &p.original);
        }
        registry.register(table, p.name, p.handler, p.signature.as_deref())?;
    }
    Ok(())
}

pub(crate) fn uninstall(
    flag: FeatureFlagSet,
    table: &mut RoutineTable,
    registry: &mut HookRegistry,
    classes: &mut ClassLinks,
) {
    for (name, _) in category(flag) {
        registry.restore(table, name);
    }
    if let Some((child, _)) = class_link(flag) {
        classes.detach(child);
    }
}

/// Bound in place of routines that must not run under a scheduler.
pub(crate) fn disabled(name: &str) -> (Handler, Signature) {
    let routine = name.to_string();
    let handler = Handler::sync(move |_| {
        tracing::warn!(routine = %routine, "call to a routine disabled for security reasons");
        Err(CallError::Disabled(routine.clone()))
    });
    (handler, Signature::new(Vec::new(), TypeRef::Any))
}

/// Result of a routine that also rewrites by-reference arguments.
pub fn with_refs(result: Value, refs: Vec<(&str, Value)>) -> Value {
    let mut map = IndexMap::new();
    map.insert("return".to_string(), result);
    for (name, value) in refs {
        map.insert(name.to_string(), value);
    }
    Value::Map(map)
}

pub(crate) fn arg<'a>(args: &'a [Value], index: usize) -> &'a Value {
    args.get(index).unwrap_or(&Value::Null)
}

pub(crate) fn int_arg(routine: &str, args: &[Value], index: usize) -> Result<i64, CallError> {
    arg(args, index)
        .as_int()
        .ok_or_else(|| {
            CallError::invalid(routine, format!("argument #{} must be of type int", index + 1))
        })
}

pub(crate) fn float_arg(routine: &str, args: &[Value], index: usize) -> Result<f64, CallError> {
    arg(args, index)
        .as_float()
        .ok_or_else(|| {
            CallError::invalid(routine, format!("argument #{} must be of type float", index + 1))
        })
}

pub(crate) fn str_arg<'a>(
    routine: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a str, CallError> {
    arg(args, index)
        .as_str()
        .ok_or_else(|| {
            CallError::invalid(routine, format!("argument #{} must be of type string", index + 1))
        })
}
