// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The host's routine table: name → handler + signature.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;

use crate::error::{CallError, HookError};
use crate::signature::Signature;
use crate::value::Value;

pub type RoutineFuture = BoxFuture<'static, Result<Value, CallError>>;

type HandlerFn = dyn Fn(Vec<Value>) -> RoutineFuture + Send + Sync;

/// A routine implementation. Cheap to clone; identity is the allocation.
#[derive(Clone)]
pub struct Handler {
    f: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// Handler that completes without suspending.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(move |args| futures::future::ready(f(args)).boxed()),
        }
    }

    pub fn call(&self, args: Vec<Value>) -> RoutineFuture {
        (self.f)(args)
    }

    pub fn ptr_eq(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.f) as *const ())
    }
}

/// One routine as currently bound in the table.
#[derive(Debug, Clone)]
pub struct Routine {
    pub handler: Handler,
    pub signature: Arc<Signature>,
}

/// Lookup/rebind table for named routines.
#[derive(Debug, Clone, Default)]
pub struct RoutineTable {
    routines: IndexMap<String, Routine>,
}

impl RoutineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a routine.
    pub fn define(&mut self, name: &str, handler: Handler, signature: Signature) {
        self.routines.insert(
            name.to_string(),
            Routine {
                handler,
                signature: Arc::new(signature),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Routine> {
        self.routines.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Swap in a new binding, returning the old one.
    pub fn rebind(
        &mut self,
        name: &str,
        handler: Handler,
        signature: Arc<Signature>,
    ) -> Result<Routine, HookError> {
        let slot = self
            .routines
            .get_mut(name)
            .ok_or_else(|| HookError::HookNotFound(name.to_string()))?;
        Ok(std::mem::replace(slot, Routine { handler, signature }))
    }

    /// Dispatch by name to whatever is currently bound.
    pub fn call(&self, name: &str, args: Vec<Value>) -> RoutineFuture {
        match self.routines.get(name) {
            Some(routine) => routine.handler.call(args),
            None => futures::future::ready(Err(CallError::Undefined(name.to_string()))).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(v: i64) -> Handler {
        Handler::sync(move |_| Ok(Value::Int(v)))
    }

    #[test]
    fn call_dispatches_to_current_binding() {
        let mut table = RoutineTable::new();
        table.define("answer", constant(1), Signature::any());
        assert_eq!(splice_rt::block_on(table.call("answer", vec![])), Ok(Value::Int(1)));

        let old = table
            .rebind("answer", constant(2), Arc::new(Signature::any()))
            .unwrap();
        assert_eq!(splice_rt::block_on(old.handler.call(vec![])), Ok(Value::Int(1)));
        assert_eq!(splice_rt::block_on(table.call("answer", vec![])), Ok(Value::Int(2)));
    }

    #[test]
    fn rebind_unknown_is_hook_not_found() {
        let mut table = RoutineTable::new();
        let err = table
            .rebind("nope", constant(0), Arc::new(Signature::any()))
            .unwrap_err();
        assert_eq!(err, HookError::HookNotFound("nope".into()));
    }

    #[test]
    fn undefined_call_errors() {
        let table = RoutineTable::new();
        assert_eq!(
            splice_rt::block_on(table.call("missing", vec![])),
            Err(CallError::Undefined("missing".into()))
        );
    }

    #[test]
    fn handler_identity() {
        let a = constant(1);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&constant(1)));
    }
}
