// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One execution context's view of the hooks.
//!
//! Each context owns its routine table, class links and hook registry;
//! process-wide resources live in the [`SharedScope`] all contexts share.
//! The first context created on a scope is the primary one and the only
//! one allowed to change process-wide hooks.

use std::sync::Arc;

use crate::catalog;
use crate::classes::ClassLinks;
use crate::engine::{self, Diagnostic, Scope, Transition};
use crate::error::HookError;
use crate::flags::FeatureFlagSet;
use crate::registry::{Callable, HookRegistry};
use crate::routines;
use crate::shared::SharedScope;
use crate::table::{Handler, RoutineFuture, RoutineTable};
use crate::value::Value;

pub struct HookContext {
    shared: Arc<SharedScope>,
    routines: RoutineTable,
    registry: HookRegistry,
    classes: ClassLinks,
    flags: FeatureFlagSet,
    diagnostics: Vec<Diagnostic>,
    is_primary: bool,
    unsafe_disabled: bool,
    closed: bool,
}

impl std::fmt::Debug for HookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("flags", &self.flags)
            .field("primary", &self.is_primary)
            .field("hooked", &self.registry.len())
            .finish()
    }
}

impl HookContext {
    /// Create a context over `routines` and `classes`. It becomes the
    /// primary context if the scope has none yet. Flags from the scope's
    /// config are applied right away.
    pub fn new(shared: Arc<SharedScope>, routines: RoutineTable, classes: ClassLinks) -> Self {
        let is_primary = shared.claim_primary();
        let mut ctx = Self::build(shared, routines, classes, is_primary);
        let initial = ctx.shared.config().flags;
        if !initial.is_empty() {
            ctx.apply(initial);
        }
        ctx
    }

    /// A context that never owns process-wide hooks.
    pub fn secondary(
        shared: Arc<SharedScope>,
        routines: RoutineTable,
        classes: ClassLinks,
    ) -> Self {
        Self::build(shared, routines, classes, false)
    }

    fn build(
        shared: Arc<SharedScope>,
        routines: RoutineTable,
        classes: ClassLinks,
        is_primary: bool,
    ) -> Self {
        let mut ctx = Self {
            shared,
            routines,
            registry: HookRegistry::new(),
            classes,
            flags: FeatureFlagSet::NONE,
            diagnostics: Vec::new(),
            is_primary,
            unsafe_disabled: false,
            closed: false,
        };
        for name in catalog::ENV {
            if !ctx.routines.contains(name) {
                continue;
            }
            let handler = routines::env::putenv(ctx.shared.clone());
            if let Err(e) = ctx.registry.register(&mut ctx.routines, name, handler, None) {
                tracing::warn!(%e, "putenv not replaced");
            }
        }
        tracing::debug!(primary = is_primary, "hook context created");
        ctx
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn shared(&self) -> &Arc<SharedScope> {
        &self.shared
    }

    pub fn routines(&self) -> &RoutineTable {
        &self.routines
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn classes(&self) -> &ClassLinks {
        &self.classes
    }

    pub fn get_flags(&self) -> FeatureFlagSet {
        self.flags
    }

    /// Diagnostics of the most recent transition.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Returns true only if every requested bit is now in effect.
    pub fn set_flags(&mut self, mask: FeatureFlagSet) -> bool {
        self.apply(mask).is_complete()
    }

    pub fn apply(&mut self, target: FeatureFlagSet) -> Transition {
        let mut scope = Scope {
            routines: &mut self.routines,
            registry: &mut self.registry,
            classes: &mut self.classes,
            shared: &self.shared,
            is_primary: self.is_primary,
        };
        let transition = engine::apply(&mut scope, self.flags, target);
        self.flags = transition.applied;
        self.diagnostics = transition.diagnostics.clone();
        transition
    }

    /// Call `name` as currently bound.
    pub fn call(&self, name: &str, args: Vec<Value>) -> RoutineFuture {
        self.routines.call(name, args)
    }

    pub fn resolve(&self, name: &str) -> Option<Callable> {
        self.registry.resolve(&self.routines, name)
    }

    /// The pre-hook implementation of `name`: this context's saved original,
    /// then the one the primary context recorded, then the table.
    pub fn lookup_original(&self, name: &str) -> Option<Handler> {
        if let Some(entry) = self.registry.entry(name) {
            return Some(entry.original.clone());
        }
        self.shared
            .cached_original(name)
            .or_else(|| self.routines.get(name).map(|r| r.handler.clone()))
    }

    pub fn call_original(&self, name: &str, args: Vec<Value>) -> RoutineFuture {
        match self.lookup_original(name) {
            Some(handler) => handler.call(args),
            None => self.routines.call(name, args),
        }
    }

    /// Rebind routines that cannot work under a scheduler to one that
    /// refuses to run. Routines the host does not define are skipped.
    pub fn disable_unsafe(&mut self) -> Result<(), HookError> {
        if self.unsafe_disabled {
            return Ok(());
        }
        for name in catalog::UNSAFE {
            if !self.routines.contains(name) {
                continue;
            }
            let (handler, signature) = routines::disabled(name);
            self.registry
                .register(&mut self.routines, name, handler, Some(&signature))?;
        }
        self.unsafe_disabled = true;
        Ok(())
    }

    pub fn enable_unsafe(&mut self) {
        if !self.unsafe_disabled {
            return;
        }
        for name in catalog::UNSAFE {
            self.registry.restore(&mut self.routines, name);
        }
        self.unsafe_disabled = false;
    }

    pub fn is_unsafe_disabled(&self) -> bool {
        self.unsafe_disabled
    }

    /// Undo every hook this context installed. Also runs on drop.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.flags.is_empty() {
            let transition = self.apply(FeatureFlagSet::NONE);
            if !transition.applied.is_empty() {
                tracing::warn!(left = %transition.applied, "hooks still active at shutdown");
            }
        }
        self.registry.restore_all(&mut self.routines);
        self.unsafe_disabled = false;
        self.classes.detach_all();
        if self.is_primary {
            self.shared.release_primary();
        }
        tracing::debug!("hook context closed");
    }

    /// Shut down and hand the host's table back.
    pub fn into_routines(mut self) -> RoutineTable {
        self.shutdown();
        std::mem::take(&mut self.routines)
    }
}

impl Drop for HookContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
