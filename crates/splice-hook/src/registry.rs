// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Hook registry: which routines are redirected, and what they were before.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::HookError;
use crate::signature::{ClonedSignature, Signature, SignatureArena};
use crate::table::{Handler, Routine, RoutineTable};

/// Record of one redirected routine.
#[derive(Debug)]
pub struct HookEntry {
    pub original: Handler,
    pub original_signature: Arc<Signature>,
    pub replacement: Handler,
    /// Owned copy of the replacement's signature, if one was supplied.
    cloned: Option<ClonedSignature>,
}

impl HookEntry {
    pub fn cloned_signature(&self) -> Option<&Signature> {
        self.cloned.as_ref().map(ClonedSignature::get)
    }
}

/// Which implementation a name currently resolves to.
#[derive(Debug, Clone)]
pub enum Callable {
    Original(Handler),
    Replacement(Handler),
}

impl Callable {
    pub fn handler(&self) -> &Handler {
        match self {
            Callable::Original(h) | Callable::Replacement(h) => h,
        }
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self, Callable::Replacement(_))
    }
}

/// Redirections applied to one routine table.
#[derive(Debug, Default)]
pub struct HookRegistry {
    entries: IndexMap<String, HookEntry>,
    arena: SignatureArena,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arena(arena: SignatureArena) -> Self {
        Self {
            entries: IndexMap::new(),
            arena,
        }
    }

    pub fn arena(&self) -> &SignatureArena {
        &self.arena
    }

    /// Redirect `name` to `replacement`. A supplied signature is cloned and
    /// owned by the entry; without one the original signature stays bound.
    /// Hooking an already-hooked routine rebinds it in place.
    ///
    /// Returns the pre-hook routine when this call created the entry.
    pub fn register(
        &mut self,
        table: &mut RoutineTable,
        name: &str,
        replacement: Handler,
        signature: Option<&Signature>,
    ) -> Result<Option<Routine>, HookError> {
        if let Some(entry) = self.entries.get_mut(name) {
            let cloned = signature.map(|s| self.arena.clone_from(s));
            let bound = cloned
                .as_ref()
                .map_or_else(|| entry.original_signature.clone(), ClonedSignature::share);
            table.rebind(name, replacement.clone(), bound)?;
            entry.replacement = replacement;
            // Dropping the previous clone releases it.
            entry.cloned = cloned;
            tracing::debug!(routine = name, "hook rebound");
            return Ok(None);
        }

        let current = table
            .get(name)
            .ok_or_else(|| HookError::HookNotFound(name.to_string()))?;
        let cloned = signature.map(|s| self.arena.clone_from(s));
        let bound = cloned
            .as_ref()
            .map_or_else(|| current.signature.clone(), ClonedSignature::share);
        let original = table.rebind(name, replacement.clone(), bound)?;

        self.entries.insert(
            name.to_string(),
            HookEntry {
                original: original.handler.clone(),
                original_signature: original.signature.clone(),
                replacement,
                cloned,
            },
        );
        tracing::debug!(routine = name, "hook installed");
        Ok(Some(original))
    }

    /// Put the original back. Returns false if `name` was not hooked.
    pub fn restore(&mut self, table: &mut RoutineTable, name: &str) -> bool {
        let Some(entry) = self.entries.shift_remove(name) else {
            return false;
        };
        let restored = table.rebind(name, entry.original.clone(), entry.original_signature.clone());
        if let Err(e) = restored {
            tracing::warn!(%e, routine = name, "routine vanished while hooked");
        }
        tracing::debug!(routine = name, "hook restored");
        // `entry.cloned` is released here, exactly once.
        drop(entry);
        true
    }

    /// Restore every entry, newest first.
    pub fn restore_all(&mut self, table: &mut RoutineTable) {
        let names: Vec<String> = self.entries.keys().rev().cloned().collect();
        for name in names {
            self.restore(table, &name);
        }
    }

    /// The pre-hook implementation of `name`: the saved original if hooked,
    /// otherwise whatever the table holds.
    pub fn lookup_original(&self, table: &RoutineTable, name: &str) -> Option<Handler> {
        match self.entries.get(name) {
            Some(entry) => Some(entry.original.clone()),
            None => table.get(name).map(|r| r.handler.clone()),
        }
    }

    pub fn resolve(&self, table: &RoutineTable, name: &str) -> Option<Callable> {
        match self.entries.get(name) {
            Some(entry) => Some(Callable::Replacement(entry.replacement.clone())),
            None => table.get(name).map(|r| Callable::Original(r.handler.clone())),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&HookEntry> {
        self.entries.get(name)
    }

    pub fn is_hooked(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn hooked(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
