// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Feature-flag transitions.
//!
//! `apply` diffs the current mask against the requested one and walks the
//! categories in a fixed order: transports, stream ops, drivers, routine
//! groups. Inside each stage disables run before enables, so switching
//! between two exclusive categories never has both on at once.
//!
//! Every category succeeds or fails on its own. A failed enable leaves
//! its bit off and records a diagnostic; the rest of the transition still
//! happens.

use std::sync::Arc;

use crate::classes::ClassLinks;
use crate::error::HookError;
use crate::flags::FeatureFlagSet;
use crate::registry::HookRegistry;
use crate::routines;
use crate::shared::SharedScope;
use crate::table::RoutineTable;
use crate::transport::{scheme_of, SCHEMES};

/// Why one bit of a transition did not go as asked.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub flag: FeatureFlagSet,
    pub error: HookError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    pub requested: FeatureFlagSet,
    pub applied: FeatureFlagSet,
    pub diagnostics: Vec<Diagnostic>,
}

impl Transition {
    /// Everything requested is now in effect.
    pub fn is_complete(&self) -> bool {
        self.diagnostics.is_empty() && self.applied == self.requested
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transports,
    StreamOps,
    Drivers,
    Routines,
}

pub const STAGES: [Stage; 4] = [
    Stage::Transports,
    Stage::StreamOps,
    Stage::Drivers,
    Stage::Routines,
];

/// Routine groups in the order they are applied.
const ROUTINE_ORDER: [FeatureFlagSet; 7] = [
    FeatureFlagSet::STREAM_FUNCTION,
    FeatureFlagSet::SLEEP,
    FeatureFlagSet::PROC,
    FeatureFlagSet::BLOCKING_FUNCTION,
    FeatureFlagSet::SOCKETS,
    FeatureFlagSet::HTTP_NATIVE,
    FeatureFlagSet::HTTP_SCRIPT,
];

impl Stage {
    pub fn flags(self) -> Vec<FeatureFlagSet> {
        match self {
            Stage::Transports => SCHEMES.iter().map(|(flag, _)| *flag).collect(),
            Stage::StreamOps => vec![FeatureFlagSet::FILE, FeatureFlagSet::STDIO],
            Stage::Drivers => FeatureFlagSet::DRIVERS.iter().collect(),
            Stage::Routines => ROUTINE_ORDER.to_vec(),
        }
    }
}

/// Everything a transition may touch.
pub(crate) struct Scope<'a> {
    pub routines: &'a mut RoutineTable,
    pub registry: &'a mut HookRegistry,
    pub classes: &'a mut ClassLinks,
    pub shared: &'a Arc<SharedScope>,
    pub is_primary: bool,
}

impl Scope<'_> {
    fn enable(&mut self, stage: Stage, flag: FeatureFlagSet) -> Result<(), HookError> {
        match stage {
            Stage::Transports => {
                let Some(scheme) = scheme_of(flag) else {
                    return Ok(());
                };
                let mut registry = self.shared.transports();
                self.shared.transport_hooks().hook(&mut registry, scheme)
            }
            Stage::StreamOps => {
                let mut tables = self.shared.ops();
                let mut hooks = self.shared.ops_hooks();
                if flag == FeatureFlagSet::FILE {
                    hooks.hook_file(&mut tables);
                } else {
                    hooks.hook_stdio(&mut tables);
                }
                Ok(())
            }
            Stage::Drivers => self.shared.drivers().toggle(flag, true),
            Stage::Routines => routines::install(
                flag,
                self.routines,
                self.registry,
                self.classes,
                self.shared,
                self.is_primary,
            ),
        }
    }

    fn disable(&mut self, stage: Stage, flag: FeatureFlagSet) -> Result<(), HookError> {
        match stage {
            Stage::Transports => {
                let Some(scheme) = scheme_of(flag) else {
                    return Ok(());
                };
                let mut registry = self.shared.transports();
                self.shared.transport_hooks().unhook(&mut registry, scheme)
            }
            Stage::StreamOps => {
                let mut tables = self.shared.ops();
                let mut hooks = self.shared.ops_hooks();
                if flag == FeatureFlagSet::FILE {
                    hooks.unhook_file(&mut tables);
                } else {
                    hooks.unhook_stdio(&mut tables);
                }
                Ok(())
            }
            Stage::Drivers => self.shared.drivers().toggle(flag, false),
            Stage::Routines => {
                routines::uninstall(flag, self.routines, self.registry, self.classes);
                Ok(())
            }
        }
    }
}

fn label(flag: FeatureFlagSet) -> &'static str {
    flag.name().unwrap_or("unknown")
}

/// Move from `current` to `target`, as far as possible.
pub(crate) fn apply(
    scope: &mut Scope<'_>,
    current: FeatureFlagSet,
    target: FeatureFlagSet,
) -> Transition {
    let requested = FeatureFlagSet::from_bits_truncate(target.bits());
    let mut target = requested;
    let mut diagnostics = Vec::new();

    let http = FeatureFlagSet::HTTP_NATIVE | FeatureFlagSet::HTTP_SCRIPT;
    if target.contains(http) {
        target.remove(FeatureFlagSet::HTTP_SCRIPT);
        let error = HookError::ExclusiveCategories {
            kept: label(FeatureFlagSet::HTTP_NATIVE),
            dropped: label(FeatureFlagSet::HTTP_SCRIPT),
        };
        tracing::warn!(%error, "dropping conflicting category");
        diagnostics.push(Diagnostic {
            flag: FeatureFlagSet::HTTP_SCRIPT,
            error,
        });
    }

    // Process-wide categories keep their current state when the caller
    // may not change them.
    let shared_change = ((target - current) | (current - target)) & FeatureFlagSet::SHARED;
    if !shared_change.is_empty() {
        if let Err(contention) = scope.shared.check_mutation(scope.is_primary) {
            for flag in shared_change.iter() {
                let error = HookError::ConcurrentMutationRejected {
                    category: label(flag),
                    contention,
                };
                tracing::warn!(%error, "category left unchanged");
                diagnostics.push(Diagnostic { flag, error });
            }
            target = (target - shared_change) | (current & shared_change);
        }
    }

    let to_enable = target - current;
    let to_disable = current - target;
    let mut applied = current;

    for stage in STAGES {
        let flags = stage.flags();
        for &flag in flags.iter().filter(|f| to_disable.contains(**f)) {
            match scope.disable(stage, flag) {
                Ok(()) => applied.remove(flag),
                Err(error) => {
                    tracing::warn!(%error, category = label(flag), "disable failed");
                    diagnostics.push(Diagnostic { flag, error });
                }
            }
        }
        for &flag in flags.iter().filter(|f| to_enable.contains(**f)) {
            match scope.enable(stage, flag) {
                Ok(()) => applied.insert(flag),
                Err(error) => {
                    tracing::warn!(%error, category = label(flag), "enable failed");
                    diagnostics.push(Diagnostic { flag, error });
                }
            }
        }
    }

    tracing::debug!(%requested, %applied, "hook flags applied");
    Transition {
        requested,
        applied,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_cover_every_known_bit_once() {
        let mut seen = FeatureFlagSet::NONE;
        for stage in STAGES {
            for flag in stage.flags() {
                assert!(!seen.contains(flag), "{} listed twice", flag);
                seen.insert(flag);
            }
        }
        assert_eq!(seen, FeatureFlagSet::KNOWN);
    }

    #[test]
    fn native_http_runs_before_script_http() {
        let order = Stage::Routines.flags();
        let pos = |f| order.iter().position(|x| *x == f).unwrap();
        assert!(pos(FeatureFlagSet::HTTP_NATIVE) < pos(FeatureFlagSet::HTTP_SCRIPT));
        assert_eq!(order[0], FeatureFlagSet::STREAM_FUNCTION);
    }

    #[test]
    fn completeness() {
        let t = Transition {
            requested: FeatureFlagSet::SLEEP,
            applied: FeatureFlagSet::SLEEP,
            diagnostics: vec![],
        };
        assert!(t.is_complete());
        let partial = Transition {
            applied: FeatureFlagSet::NONE,
            ..t.clone()
        };
        assert!(!partial.is_complete());
    }
}
