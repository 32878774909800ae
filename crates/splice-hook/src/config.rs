// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Settings read from the environment.
//!
//! - `SPLICE_HOOK_FLAGS`: flags to enable at startup (names or a number)
//! - `SPLICE_SOCKET_TIMEOUT`: default socket timeout in seconds, `<= 0` disables
//! - `SPLICE_PROC_POLL_MS`: how often a waiting task checks on a child process

use std::time::Duration;

use crate::flags::FeatureFlagSet;

pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROC_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub struct HookConfig {
    pub flags: FeatureFlagSet,
    /// Applied to sockets the bridge creates. `None` waits forever.
    pub socket_timeout: Option<Duration>,
    pub proc_poll: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            flags: FeatureFlagSet::NONE,
            socket_timeout: Some(DEFAULT_SOCKET_TIMEOUT),
            proc_poll: DEFAULT_PROC_POLL,
        }
    }
}

impl HookConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Malformed values fall back to
    /// the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("SPLICE_HOOK_FLAGS") {
            match raw.parse::<FeatureFlagSet>() {
                Ok(flags) => config.flags = flags,
                Err(e) => tracing::warn!(%e, "ignoring SPLICE_HOOK_FLAGS"),
            }
        }

        if let Some(raw) = lookup("SPLICE_SOCKET_TIMEOUT") {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => {
                    match Duration::try_from_secs_f64(secs) {
                        Ok(timeout) => config.socket_timeout = Some(timeout),
                        Err(e) => {
                            tracing::warn!(value = %raw, %e, "ignoring SPLICE_SOCKET_TIMEOUT")
                        }
                    }
                }
                Ok(secs) if secs.is_finite() => config.socket_timeout = None,
                _ => tracing::warn!(value = %raw, "ignoring SPLICE_SOCKET_TIMEOUT"),
            }
        }

        if let Some(raw) = lookup("SPLICE_PROC_POLL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.proc_poll = Duration::from_millis(ms),
                _ => tracing::warn!(value = %raw, "ignoring SPLICE_PROC_POLL_MS"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> HookConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HookConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(config(&[]), HookConfig::default());
        assert_eq!(HookConfig::default().socket_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn reads_every_key() {
        let c = config(&[
            ("SPLICE_HOOK_FLAGS", "tcp,sleep"),
            ("SPLICE_SOCKET_TIMEOUT", "1.5"),
            ("SPLICE_PROC_POLL_MS", "20"),
        ]);
        assert_eq!(c.flags, FeatureFlagSet::TCP | FeatureFlagSet::SLEEP);
        assert_eq!(c.socket_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(c.proc_poll, Duration::from_millis(20));
    }

    #[test]
    fn non_positive_timeout_disables_it() {
        assert_eq!(config(&[("SPLICE_SOCKET_TIMEOUT", "0")]).socket_timeout, None);
        assert_eq!(config(&[("SPLICE_SOCKET_TIMEOUT", "-1")]).socket_timeout, None);
    }

    #[test]
    fn unrepresentable_timeout_keeps_the_default() {
        assert_eq!(config(&[("SPLICE_SOCKET_TIMEOUT", "1e30")]), HookConfig::default());
        assert_eq!(config(&[("SPLICE_SOCKET_TIMEOUT", "inf")]), HookConfig::default());
    }

    #[test]
    fn garbage_falls_back() {
        let c = config(&[
            ("SPLICE_HOOK_FLAGS", "tcp,nonsense"),
            ("SPLICE_SOCKET_TIMEOUT", "soon"),
            ("SPLICE_PROC_POLL_MS", "0"),
        ]);
        assert_eq!(c, HookConfig::default());
    }
}
