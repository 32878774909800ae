// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Database drivers that can switch their own I/O to cooperative mode.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::HookError;
use crate::flags::FeatureFlagSet;

/// A driver-level switch between blocking and cooperative I/O.
pub trait DriverToggle: Send + Sync {
    fn set_cooperative(&self, on: bool) -> Result<(), String>;
}

/// Drivers the host has loaded, keyed by their flag bit.
#[derive(Default, Clone)]
pub struct DriverSet {
    drivers: IndexMap<FeatureFlagSet, Arc<dyn DriverToggle>>,
}

impl fmt::Debug for DriverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.drivers.keys().map(|flag| flag.name().unwrap_or("?")))
            .finish()
    }
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, flag: FeatureFlagSet, driver: Arc<dyn DriverToggle>) {
        debug_assert!(FeatureFlagSet::DRIVERS.contains(flag));
        self.drivers.insert(flag, driver);
    }

    pub fn contains(&self, flag: FeatureFlagSet) -> bool {
        self.drivers.contains_key(&flag)
    }

    /// Flip the driver behind `flag`. Turning off a driver that was never
    /// loaded is fine; turning it on is not.
    pub fn toggle(&self, flag: FeatureFlagSet, on: bool) -> Result<(), HookError> {
        let name = flag.name().unwrap_or("driver");
        let Some(driver) = self.drivers.get(&flag) else {
            return if on { Err(HookError::DriverUnavailable(name)) } else { Ok(()) };
        };
        driver
            .set_cooperative(on)
            .map_err(|reason| HookError::DriverToggleFailed { driver: name, reason })?;
        tracing::debug!(driver = name, cooperative = on, "driver toggled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Flip(AtomicBool);

    impl DriverToggle for Flip {
        fn set_cooperative(&self, on: bool) -> Result<(), String> {
            self.0.store(on, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Broken;

    impl DriverToggle for Broken {
        fn set_cooperative(&self, _on: bool) -> Result<(), String> {
            Err("client library too old".into())
        }
    }

    #[test]
    fn toggles_reach_the_driver() {
        let flip = Arc::new(Flip::default());
        let mut set = DriverSet::new();
        set.insert(FeatureFlagSet::PDO_PGSQL, flip.clone());
        set.toggle(FeatureFlagSet::PDO_PGSQL, true).unwrap();
        assert!(flip.0.load(Ordering::SeqCst));
        set.toggle(FeatureFlagSet::PDO_PGSQL, false).unwrap();
        assert!(!flip.0.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_and_failing_drivers() {
        let mut set = DriverSet::new();
        assert_eq!(
            set.toggle(FeatureFlagSet::PDO_ODBC, true),
            Err(HookError::DriverUnavailable("pdo_odbc"))
        );
        assert_eq!(set.toggle(FeatureFlagSet::PDO_ODBC, false), Ok(()));

        set.insert(FeatureFlagSet::PDO_SQLITE, Arc::new(Broken));
        assert!(matches!(
            set.toggle(FeatureFlagSet::PDO_SQLITE, true),
            Err(HookError::DriverToggleFailed { driver: "pdo_sqlite", .. })
        ));
    }
}
