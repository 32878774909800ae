// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker census.
//!
//! Counts live workers so process-wide state can refuse to be mutated
//! while more than one worker might be reading it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared count of live workers.
#[derive(Debug, Clone, Default)]
pub struct WorkerCensus {
    active: Arc<AtomicUsize>,
}

impl WorkerCensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The census every `Worker::new()` enrolls in.
    pub fn global() -> &'static WorkerCensus {
        static GLOBAL: OnceLock<WorkerCensus> = OnceLock::new();
        GLOBAL.get_or_init(WorkerCensus::new)
    }

    /// Count one more live worker until the guard drops.
    pub fn enroll(&self) -> Enrollment {
        self.active.fetch_add(1, Ordering::AcqRel);
        Enrollment {
            census: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Membership in a `WorkerCensus`. Dropping it leaves the census.
#[derive(Debug)]
pub struct Enrollment {
    census: WorkerCensus,
}

impl Enrollment {
    pub fn census(&self) -> &WorkerCensus {
        &self.census
    }
}

impl Drop for Enrollment {
    fn drop(&mut self) {
        self.census.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_tracks_live_workers() {
        let census = WorkerCensus::new();
        assert_eq!(census.active(), 0);
        let a = census.enroll();
        let b = census.enroll();
        assert_eq!(census.active(), 2);
        drop(a);
        assert_eq!(census.active(), 1);
        drop(b);
        assert_eq!(census.active(), 0);
    }

    #[test]
    fn clones_share_the_count() {
        let census = WorkerCensus::new();
        let other = census.clone();
        let _e = other.enroll();
        assert_eq!(census.active(), 1);
    }
}
