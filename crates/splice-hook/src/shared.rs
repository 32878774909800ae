// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Process-wide hook state.
//!
//! Transport factories, stream-op tables and driver modes belong to the
//! whole process, so every context sees the same ones. They may only be
//! changed by the primary context while at most one worker is alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use splice_rt::WorkerCensus;

use crate::config::HookConfig;
use crate::driver::DriverSet;
use crate::error::Contention;
use crate::ops::{OpsHooks, OpsTables};
use crate::table::Handler;
use crate::transport::{TransportHooks, TransportRegistry};

/// The host's process-wide resources, before any hook touches them.
#[derive(Debug)]
pub struct Host {
    pub transports: TransportRegistry,
    pub ops: OpsTables,
    pub drivers: DriverSet,
    pub census: WorkerCensus,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            transports: TransportRegistry::with_defaults(),
            ops: OpsTables::default(),
            drivers: DriverSet::new(),
            census: WorkerCensus::global().clone(),
        }
    }
}

impl Host {
    pub fn share(self, config: HookConfig) -> Arc<SharedScope> {
        Arc::new(SharedScope {
            transport_hooks: TransportHooks::new(config.socket_timeout),
            transports: Mutex::new(self.transports),
            ops: Mutex::new(self.ops),
            ops_hooks: Mutex::new(OpsHooks::default()),
            drivers: self.drivers,
            census: self.census,
            originals: Mutex::new(IndexMap::new()),
            env_lock: futures::lock::Mutex::new(()),
            env_strings: Mutex::new(IndexMap::new()),
            primary_claimed: AtomicBool::new(false),
            config,
        })
    }
}

#[derive(Debug)]
pub struct SharedScope {
    config: HookConfig,
    census: WorkerCensus,
    transports: Mutex<TransportRegistry>,
    transport_hooks: TransportHooks,
    ops: Mutex<OpsTables>,
    ops_hooks: Mutex<OpsHooks>,
    drivers: DriverSet,
    /// Pre-hook handlers recorded by the primary context.
    originals: Mutex<IndexMap<String, Handler>>,
    /// Serializes environment mutation across tasks.
    env_lock: futures::lock::Mutex<()>,
    /// `putenv` strings, kept alive for as long as the scope.
    env_strings: Mutex<IndexMap<String, String>>,
    primary_claimed: AtomicBool,
}

impl SharedScope {
    pub fn new(config: HookConfig) -> Arc<Self> {
        Host::default().share(config)
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn census(&self) -> &WorkerCensus {
        &self.census
    }

    pub fn transports(&self) -> MutexGuard<'_, TransportRegistry> {
        self.transports.lock().unwrap()
    }

    /// The registry itself, for `transport::open_client` and friends.
    pub fn transport_registry(&self) -> &Mutex<TransportRegistry> {
        &self.transports
    }

    pub fn transport_hooks(&self) -> &TransportHooks {
        &self.transport_hooks
    }

    pub fn ops(&self) -> MutexGuard<'_, OpsTables> {
        self.ops.lock().unwrap()
    }

    pub(crate) fn ops_hooks(&self) -> MutexGuard<'_, OpsHooks> {
        self.ops_hooks.lock().unwrap()
    }

    pub fn drivers(&self) -> &DriverSet {
        &self.drivers
    }

    /// First caller wins the primary role.
    pub(crate) fn claim_primary(&self) -> bool {
        self.primary_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_primary(&self) {
        self.primary_claimed.store(false, Ordering::Release);
    }

    /// May the caller change process-wide state right now?
    pub fn check_mutation(&self, is_primary: bool) -> Result<(), Contention> {
        if !is_primary {
            return Err(Contention::SecondaryContext);
        }
        match self.census.active() {
            n if n > 1 => Err(Contention::Workers(n)),
            _ => Ok(()),
        }
    }

    pub(crate) fn record_original(&self, name: &str, handler: &Handler) {
        self.originals
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| handler.clone());
    }

    pub fn cached_original(&self, name: &str) -> Option<Handler> {
        self.originals.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn env_lock(&self) -> &futures::lock::Mutex<()> {
        &self.env_lock
    }

    pub(crate) fn keep_env_string(&self, key: &str, entry: String) {
        self.env_strings.lock().unwrap().insert(key.to_string(), entry);
    }

    pub fn env_string(&self, key: &str) -> Option<String> {
        self.env_strings.lock().unwrap().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_rt::Worker;

    fn scope(census: &WorkerCensus) -> Arc<SharedScope> {
        Host {
            census: census.clone(),
            ..Host::default()
        }
        .share(HookConfig::default())
    }

    #[test]
    fn mutation_needs_primary_and_single_worker() {
        let census = WorkerCensus::new();
        let shared = scope(&census);
        assert_eq!(shared.check_mutation(true), Ok(()));
        assert_eq!(shared.check_mutation(false), Err(Contention::SecondaryContext));

        let _a = Worker::with_census(&census).unwrap();
        assert_eq!(shared.check_mutation(true), Ok(()));
        let _b = Worker::with_census(&census).unwrap();
        assert_eq!(shared.check_mutation(true), Err(Contention::Workers(2)));
    }

    #[test]
    fn primary_is_claimed_once() {
        let shared = scope(&WorkerCensus::new());
        assert!(shared.claim_primary());
        assert!(!shared.claim_primary());
        shared.release_primary();
        assert!(shared.claim_primary());
    }

    #[test]
    fn first_recorded_original_sticks() {
        let shared = scope(&WorkerCensus::new());
        let first = Handler::sync(|_| Ok(crate::value::Value::Null));
        shared.record_original("sleep", &first);
        shared.record_original("sleep", &Handler::sync(|_| Ok(crate::value::Value::Null)));
        assert!(shared.cached_original("sleep").unwrap().ptr_eq(&first));
        assert!(shared.cached_original("usleep").is_none());
    }
}
