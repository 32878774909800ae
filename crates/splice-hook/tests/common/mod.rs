// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A small host for integration tests: every routine the hooks know about,
//! their companions, the companion classes and four drivers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use splice_hook::catalog;
use splice_hook::classes::ClassLinks;
use splice_hook::driver::{DriverSet, DriverToggle};
use splice_hook::ops::{FileOps, StdioOps};
use splice_hook::stream::factory::TransportFactory;
use splice_hook::{
    FeatureFlagSet, Handler, HookConfig, Host, Param, RoutineTable, SharedScope, Signature,
    TypeRef, Value,
};
use splice_rt::WorkerCensus;

fn tagged(name: &str) -> Handler {
    let tag = name.to_string();
    Handler::sync(move |_| Ok(Value::from(tag.as_str())))
}

/// The host's own `usleep`: blocks the calling thread.
fn blocking_usleep() -> Handler {
    Handler::sync(|args| {
        let micros = args.first().and_then(Value::as_int).unwrap_or(0).max(0) as u64;
        std::thread::sleep(Duration::from_micros(micros));
        Ok(Value::Null)
    })
}

pub fn host_table() -> RoutineTable {
    let mut table = RoutineTable::new();
    let plain = [
        catalog::STREAM_FUNCTION,
        catalog::SLEEP,
        catalog::PROC,
        catalog::BLOCKING_NATIVE,
        catalog::BLOCKING_SCRIPT,
        catalog::SOCKET,
        catalog::HTTP_NATIVE,
        catalog::UNSAFE,
        catalog::ENV,
    ];
    for name in plain.iter().flat_map(|list| list.iter()) {
        table.define(name, tagged(name), Signature::any());
    }
    table.define("usleep", blocking_usleep(), Signature::any());

    for name in catalog::BLOCKING_SCRIPT.iter().chain(catalog::SOCKET).chain(catalog::HTTP_SCRIPT) {
        let companion = catalog::script_companion(name);
        table.define(&companion, tagged(&companion), Signature::any());
    }
    for name in catalog::HTTP_NATIVE {
        let companion = catalog::native_companion(name);
        table.define(&companion, tagged(&companion), native_signature());
    }
    table
}

pub fn native_signature() -> Signature {
    Signature::new(
        vec![Param::new("handle", TypeRef::named("CurlHandle"))],
        TypeRef::Any,
    )
}

pub fn host_classes() -> ClassLinks {
    let mut classes = ClassLinks::new();
    for (companion, host) in [catalog::SOCKET_CLASS_LINK, catalog::HTTP_CLASS_LINK] {
        classes.define(companion, None);
        classes.define(host, None);
    }
    classes
}

#[derive(Default)]
pub struct Toggle(pub AtomicBool);

impl DriverToggle for Toggle {
    fn set_cooperative(&self, on: bool) -> Result<(), String> {
        self.0.store(on, Ordering::SeqCst);
        Ok(())
    }
}

pub fn drivers() -> DriverSet {
    let mut set = DriverSet::new();
    for flag in FeatureFlagSet::DRIVERS.iter() {
        set.insert(flag, Arc::new(Toggle::default()));
    }
    set
}

pub fn scope_with(census: &WorkerCensus, drivers: DriverSet) -> Arc<SharedScope> {
    Host {
        census: census.clone(),
        drivers,
        ..Host::default()
    }
    .share(HookConfig::default())
}

pub fn scope(census: &WorkerCensus) -> Arc<SharedScope> {
    scope_with(census, drivers())
}

/// Identity of everything a transition may touch.
pub struct Snapshot {
    routines: Vec<(String, Handler, Arc<Signature>)>,
    transports: Vec<(String, TransportFactory)>,
    file: FileOps,
    stdio: StdioOps,
}

impl Snapshot {
    pub fn take(table: &RoutineTable, shared: &SharedScope) -> Self {
        let routines = table
            .names()
            .map(|n| {
                let r = table.get(n).unwrap();
                (n.to_string(), r.handler.clone(), r.signature.clone())
            })
            .collect();
        let transports = {
            let registry = shared.transports();
            registry
                .schemes()
                .map(|s| (s.to_string(), registry.get(s).unwrap().clone()))
                .collect()
        };
        let ops = shared.ops();
        Snapshot {
            routines,
            transports,
            file: ops.file.clone(),
            stdio: ops.stdio.clone(),
        }
    }

    pub fn assert_same(&self, other: &Snapshot) {
        assert_eq!(self.routines.len(), other.routines.len());
        let routines = self.routines.iter().zip(&other.routines);
        for ((name, h, sig), (other_name, other_h, other_sig)) in routines {
            assert_eq!(name, other_name);
            assert!(h.ptr_eq(other_h), "{} handler differs", name);
            assert!(Arc::ptr_eq(sig, other_sig), "{} signature differs", name);
        }
        assert_eq!(self.transports.len(), other.transports.len());
        let transports = self.transports.iter().zip(&other.transports);
        for ((scheme, f), (other_scheme, other_f)) in transports {
            assert_eq!(scheme, other_scheme);
            assert!(f.ptr_eq(other_f), "{} factory differs", scheme);
        }
        assert!(self.file.ptr_eq(&other.file));
        assert!(self.stdio.ptr_eq(&other.stdio));
    }
}
