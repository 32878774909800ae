// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheme-keyed transport registry and the hooks that take schemes over.

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;

use crate::error::{HookError, StreamError};
use crate::flags::FeatureFlagSet;
use crate::stream::factory::{bridging, SavedFactories, TransportFactory, TransportRequest};
use crate::stream::{ContextRef, OptionReply, StreamOption, StreamRef, XportOp};

const DEFAULT_BACKLOG: i32 = 32;

/// The host's `scheme -> factory` table.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    factories: IndexMap<String, TransportFactory>,
    sealed: HashSet<String>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain socket transports for every scheme the hooks know about.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let socket = TransportFactory::socket();
        for (_, scheme) in SCHEMES {
            registry.factories.insert(scheme.to_string(), socket.clone());
        }
        registry
    }

    /// Install `factory`, returning the one it replaced.
    pub fn register(
        &mut self,
        scheme: &str,
        factory: TransportFactory,
    ) -> Result<Option<TransportFactory>, HookError> {
        if self.sealed.contains(scheme) {
            return Err(HookError::TransportRegistrationConflict {
                scheme: scheme.to_string(),
                reason: "scheme is sealed".to_string(),
            });
        }
        Ok(self.factories.insert(scheme.to_string(), factory))
    }

    pub fn unregister(&mut self, scheme: &str) -> Option<TransportFactory> {
        self.factories.shift_remove(scheme)
    }

    /// Refuse further registrations for `scheme`.
    pub fn seal(&mut self, scheme: &str) {
        self.sealed.insert(scheme.to_string());
    }

    pub fn unseal(&mut self, scheme: &str) {
        self.sealed.remove(scheme);
    }

    pub fn get(&self, scheme: &str) -> Option<&TransportFactory> {
        self.factories.get(scheme)
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Resolve `url` to a fresh, unconnected stream.
    pub fn create(
        &self,
        url: &str,
        context: ContextRef,
        timeout: Option<Duration>,
    ) -> Result<(StreamRef, String), StreamError> {
        let (scheme, target) = split_url(url);
        let factory = self.get(scheme).ok_or_else(|| {
            tracing::warn!(scheme, "unable to find the socket transport");
            StreamError::UnknownTransport(scheme.to_string())
        })?;
        let request = TransportRequest {
            scheme: scheme.to_string(),
            target: target.to_string(),
            context,
            timeout,
        };
        Ok((factory.create(&request)?, request.target))
    }
}

/// `scheme://target`; no scheme means tcp.
pub fn split_url(url: &str) -> (&str, &str) {
    match url.split_once("://") {
        Some((scheme, target)) => (scheme, target),
        None => ("tcp", url),
    }
}

/// Open a client connection to `url`.
///
/// The registry lock is only held while the stream is created, never
/// across the connect.
pub async fn open_client(
    registry: &std::sync::Mutex<TransportRegistry>,
    url: &str,
    context: ContextRef,
    timeout: Option<Duration>,
) -> Result<StreamRef, StreamError> {
    let (stream, target) = registry.lock().unwrap().create(url, context, timeout)?;
    stream
        .set_option(StreamOption::Xport(XportOp::Connect { target, timeout }))
        .await?;
    Ok(stream)
}

/// Open a server socket on `url`. Stream-oriented transports also listen,
/// with the context's backlog.
pub async fn open_server(
    registry: &std::sync::Mutex<TransportRegistry>,
    url: &str,
    context: ContextRef,
) -> Result<StreamRef, StreamError> {
    let backlog = context.lock().unwrap().socket.backlog.unwrap_or(DEFAULT_BACKLOG);
    let (scheme, _) = split_url(url);
    let listens = !matches!(scheme, "udp" | "udg");
    let (stream, target) = registry.lock().unwrap().create(url, context, None)?;
    stream.set_option(StreamOption::Xport(XportOp::Bind { target })).await?;
    if listens {
        stream.set_option(StreamOption::Xport(XportOp::Listen { backlog })).await?;
    }
    Ok(stream)
}

/// Accept one peer on a listening stream.
pub async fn accept(
    listener: &StreamRef,
    timeout: Option<Duration>,
) -> Result<StreamRef, StreamError> {
    match listener
        .set_option(StreamOption::Xport(XportOp::Accept { timeout }))
        .await?
    {
        OptionReply::Accepted { stream, .. } => Ok(stream),
        other => Err(StreamError::InvalidArgument(format!("unexpected accept reply {:?}", other))),
    }
}

/// Flag bit to the scheme it hooks.
pub const SCHEMES: [(FeatureFlagSet, &str); 6] = [
    (FeatureFlagSet::TCP, "tcp"),
    (FeatureFlagSet::UDP, "udp"),
    (FeatureFlagSet::UNIX, "unix"),
    (FeatureFlagSet::UDG, "udg"),
    (FeatureFlagSet::SSL, "ssl"),
    (FeatureFlagSet::TLS, "tls"),
];

pub fn scheme_of(flag: FeatureFlagSet) -> Option<&'static str> {
    SCHEMES.iter().find(|(f, _)| *f == flag).map(|(_, s)| *s)
}

/// Which schemes the bridge currently owns, and what it displaced.
#[derive(Debug)]
pub struct TransportHooks {
    saved: SavedFactories,
    bridge: TransportFactory,
}

impl TransportHooks {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        let saved = SavedFactories::default();
        Self {
            bridge: bridging(saved.clone(), default_timeout),
            saved,
        }
    }

    pub fn is_hooked(&self, scheme: &str) -> bool {
        self.saved.lock().unwrap().contains_key(scheme)
    }

    /// The factory that was installed before the bridge, if any.
    pub fn saved(&self, scheme: &str) -> Option<TransportFactory> {
        self.saved.lock().unwrap().get(scheme).cloned().flatten()
    }

    pub fn bridge(&self) -> &TransportFactory {
        &self.bridge
    }

    /// Install the bridge for `scheme`, remembering what was there. A
    /// refused registration leaves everything as it was.
    pub fn hook(&self, registry: &mut TransportRegistry, scheme: &str) -> Result<(), HookError> {
        if self.is_hooked(scheme) {
            return Ok(());
        }
        let previous = registry.get(scheme).cloned();
        registry.register(scheme, self.bridge.clone())?;
        self.saved.lock().unwrap().insert(scheme.to_string(), previous);
        tracing::debug!(scheme, "transport hooked");
        Ok(())
    }

    /// Put back exactly the factory `hook` displaced, or remove the scheme
    /// if it had none.
    pub fn unhook(&self, registry: &mut TransportRegistry, scheme: &str) -> Result<(), HookError> {
        let Some(previous) = self.saved.lock().unwrap().get(scheme).cloned() else {
            return Ok(());
        };
        match previous {
            Some(factory) => {
                registry.register(scheme, factory)?;
            }
            None => {
                registry.unregister(scheme);
            }
        }
        self.saved.lock().unwrap().shift_remove(scheme);
        tracing::debug!(scheme, "transport restored");
        Ok(())
    }
}
