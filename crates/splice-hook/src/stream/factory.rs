// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Transport factories: `scheme://target` to an unconnected stream.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use splice_rt::{in_task, CoSocket, SocketKind, Timeouts};

use super::bridge::SocketStream;
use super::options::ContextRef;
use super::{StreamCell, StreamRef};
use crate::error::StreamError;

/// What a caller asked a transport for.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub scheme: String,
    /// Everything after `scheme://`.
    pub target: String,
    pub context: ContextRef,
    pub timeout: Option<Duration>,
}

type FactoryFn = dyn Fn(&TransportRequest) -> Result<StreamRef, StreamError> + Send + Sync;

/// A transport constructor. Identity is the allocation, so a saved
/// factory can be checked against what is installed later.
#[derive(Clone)]
pub struct TransportFactory {
    name: &'static str,
    f: Arc<FactoryFn>,
}

impl TransportFactory {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&TransportRequest) -> Result<StreamRef, StreamError> + Send + Sync + 'static,
    {
        Self { name, f: Arc::new(f) }
    }

    /// Plain socket streams with no default timeout.
    pub fn socket() -> Self {
        Self::new("socket", |req| build_socket_stream(req, None).map(StreamCell::new))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn create(&self, request: &TransportRequest) -> Result<StreamRef, StreamError> {
        (self.f)(request)
    }

    pub fn ptr_eq(&self, other: &TransportFactory) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportFactory({} @ {:p})", self.name, Arc::as_ptr(&self.f) as *const ())
    }
}

/// Factories that were installed before the bridge took a scheme over.
/// `None` means the scheme had no factory at all.
pub type SavedFactories = Arc<Mutex<IndexMap<String, Option<TransportFactory>>>>;

fn socket_kind(scheme: &str, target: &str) -> Option<SocketKind> {
    let v6 = target.starts_with('[');
    Some(match scheme {
        "tcp" | "ssl" | "tls" if v6 => SocketKind::Tcp6,
        "tcp" | "ssl" | "tls" => SocketKind::Tcp,
        "udp" if v6 => SocketKind::Udp6,
        "udp" => SocketKind::Udp,
        "unix" => SocketKind::UnixStream,
        "udg" => SocketKind::UnixDgram,
        _ => return None,
    })
}

pub fn is_secure_scheme(scheme: &str) -> bool {
    matches!(scheme, "ssl" | "tls")
}

/// Build an unconnected bridge stream for `request`. Secure schemes arm
/// the secure channel from the context's engine. The request's timeout
/// wins over `default_timeout`.
pub fn build_socket_stream(
    request: &TransportRequest,
    default_timeout: Option<Duration>,
) -> Result<SocketStream, StreamError> {
    let Some(kind) = socket_kind(&request.scheme, &request.target) else {
        tracing::warn!(scheme = %request.scheme, "unsupported socket transport");
        return Err(StreamError::UnknownTransport(request.scheme.clone()));
    };

    let mut sock = CoSocket::new(kind)?;
    sock.set_timeouts(Timeouts::uniform(request.timeout.or(default_timeout)));
    let mut stream = SocketStream::new(sock, request.context.clone());
    if is_secure_scheme(&request.scheme) {
        stream.crypto_setup()?;
    }
    Ok(stream)
}

/// The factory the transport hooks install.
///
/// Inside a task it builds a bridge stream. Outside one there is nothing to
/// cooperate with, so it hands the request to whatever factory the scheme
/// had before the hook.
pub fn bridging(saved: SavedFactories, default_timeout: Option<Duration>) -> TransportFactory {
    TransportFactory::new("bridge", move |request| {
        if in_task() {
            return build_socket_stream(request, default_timeout).map(StreamCell::new);
        }
        let original = saved.lock().unwrap().get(&request.scheme).cloned().flatten();
        match original {
            Some(factory) => factory.create(request),
            None => {
                tracing::warn!(scheme = %request.scheme, "no original transport to fall back to");
                Err(StreamError::UnknownTransport(request.scheme.clone()))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ContextOptions;
    use splice_rt::tls::loopback::LoopbackEngine;
    use splice_rt::{Worker, WorkerCensus};

    fn request(scheme: &str, target: &str) -> TransportRequest {
        TransportRequest {
            scheme: scheme.to_string(),
            target: target.to_string(),
            context: ContextOptions::default().into_ref(),
            timeout: None,
        }
    }

    #[test]
    fn schemes_map_to_socket_kinds() {
        assert_eq!(socket_kind("tcp", "127.0.0.1:80"), Some(SocketKind::Tcp));
        assert_eq!(socket_kind("tls", "[::1]:443"), Some(SocketKind::Tcp6));
        assert_eq!(socket_kind("udp", "[::1]:53"), Some(SocketKind::Udp6));
        assert_eq!(socket_kind("unix", "/tmp/s"), Some(SocketKind::UnixStream));
        assert_eq!(socket_kind("udg", "/tmp/s"), Some(SocketKind::UnixDgram));
        assert_eq!(socket_kind("gopher", "x:70"), None);
    }

    #[test]
    fn unknown_scheme_fails() {
        let err = build_socket_stream(&request("gopher", "x:70"), None).unwrap_err();
        assert_eq!(err, StreamError::UnknownTransport("gopher".into()));
    }

    #[test]
    fn secure_scheme_without_engine_fails_setup() {
        let err = build_socket_stream(&request("ssl", "127.0.0.1:443"), None).unwrap_err();
        assert!(matches!(err, StreamError::CryptoSetupFailed(_)));
    }

    #[test]
    fn secure_scheme_with_engine_arms_tls() {
        let mut req = request("tls", "127.0.0.1:443");
        req.context = ContextOptions::with_engine(Arc::new(LoopbackEngine::default())).into_ref();
        let stream = build_socket_stream(&req, None).unwrap();
        assert!(stream.socket().unwrap().tls_enabled());
    }

    #[test]
    fn default_timeout_applies_unless_overridden() {
        let d = Some(Duration::from_secs(7));
        let stream = build_socket_stream(&request("tcp", "127.0.0.1:1"), d).unwrap();
        assert_eq!(stream.socket().unwrap().timeouts(), Timeouts::uniform(d));

        let mut req = request("tcp", "127.0.0.1:1");
        req.timeout = Some(Duration::from_secs(1));
        let stream = build_socket_stream(&req, d).unwrap();
        assert_eq!(stream.socket().unwrap().timeouts(), Timeouts::uniform(req.timeout));
    }

    #[test]
    fn bridge_falls_back_outside_tasks() {
        let saved: SavedFactories = Arc::default();
        let bridge = bridging(saved.clone(), None);

        let err = bridge.create(&request("tcp", "127.0.0.1:1")).unwrap_err();
        assert_eq!(err, StreamError::UnknownTransport("tcp".into()));

        let original =
            TransportFactory::new("original", |_| Err(StreamError::Unsupported("original")));
        saved.lock().unwrap().insert("tcp".into(), Some(original));
        let err = bridge.create(&request("tcp", "127.0.0.1:1")).unwrap_err();
        assert_eq!(err, StreamError::Unsupported("original"));
    }

    #[test]
    fn bridge_builds_sockets_inside_tasks() {
        let bridge = bridging(Arc::default(), None);
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let label = worker.block_on(async move {
            splice_rt::spawn(async move {
                bridge.create(&request("tcp", "127.0.0.1:1")).map(|s| s.label())
            })
                .await
                .unwrap()
        });
        assert_eq!(label, Ok("tcp_socket/coroutine"));
    }
}
