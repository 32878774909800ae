// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-connection options supplied by the caller.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use splice_rt::tls::{SharedEngine, TlsOptions};

/// `socket` context options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// Local `host:port` to bind before connecting.
    pub bindto: Option<String>,
    pub tcp_nodelay: bool,
    pub so_reuseport: bool,
    pub so_broadcast: bool,
    pub ipv6_v6only: bool,
    pub backlog: Option<i32>,
}

/// `ssl` context options, plus the certificates captured after a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslOptions {
    pub peer_name: Option<String>,
    pub verify_peer: Option<bool>,
    pub allow_self_signed: Option<bool>,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub local_cert: Option<PathBuf>,
    pub local_pk: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub verify_depth: Option<u32>,
    pub disable_compression: Option<bool>,
    pub capture_peer_cert: bool,
    pub capture_peer_cert_chain: bool,
    pub peer_certificate: Option<Vec<u8>>,
    pub peer_certificate_chain: Option<Vec<Vec<u8>>>,
}

impl SslOptions {
    /// Copy every option that was set onto the engine's settings.
    pub fn apply_to(&self, tls: &mut TlsOptions) {
        if let Some(name) = &self.peer_name {
            tls.host_name = Some(name.clone());
        }
        if let Some(v) = self.verify_peer {
            tls.verify_peer = v;
        }
        if let Some(v) = self.allow_self_signed {
            tls.allow_self_signed = v;
        }
        if let Some(p) = &self.cafile {
            tls.ca_file = Some(p.clone());
        }
        if let Some(p) = &self.capath {
            tls.ca_path = Some(p.clone());
        }
        if let Some(p) = &self.local_cert {
            tls.cert_file = Some(p.clone());
        }
        if let Some(p) = &self.local_pk {
            tls.key_file = Some(p.clone());
        }
        if let Some(p) = &self.passphrase {
            tls.passphrase = Some(p.clone());
        }
        if let Some(d) = self.verify_depth {
            tls.verify_depth = Some(d);
        }
        if let Some(v) = self.disable_compression {
            tls.disable_compression = v;
        }
    }
}

#[derive(Clone, Default)]
pub struct ContextOptions {
    pub socket: SocketOptions,
    pub ssl: SslOptions,
    /// Engine used when a stream turns on its secure channel.
    pub tls_engine: Option<SharedEngine>,
}

impl ContextOptions {
    pub fn with_engine(engine: SharedEngine) -> Self {
        Self {
            tls_engine: Some(engine),
            ..Self::default()
        }
    }

    pub fn into_ref(self) -> ContextRef {
        Arc::new(Mutex::new(self))
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("socket", &self.socket)
            .field("ssl", &self.ssl)
            .field("tls_engine", &self.tls_engine.is_some())
            .finish()
    }
}

/// Options shared by a stream and every stream accepted from it.
pub type ContextRef = Arc<Mutex<ContextOptions>>;
