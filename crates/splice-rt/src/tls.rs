// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Secure-channel seam.
//!
//! The runtime does not ship a TLS implementation. Sessions are sans-IO:
//! the socket shuttles bytes between the wire and the session, so any
//! engine that can consume and produce records plugs in here.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Which side of the handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Settings handed to the engine when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Expected peer name (SNI and verification).
    pub host_name: Option<String>,
    pub verify_peer: bool,
    pub allow_self_signed: bool,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub verify_depth: Option<u32>,
    pub disable_compression: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More bytes from the peer are needed.
    Continue,
    Done,
}

/// Negotiated cipher, as reported in stream metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfo {
    pub name: String,
    pub bits: u32,
    pub version: String,
}

/// One secure session over a byte stream.
///
/// Every call consumes all of `incoming`; partial records are buffered
/// inside the session.
pub trait TlsSession: Send + Sync {
    fn handshake(&mut self, incoming: &[u8], outgoing: &mut Vec<u8>) -> io::Result<HandshakeStatus>;

    /// Encrypt `plain` into wire records appended to `outgoing`.
    fn seal(&mut self, plain: &[u8], outgoing: &mut Vec<u8>) -> io::Result<()>;

    /// Decrypt wire bytes, appending any complete plaintext to `plain`.
    fn open(&mut self, incoming: &[u8], plain: &mut Vec<u8>) -> io::Result<()>;

    /// Append a close alert to `outgoing`.
    fn close_notify(&mut self, outgoing: &mut Vec<u8>);

    fn protocol(&self) -> String;

    fn cipher(&self) -> CipherInfo;

    /// DER-encoded leaf certificate presented by the peer.
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// DER-encoded chain presented by the peer, leaf first.
    fn peer_chain(&self) -> Vec<Vec<u8>>;
}

/// Factory for sessions.
pub trait TlsEngine: Send + Sync {
    fn session(&self, role: Role, options: &TlsOptions) -> io::Result<Box<dyn TlsSession>>;
}

pub type SharedEngine = Arc<dyn TlsEngine>;

/// Toy engine for exercising the handshake plumbing: a two-message
/// hello exchange and XOR "encryption". Provides no security.
#[cfg(any(test, feature = "test-util"))]
pub mod loopback {
    use super::*;

    const CLIENT_HELLO: &[u8] = b"LB-HELLO\n";
    const SERVER_HELLO: &[u8] = b"LB-READY\n";
    const KEY: u8 = 0x5a;

    /// Certificate bytes this engine reports for any peer.
    pub const PEER_CERT: &[u8] = b"loopback-peer-cert";

    #[derive(Debug, Default)]
    pub struct LoopbackEngine {
        /// Servers reject every hello when set.
        pub refuse: bool,
    }

    impl TlsEngine for LoopbackEngine {
        fn session(&self, role: Role, _options: &TlsOptions) -> io::Result<Box<dyn TlsSession>> {
            Ok(Box::new(LoopbackSession {
                role,
                refuse: self.refuse,
                sent_hello: false,
                done: false,
                pending: Vec::new(),
            }))
        }
    }

    struct LoopbackSession {
        role: Role,
        refuse: bool,
        sent_hello: bool,
        done: bool,
        /// Bytes received but not yet consumed.
        pending: Vec<u8>,
    }

    impl TlsSession for LoopbackSession {
        fn handshake(
            &mut self,
            incoming: &[u8],
            outgoing: &mut Vec<u8>,
        ) -> io::Result<HandshakeStatus> {
            self.pending.extend_from_slice(incoming);
            let expect = match self.role {
                Role::Client => {
                    if !self.sent_hello {
                        outgoing.extend_from_slice(CLIENT_HELLO);
                        self.sent_hello = true;
                    }
                    SERVER_HELLO
                }
                Role::Server => CLIENT_HELLO,
            };
            if self.pending.len() < expect.len() {
                return Ok(HandshakeStatus::Continue);
            }
            if &self.pending[..expect.len()] != expect || self.refuse {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "handshake rejected"));
            }
            self.pending.drain(..expect.len());
            if self.role == Role::Server {
                outgoing.extend_from_slice(SERVER_HELLO);
            }
            self.done = true;
            Ok(HandshakeStatus::Done)
        }

        fn seal(&mut self, plain: &[u8], outgoing: &mut Vec<u8>) -> io::Result<()> {
            outgoing.extend(plain.iter().map(|b| b ^ KEY));
            Ok(())
        }

        fn open(&mut self, incoming: &[u8], plain: &mut Vec<u8>) -> io::Result<()> {
            let leftover = std::mem::take(&mut self.pending);
            plain.extend(leftover.iter().chain(incoming).map(|b| b ^ KEY));
            Ok(())
        }

        fn close_notify(&mut self, _outgoing: &mut Vec<u8>) {}

        fn protocol(&self) -> String {
            "LB/1".to_string()
        }

        fn cipher(&self) -> CipherInfo {
            CipherInfo {
                name: "XOR-LOOPBACK".to_string(),
                bits: 8,
                version: "LB/1".to_string(),
            }
        }

        fn peer_certificate(&self) -> Option<Vec<u8>> {
            self.done.then(|| PEER_CERT.to_vec())
        }

        fn peer_chain(&self) -> Vec<Vec<u8>> {
            self.peer_certificate().into_iter().collect()
        }
    }
}
