// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Socket addresses, parsing, and name resolution.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::offload::run_blocking;

/// Address of either end of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
    /// Unbound unix socket (socketpair, anonymous client).
    Unnamed,
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(addr) => write!(f, "{}", addr),
            SockAddr::Unix(path) => write!(f, "{}", path.display()),
            SockAddr::Unnamed => Ok(()),
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Split `host:port` or `[v6]:port`.
pub fn split_host_port(target: &str) -> io::Result<(&str, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(format!("unterminated IPv6 literal in `{}`", target)))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| invalid(format!("missing port in `{}`", target)))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("missing port in `{}`", target)))?
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| invalid(format!("invalid port in `{}`", target)))?;
    Ok((host, port))
}

/// Resolve `host` to an address of the requested family. Literal addresses
/// skip the resolver; names are looked up on a helper thread.
pub async fn resolve(host: &str, port: u16, want_v6: bool) -> io::Result<SocketAddr> {
    let host = match host {
        "" | "*" if want_v6 => "::",
        "" | "*" => "0.0.0.0",
        other => other,
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let name = host.to_string();
    let addrs = run_blocking(move || {
        (name.as_str(), port)
            .to_socket_addrs()
            .map(|it| it.collect::<Vec<_>>())
    })
    .await?;
    addrs
        .into_iter()
        .find(|a| a.is_ipv6() == want_v6)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "no {} address found for `{}`",
                    if want_v6 { "IPv6" } else { "IPv4" },
                    host
                ),
            )
        })
}

/// Raw sockaddr storage ready for a syscall.
pub(crate) struct RawAddr {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

impl RawAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }
}

pub(crate) fn to_raw(addr: &SockAddr) -> io::Result<RawAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SockAddr::Inet(SocketAddr::V4(v4)) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SockAddr::Inet(SocketAddr::V6(v6)) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
        SockAddr::Unix(path) => {
            let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path.as_os_str().as_bytes();
            if bytes.len() >= sun.sun_path.len() {
                return Err(invalid(format!("unix socket path too long: {}", path.display())));
            }
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1
        }
        SockAddr::Unnamed => return Err(invalid("cannot address an unnamed socket".to_string())),
    };
    Ok(RawAddr {
        storage,
        len: len as libc::socklen_t,
    })
}

pub(crate) fn from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> SockAddr {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            SockAddr::Inet(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            SockAddr::Inet(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        libc::AF_UNIX => {
            let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
            let max = (len as usize).saturating_sub(std::mem::size_of::<libc::sa_family_t>());
            let bytes: Vec<u8> = sun
                .sun_path
                .iter()
                .take(max)
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect();
            if bytes.is_empty() {
                SockAddr::Unnamed
            } else {
                SockAddr::Unix(PathBuf::from(std::ffi::OsStr::from_bytes(&bytes)))
            }
        }
        _ => SockAddr::Unnamed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_v4_and_v6_targets() {
        assert_eq!(split_host_port("127.0.0.1:80").unwrap(), ("127.0.0.1", 80));
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1", 443));
        assert_eq!(split_host_port("example.com:8080").unwrap(), ("example.com", 8080));
    }

    #[test]
    fn rejects_missing_or_bad_port() {
        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port("[::1]").is_err());
        assert!(split_host_port("host:http").is_err());
    }

    #[test]
    fn literal_addresses_skip_resolver() {
        let addr = crate::block_on(resolve("10.1.2.3", 9, false)).unwrap();
        assert_eq!(addr, "10.1.2.3:9".parse().unwrap());
        let any = crate::block_on(resolve("*", 9, true)).unwrap();
        assert!(any.ip().is_unspecified() && any.is_ipv6());
    }

    #[test]
    fn raw_conversion_preserves_addresses() {
        for text in ["127.0.0.1:8080", "[::1]:9000"] {
            let addr = SockAddr::Inet(text.parse().unwrap());
            let raw = to_raw(&addr).unwrap();
            assert_eq!(from_raw(&raw.storage, raw.len), addr);
        }
        let unix = SockAddr::Unix(PathBuf::from("/tmp/splice.sock"));
        let raw = to_raw(&unix).unwrap();
        assert_eq!(from_raw(&raw.storage, raw.len), unix);
    }
}
