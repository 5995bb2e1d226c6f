//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-platform socket options needed by BGP transport sessions.
//!
//! The protocol code only talks to the [`SocketOptions`] trait. Linux
//! implements every option through `setsockopt(2)`; on other platforms the
//! options report [`std::io::ErrorKind::Unsupported`] so that sessions still
//! come up without TTL security or TCP-MD5.

use std::net::SocketAddr;

pub use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::ip::AddressFamily;

// Useful type definition.
type Result<T> = std::io::Result<T>;

// Transport socket options used by BGP sessions.
pub trait SocketOptions {
    // Sets the unicast TTL (IPv4) or hop limit (IPv6) of outgoing packets.
    fn set_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()>;

    // Sets the minimum TTL (or hop count) accepted on incoming packets
    // (GTSM, RFC 5082).
    fn set_min_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()>;

    // Installs (or removes, when `password` is `None`) the TCP-MD5
    // signature key for the given remote address (RFC 2385).
    fn set_md5_signature(
        &self,
        dst: &SocketAddr,
        password: Option<&str>,
    ) -> Result<()>;

    // Restricts an IPv6 socket to IPv6 traffic so that a wildcard IPv4
    // listener can share the same port.
    fn set_ipv6_only(&self, enable: bool) -> Result<()>;
}

// ===== Linux implementation =====

#[cfg(target_os = "linux")]
mod os {
    #![allow(unsafe_code)]

    use std::net::SocketAddr;
    use std::os::raw::{c_int, c_void};
    use std::os::unix::io::AsRawFd;

    use super::Result;
    use crate::ip::AddressFamily;

    // FFI struct used to set the TCP_MD5SIG socket option.
    #[repr(C)]
    #[derive(Copy, Clone)]
    struct tcp_md5sig {
        tcpm_addr: nix::sys::socket::SockaddrStorage,
        tcpm_flags: u8,
        tcpm_prefixlen: u8,
        tcpm_keylen: u16,
        __tcpm_pad: u32,
        tcpm_key: [u8; 108],
    }

    pub(super) fn set_ttl<F: AsRawFd>(
        sock: &F,
        af: AddressFamily,
        ttl: u8,
    ) -> Result<()> {
        let (level, name) = match af {
            AddressFamily::Ipv4 => (libc::IPPROTO_IP, libc::IP_TTL),
            AddressFamily::Ipv6 => {
                (libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS)
            }
        };
        setsockopt_int(sock, level, name, ttl as c_int)
    }

    pub(super) fn set_min_ttl<F: AsRawFd>(
        sock: &F,
        af: AddressFamily,
        ttl: u8,
    ) -> Result<()> {
        let (level, name) = match af {
            AddressFamily::Ipv4 => (libc::IPPROTO_IP, libc::IP_MINTTL),
            AddressFamily::Ipv6 => {
                (libc::IPPROTO_IPV6, libc::IPV6_MINHOPCOUNT)
            }
        };
        setsockopt_int(sock, level, name, ttl as c_int)
    }

    pub(super) fn set_md5_signature<F: AsRawFd>(
        sock: &F,
        dst: &SocketAddr,
        password: Option<&str>,
    ) -> Result<()> {
        let mut optval = tcp_md5sig {
            tcpm_addr: (*dst).into(),
            tcpm_flags: 0,
            tcpm_prefixlen: 0,
            tcpm_keylen: 0,
            __tcpm_pad: 0,
            tcpm_key: [0; 108],
        };
        if let Some(password) = password {
            if password.len() > optval.tcpm_key.len() {
                return Err(std::io::Error::from(
                    std::io::ErrorKind::InvalidInput,
                ));
            }
            optval.tcpm_keylen = password.len() as u16;
            optval.tcpm_key[..password.len()]
                .copy_from_slice(password.as_bytes());
        }

        setsockopt(
            sock,
            libc::IPPROTO_TCP,
            libc::TCP_MD5SIG,
            &optval as *const _ as *const c_void,
            std::mem::size_of::<tcp_md5sig>() as libc::socklen_t,
        )
    }

    pub(super) fn set_ipv6_only<F: AsRawFd>(
        sock: &F,
        enable: bool,
    ) -> Result<()> {
        setsockopt_int(
            sock,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            enable as c_int,
        )
    }

    fn setsockopt_int<F: AsRawFd>(
        sock: &F,
        level: c_int,
        name: c_int,
        value: c_int,
    ) -> Result<()> {
        setsockopt(
            sock,
            level,
            name,
            &value as *const _ as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    }

    fn setsockopt<F: AsRawFd>(
        sock: &F,
        level: c_int,
        name: c_int,
        optval: *const c_void,
        optlen: libc::socklen_t,
    ) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(sock.as_raw_fd(), level, name, optval, optlen)
        };
        if ret == -1 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }
}

// ===== fallback implementation =====

#[cfg(not(target_os = "linux"))]
mod os {
    use std::net::SocketAddr;

    use super::Result;
    use crate::ip::AddressFamily;

    fn unsupported() -> std::io::Error {
        std::io::Error::from(std::io::ErrorKind::Unsupported)
    }

    pub(super) fn set_ttl<F>(_: &F, _: AddressFamily, _: u8) -> Result<()> {
        Err(unsupported())
    }

    pub(super) fn set_min_ttl<F>(
        _: &F,
        _: AddressFamily,
        _: u8,
    ) -> Result<()> {
        Err(unsupported())
    }

    pub(super) fn set_md5_signature<F>(
        _: &F,
        _: &SocketAddr,
        _: Option<&str>,
    ) -> Result<()> {
        Err(unsupported())
    }

    pub(super) fn set_ipv6_only<F>(_: &F, _: bool) -> Result<()> {
        Err(unsupported())
    }
}

// ===== impl TcpSocket =====

impl SocketOptions for TcpSocket {
    fn set_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()> {
        os::set_ttl(self, af, ttl)
    }

    fn set_min_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()> {
        os::set_min_ttl(self, af, ttl)
    }

    fn set_md5_signature(
        &self,
        dst: &SocketAddr,
        password: Option<&str>,
    ) -> Result<()> {
        os::set_md5_signature(self, dst, password)
    }

    fn set_ipv6_only(&self, enable: bool) -> Result<()> {
        os::set_ipv6_only(self, enable)
    }
}

// ===== impl TcpStream =====

impl SocketOptions for TcpStream {
    fn set_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()> {
        os::set_ttl(self, af, ttl)
    }

    fn set_min_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()> {
        os::set_min_ttl(self, af, ttl)
    }

    fn set_md5_signature(
        &self,
        dst: &SocketAddr,
        password: Option<&str>,
    ) -> Result<()> {
        os::set_md5_signature(self, dst, password)
    }

    fn set_ipv6_only(&self, enable: bool) -> Result<()> {
        os::set_ipv6_only(self, enable)
    }
}

// ===== impl TcpListener =====

impl SocketOptions for TcpListener {
    fn set_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()> {
        os::set_ttl(self, af, ttl)
    }

    fn set_min_ttl(&self, af: AddressFamily, ttl: u8) -> Result<()> {
        os::set_min_ttl(self, af, ttl)
    }

    fn set_md5_signature(
        &self,
        dst: &SocketAddr,
        password: Option<&str>,
    ) -> Result<()> {
        os::set_md5_signature(self, dst, password)
    }

    fn set_ipv6_only(&self, enable: bool) -> Result<()> {
        os::set_ipv6_only(self, enable)
    }
}
