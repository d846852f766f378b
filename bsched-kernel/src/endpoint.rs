// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

/// A network endpoint, tagged on the wire by address family:
/// `family=2` IPv4, `family=10` IPv6, `family=1` local/unix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    /// The virtual address used to dedup inbound connections:
    /// `(remote-ip, local-bind-port)` for IP families, or the raw
    /// path for UNIX-family peers.
    pub fn virtual_address(&self, local_bind_port: u16) -> VirtualAddress {
        match self {
            Endpoint::Ip(addr) => VirtualAddress::Ip(addr.ip(), local_bind_port),
            Endpoint::Unix(path) => VirtualAddress::Unix(path.clone()),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VirtualAddress {
    Ip(std::net::IpAddr, u16),
    Unix(PathBuf),
}
