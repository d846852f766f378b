// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A listening server bound to a local interface address, and the
//! per-interface identity assignment used to stamp newly created kernels.

use std::net::SocketAddr;

use ipnet::{Contains, Ipv4Net};
use mio::net::TcpListener;
use mio::Token;

use bsched_kernel::{IdGenerator, KernelId};

pub struct ListeningServer {
    pub token: Token,
    pub bind: SocketAddr,
    /// The local interface's network, used both to decide whether a
    /// destination is local and to pick which server assigns identity.
    pub ifnet: Ipv4Net,
    pub listener: TcpListener,
    ids: IdGenerator,
}

impl ListeningServer {
    pub fn new(token: Token, bind: SocketAddr, ifnet: Ipv4Net, listener: TcpListener) -> Self {
        ListeningServer {
            token,
            bind,
            ifnet,
            listener,
            ids: IdGenerator::new(),
        }
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(v4) => self.ifnet.contains(v4.ip()),
            SocketAddr::V6(_) => false,
        }
    }

    pub fn next_id(&self) -> KernelId {
        self.ids.next_id()
    }
}
