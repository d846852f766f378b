// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A single peer connection handler: maps a peer endpoint to its
//! connection handler, the framed stream plus the two recovery buffers
//! the send path feeds.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::event::Source;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::{Interest, Registry, Token};

use bsched_kernel::{Kernel, KernelFlags};
use bsched_wire::FramedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A `connect()` was issued but the first writable event hasn't
    /// arrived yet.
    Connecting,
    Established,
}

/// Either transport a peer connection can ride on: IPv4 / IPv6 / local-unix
/// address families.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

impl Source for Transport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            Transport::Unix(s) => s.register(registry, token, interests),
        }
    }
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            Transport::Unix(s) => s.reregister(registry, token, interests),
        }
    }
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            Transport::Unix(s) => s.deregister(registry),
        }
    }
}

/// Peers hold shared ownership of connection handlers via reference-counted
/// handles: the reactor hands these out to other pipelines as
/// `Arc<Mutex<PeerConnection>>` (see `reactor.rs`); this type itself only
/// needs to be `Send`, not internally synchronized.
pub struct PeerConnection {
    pub token: Token,
    pub remote: SocketAddr,
    pub state: ConnectionState,
    framed: FramedStream<Transport>,
    /// Kernels sent from here moving upstream or somewhere, awaiting a
    /// reply (send path, receive path rule 2).
    pub upstream_sent: VecDeque<Box<dyn Kernel>>,
    /// Reply kernels sent downstream that carry a parent, paired with the
    /// embedded parent kept around for recovery re-injection.
    pub downstream_sent: VecDeque<(Box<dyn Kernel>, Box<dyn Kernel>)>,
}

impl PeerConnection {
    pub fn new(token: Token, remote: SocketAddr, transport: Transport, state: ConnectionState) -> Self {
        PeerConnection {
            token,
            remote,
            state,
            framed: FramedStream::new(transport),
            upstream_sent: VecDeque::new(),
            downstream_sent: VecDeque::new(),
        }
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        self.framed.get_mut()
    }

    pub fn framed_mut(&mut self) -> &mut FramedStream<Transport> {
        &mut self.framed
    }

    /// Writes `k` to this peer and records it for recovery. `embedded_parent`
    /// is `Some` only when `k.flags.CARRIES_PARENT` is set; the caller
    /// (reactor routing) is responsible for supplying it.
    pub fn send(&mut self, k: Box<dyn Kernel>, embedded_parent: Option<Box<dyn Kernel>>) -> io::Result<()> {
        let flags = k.header().flags;

        self.framed.write_kernel(k.as_ref(), embedded_parent.as_deref())?;

        if flags.intersects(KernelFlags::MOVES_UPSTREAM | KernelFlags::MOVES_SOMEWHERE) {
            self.upstream_sent.push_back(k);
        } else if flags.contains(KernelFlags::MOVES_DOWNSTREAM) && flags.contains(KernelFlags::CARRIES_PARENT) {
            let parent = embedded_parent.expect("CARRIES_PARENT requires an embedded parent");
            self.downstream_sent.push_back((k, parent));
        }
        // Else: k is not move-everywhere (that case fans out across every
        // handler and never reaches a single `send`) and isn't buffered
        // for recovery; it is simply dropped here once written.

        self.framed.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.framed.flush()?;
        Ok(())
    }
}
