// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The socket pipeline: a single reactor thread driven by
//! `mio::Poll`, owning every listening server and peer connection.
//! Grounded on `qmonnet-dataplane`'s `mio`-based reactor (`os-ext`/`net`
//! features, the same wake-pipe-via-`Waker` idiom used there for
//! cross-thread submission into a poll loop).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use ipnet::Ipv4Net;
use mio::net::{TcpListener as MioTcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, warn};

use bsched_kernel::{
    Dispatcher, Endpoint, IdGenerator, Kernel, KernelFlags, KernelId, KernelRegistry, PrincipalLookup, ResultCode,
    VirtualAddress,
};

use crate::listener::ListeningServer;
use crate::peer::{ConnectionState, PeerConnection, Transport};

/// Reserved for the cross-thread wake pipe: a private wake
/// pipe used by other threads to enqueue kernels.
const WAKE_TOKEN: Token = Token(0);
const FIRST_LISTENER_TOKEN: usize = 1;
const FIRST_PEER_TOKEN: usize = 1 << 16;

/// Connections idle for longer than this are treated as failed.
/// Enforced in software rather than purely via
/// `SO_RCVTIMEO`/`SO_SNDTIMEO` because those timeouts apply to blocking
/// reads, and this reactor's sockets are non-blocking; see
/// `apply_socket_options` for the OS-level knob this complements.
const IDLE_TIMEOUT: Duration = Duration::from_secs(7);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// One bound local interface plus the network it identity-assigns and
/// listens for.
#[derive(Clone, Copy)]
pub struct BindSpec {
    pub bind: SocketAddr,
    pub ifnet: Ipv4Net,
}

pub struct SocketConfig {
    pub binds: Vec<BindSpec>,
    /// If no endpoint is given and use-localhost is on, the submitter
    /// short-circuits to the local CPU pipeline.
    pub use_localhost: bool,
}

enum Command {
    Submit(Box<dyn Kernel>),
    SubmitWithParent(Box<dyn Kernel>, Box<dyn Kernel>),
    Stop,
}

/// The façade-visible handle: spawns the reactor thread and exposes the
/// narrow submission API every other pipeline needs (`send_remote`, plus
/// the carries-parent variant used by `upstream`).
pub struct SocketPipeline {
    commands: Sender<Command>,
    waker: Arc<Waker>,
    worker: Option<JoinHandle<()>>,
}

impl SocketPipeline {
    pub fn start(
        config: SocketConfig,
        registry: Arc<KernelRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        principal_lookup: Arc<dyn PrincipalLookup>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (commands, receiver) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let mut reactor = Reactor::new(poll, config, registry, dispatcher, principal_lookup, Arc::clone(&running))?;

        let worker = std::thread::Builder::new()
            .name("bsched-net".to_string())
            .spawn(move || reactor.run(receiver))
            .expect("failed to spawn socket pipeline reactor thread");

        Ok(SocketPipeline {
            commands,
            waker,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, k: Box<dyn Kernel>) {
        let _ = self.commands.send(Command::Submit(k));
        let _ = self.waker.wake();
    }

    pub fn submit_with_parent(&self, k: Box<dyn Kernel>, parent: Box<dyn Kernel>) {
        let _ = self.commands.send(Command::SubmitWithParent(k, parent));
        let _ = self.waker.wake();
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        let _ = self.waker.wake();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the reactor thread owns exclusively: the peer
/// map is confined to the socket-pipeline thread.
struct Reactor {
    poll: Poll,
    listeners: Vec<ListeningServer>,
    use_localhost: bool,
    registry: Arc<KernelRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    principal_lookup: Arc<dyn PrincipalLookup>,
    running: Arc<AtomicBool>,

    peers: HashMap<VirtualAddress, Arc<Mutex<PeerConnection>>>,
    /// Insertion order for the round-robin cursor: a plain `Vec` gives a
    /// stable cursor index that a `HashMap` alone cannot.
    peer_order: Vec<VirtualAddress>,
    cursor: usize,
    next_peer_token: usize,
    unix_ids: IdGenerator,
    last_activity: HashMap<VirtualAddress, Instant>,
}

impl Reactor {
    fn new(
        poll: Poll,
        config: SocketConfig,
        registry: Arc<KernelRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        principal_lookup: Arc<dyn PrincipalLookup>,
        running: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let mut listeners = Vec::with_capacity(config.binds.len());
        for (index, spec) in config.binds.into_iter().enumerate() {
            let token = Token(FIRST_LISTENER_TOKEN + index);
            let mut listener = MioTcpListener::bind(spec.bind)?;
            poll.registry().register(&mut listener, token, Interest::READABLE)?;
            listeners.push(ListeningServer::new(token, spec.bind, spec.ifnet, listener));
        }

        Ok(Reactor {
            poll,
            listeners,
            use_localhost: config.use_localhost,
            registry,
            dispatcher,
            principal_lookup,
            running,
            peers: HashMap::new(),
            peer_order: Vec::new(),
            cursor: 0,
            next_peer_token: FIRST_PEER_TOKEN,
            unix_ids: IdGenerator::new(),
            last_activity: HashMap::new(),
        })
    }

    fn run(&mut self, commands: Receiver<Command>) {
        let mut events = Events::with_capacity(256);
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("socket pipeline poll error: {e}");
                continue;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    self.drain_commands(&commands);
                    continue;
                }
                if let Some(listener_index) = self.listener_index(token) {
                    self.accept_loop(listener_index);
                    continue;
                }
                if let Some(addr) = self.virtual_address_for_token(token) {
                    if event.is_readable() {
                        self.on_readable(&addr);
                    }
                    if event.is_writable() {
                        self.on_writable(&addr);
                    }
                }
            }

            self.reap_idle_connections();
        }

        for addr in self.peer_order.clone() {
            self.teardown(&addr);
        }
    }

    fn drain_commands(&mut self, commands: &Receiver<Command>) {
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit(k) => self.route(k, None),
                Command::SubmitWithParent(k, parent) => self.route(k, Some(parent)),
                Command::Stop => self.running.store(false, Ordering::SeqCst),
            }
        }
    }

    fn listener_index(&self, token: Token) -> Option<usize> {
        self.listeners.iter().position(|l| l.token == token)
    }

    fn virtual_address_for_token(&self, token: Token) -> Option<VirtualAddress> {
        self.peer_order.iter().find(|addr| {
            self.peers
                .get(*addr)
                .map(|conn| conn.lock().expect("peer connection mutex poisoned").token == token)
                .unwrap_or(false)
        }).cloned()
    }

    // ---- accept ----------------------------------------------------

    fn accept_loop(&mut self, listener_index: usize) {
        loop {
            let accepted = self.listeners[listener_index].listener.accept();
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            };
            let local_port = self.listeners[listener_index].bind.port();
            let vaddr = Endpoint::Ip(remote).virtual_address(local_port);

            if self.peers.contains_key(&vaddr) {
                // Contested reconnect: first-connection-wins, the new
                // socket is simply dropped here (see DESIGN.md).
                debug!("dropping duplicate inbound connection from {remote}");
                continue;
            }

            if let Err(e) = apply_socket_options(&stream) {
                warn!("failed to apply socket options to accepted connection from {remote}: {e}");
            }

            self.insert_peer(vaddr, remote, Transport::Tcp(stream), ConnectionState::Established);
        }
    }

    fn insert_peer(&mut self, vaddr: VirtualAddress, remote: SocketAddr, mut transport: Transport, state: ConnectionState) {
        let token = Token(self.next_peer_token);
        self.next_peer_token += 1;

        let interest = match state {
            ConnectionState::Connecting => Interest::READABLE | Interest::WRITABLE,
            ConnectionState::Established => Interest::READABLE,
        };
        if let Err(e) = self.poll.registry().register(&mut transport, token, interest) {
            warn!("failed to register peer connection for {remote}: {e}");
            return;
        }

        let conn = PeerConnection::new(token, remote, transport, state);
        self.peers.insert(vaddr.clone(), Arc::new(Mutex::new(conn)));
        self.peer_order.push(vaddr.clone());
        self.last_activity.insert(vaddr, Instant::now());
    }

    // ---- readable / writable ----------------------------------------

    fn on_writable(&mut self, addr: &VirtualAddress) {
        let Some(conn) = self.peers.get(addr).cloned() else { return };
        let mut conn = conn.lock().expect("peer connection mutex poisoned");
        if conn.state == ConnectionState::Connecting {
            match conn.transport_mut() {
                Transport::Tcp(stream) => match stream.take_error() {
                    Ok(None) => conn.state = ConnectionState::Established,
                    _ => {
                        drop(conn);
                        self.teardown(addr);
                        return;
                    }
                },
                #[cfg(unix)]
                Transport::Unix(_) => conn.state = ConnectionState::Established,
            }
        }
        let _ = conn.flush();
        self.last_activity.insert(addr.clone(), Instant::now());
    }

    fn on_readable(&mut self, addr: &VirtualAddress) {
        let Some(conn) = self.peers.get(addr).cloned() else { return };
        let decoded = {
            let mut conn = conn.lock().expect("peer connection mutex poisoned");
            match conn.framed_mut().fill() {
                Ok(_) => {}
                Err(e) => {
                    drop(conn);
                    debug!("peer {addr:?} read error, tearing down: {e}");
                    self.teardown(addr);
                    return;
                }
            }
            drain_packets(conn.framed_mut(), &self.registry)
        };

        self.last_activity.insert(addr.clone(), Instant::now());

        for result in decoded {
            match result {
                Ok((kernel, parent)) => self.receive(addr, kernel, parent),
                Err(e) => {
                    warn!("peer {addr:?} sent an unreadable packet, tearing down: {e}");
                    self.teardown(addr);
                    return;
                }
            }
        }
    }

    /// Handles a kernel decoded off the wire.
    fn receive(&mut self, addr: &VirtualAddress, mut k: Box<dyn Kernel>, parent: Option<Box<dyn Kernel>>) {
        if let Some(parent) = parent {
            // The parent's identity was assigned by its origin node and
            // is already present in `k.principal_id`; suspend it here so
            // the ordinary dispatch path finds it.
            self.dispatcher.register_principal(parent);
        }

        k.header_mut().source = Some(virtual_address_to_endpoint(addr));

        if k.header().flags.contains(KernelFlags::MOVES_DOWNSTREAM) {
            if let Some(conn) = self.peers.get(addr) {
                let matched = {
                    let mut conn = conn.lock().expect("peer connection mutex poisoned");
                    take_matching(&mut conn.upstream_sent, k.header().identity)
                };
                if let Some(sent) = matched {
                    // The reply's own principal_id (set by the remote
                    // node's `finish_terminal`) is meaningless here; what
                    // matters is *our* local bookkeeping of who
                    // dispatched `sent`. Clearing `source` is the fix
                    // that keeps this from bouncing back over the wire
                    // once the locally-revived principal completes (see
                    // DESIGN.md).
                    k.header_mut().principal_id = sent.header().parent_id;
                    k.header_mut().source = None;
                    self.dispatcher.send_local(k);
                    return;
                }
            }
        } else if let Some(principal_id) = k.header().principal_id {
            if !self.principal_lookup.principal_exists(principal_id) {
                k.header_mut().result = ResultCode::NoPrincipalFound;
                let destination = k.header().source.clone();
                k.header_mut().destination = destination;
                self.route(k, None);
                return;
            }
        }

        self.dispatcher.send_local(k);
    }

    // ---- submitter-path routing --------------------------------------

    /// Routes a kernel submitted by the local CPU or timer pipeline to
    /// its destination, dialing a new connection if needed.
    fn route(&mut self, mut k: Box<dyn Kernel>, embedded_parent: Option<Box<dyn Kernel>>) {
        let flags = k.header().flags;

        if let Some(Endpoint::Ip(dest)) = k.header().destination.clone() {
            if self.listeners.iter().any(|l| l.contains(dest)) {
                self.dispatcher.send_local(k);
                return;
            }
        }

        if flags.contains(KernelFlags::MOVES_EVERYWHERE) {
            self.fan_out(k.as_ref(), embedded_parent.as_deref());
            return;
        }

        if flags.contains(KernelFlags::MOVES_UPSTREAM) && k.header().destination.is_none() {
            match self.next_round_robin_peer() {
                Some(addr) => {
                    self.ensure_identity(k.as_mut());
                    self.deliver(&addr, k, embedded_parent);
                }
                None if self.use_localhost => self.dispatcher.send_local(k),
                None => {
                    k.header_mut().result = ResultCode::NoUpstreamAvailable;
                    self.dispatcher.send_local(k);
                }
            }
            return;
        }

        if flags.contains(KernelFlags::MOVES_DOWNSTREAM) && k.header().source.is_none() && k.header().destination.is_none() {
            self.dispatcher.send_local(k);
            return;
        }

        if k.header().destination.is_none() {
            k.header_mut().destination = k.header().source.clone();
        }
        self.ensure_identity(k.as_mut());
        let Some(Endpoint::Ip(dest)) = k.header().destination.clone() else {
            warn!("kernel has no usable destination; dropping");
            return;
        };
        let vaddr = Endpoint::Ip(dest).virtual_address(dest.port());
        self.deliver(&vaddr, k, embedded_parent);
    }

    fn fan_out(&mut self, k: &dyn Kernel, parent: Option<&dyn Kernel>) {
        for addr in self.peer_order.clone() {
            if let Some(conn) = self.peers.get(&addr) {
                let mut conn = conn.lock().expect("peer connection mutex poisoned");
                if let Err(e) = conn.framed_mut().write_kernel(k, parent) {
                    warn!("fan-out write to {addr:?} failed: {e}");
                    continue;
                }
                let _ = conn.flush();
            }
        }
    }

    fn deliver(&mut self, vaddr: &VirtualAddress, k: Box<dyn Kernel>, embedded_parent: Option<Box<dyn Kernel>>) {
        if !self.peers.contains_key(vaddr) {
            let VirtualAddress::Ip(ip, port) = vaddr else {
                warn!("cannot dial a unix peer without an existing connection");
                return;
            };
            let remote = SocketAddr::new(*ip, *port);
            match TcpStream::connect(remote) {
                Ok(stream) => {
                    if let Err(e) = apply_socket_options(&stream) {
                        warn!("failed to apply socket options to outbound connection to {remote}: {e}");
                    }
                    self.insert_peer(vaddr.clone(), remote, Transport::Tcp(stream), ConnectionState::Connecting);
                }
                Err(e) => {
                    warn!("failed to connect to {remote}: {e}");
                    return;
                }
            }
        }

        if let Some(conn) = self.peers.get(vaddr) {
            let mut conn = conn.lock().expect("peer connection mutex poisoned");
            if let Err(e) = conn.send(k, embedded_parent) {
                warn!("send to {vaddr:?} failed: {e}");
                let addr = vaddr.clone();
                drop(conn);
                self.teardown(&addr);
            } else {
                self.last_activity.insert(vaddr.clone(), Instant::now());
            }
        }
    }

    fn ensure_identity(&self, k: &mut dyn Kernel) {
        if !k.header().identity.is_assigned() {
            k.header_mut().identity = self.identity_for(k.header().destination.as_ref());
        }
    }

    fn identity_for(&self, destination: Option<&Endpoint>) -> KernelId {
        let ip = match destination {
            Some(Endpoint::Ip(addr)) => Some(*addr),
            _ => None,
        };
        if let Some(addr) = ip {
            if let Some(listener) = self.listeners.iter().find(|l| l.contains(addr)) {
                return listener.next_id();
            }
            if let Some(first) = self.listeners.first() {
                return first.next_id();
            }
        }
        self.unix_ids.next_id()
    }

    fn next_round_robin_peer(&mut self) -> Option<VirtualAddress> {
        if self.peer_order.is_empty() {
            self.cursor = 0;
            return None;
        }
        self.cursor %= self.peer_order.len();
        let start = self.cursor;
        loop {
            let addr = self.peer_order[self.cursor].clone();
            let running = self
                .peers
                .get(&addr)
                .map(|c| c.lock().expect("peer connection mutex poisoned").state == ConnectionState::Established)
                .unwrap_or(false);
            self.cursor = (self.cursor + 1) % self.peer_order.len();
            if running {
                return Some(addr);
            }
            if self.cursor == start {
                return None;
            }
        }
    }

    // ---- recovery ------------------------------------------------------

    fn reap_idle_connections(&mut self) {
        let now = Instant::now();
        let stale: Vec<VirtualAddress> = self
            .last_activity
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > IDLE_TIMEOUT)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in stale {
            debug!("peer {addr:?} idle past the socket timeout, tearing down");
            self.teardown(&addr);
        }
    }

    /// Tears down a peer connection and bounces its in-flight sends back
    /// through recovery.
    fn teardown(&mut self, addr: &VirtualAddress) {
        let Some(conn) = self.peers.remove(addr) else { return };
        self.last_activity.remove(addr);
        if let Some(pos) = self.peer_order.iter().position(|a| a == addr) {
            self.peer_order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
        self.dispatcher.peer_disconnected(virtual_address_to_endpoint(addr));

        let mut conn = match Arc::try_unwrap(conn) {
            Ok(mutex) => mutex.into_inner().expect("peer connection mutex poisoned"),
            Err(shared) => {
                // Still referenced elsewhere (e.g. a concurrent
                // in-flight send from another pipeline); drain what we
                // can without taking exclusive ownership of the buffers.
                let mut guard = shared.lock().expect("peer connection mutex poisoned");
                let _ = guard.framed_mut().fill();
                while let Ok(Some(_)) = guard.framed_mut().read_kernel(&self.registry) {}
                return;
            }
        };

        // 1. Drain any remaining readable bytes once.
        let _ = conn.framed_mut().fill();
        let decoded = drain_packets(conn.framed_mut(), &self.registry);

        // 2. upstream-sent.
        for k in conn.upstream_sent.drain(..) {
            self.recover_upstream_sent(k);
        }

        // 3. downstream-sent.
        for (mut k, parent) in conn.downstream_sent.drain(..) {
            let parent_id = parent.header().identity;
            self.dispatcher.register_principal(parent);
            k.header_mut().principal_id = Some(parent_id);
            self.dispatcher.send_local(k);
        }

        drop(conn);

        // Anything decoded in the drain above still deserves normal
        // receive-path handling before it's lost.
        for result in decoded {
            if let Ok((kernel, parent)) = result {
                self.receive(addr, kernel, parent);
            }
        }
    }

    fn recover_upstream_sent(&mut self, mut k: Box<dyn Kernel>) {
        let flags = k.header().flags;
        if flags.contains(KernelFlags::MOVES_UPSTREAM) {
            // The embedded parent (if any) was handed to whichever peer
            // the first write reached; it cannot be re-embedded for a
            // different peer, so carries-parent is dropped on
            // resubmission (see DESIGN.md's resolution of the
            // carries-parent / reconnect interaction).
            k.header_mut().flags.remove(KernelFlags::CARRIES_PARENT);
            self.dispatcher.send_remote(k);
        } else if flags.contains(KernelFlags::MOVES_SOMEWHERE) {
            k.header_mut().result = ResultCode::EndpointNotConnected;
            k.header_mut().principal_id = k.header().parent_id;
            self.dispatcher.send_local(k);
        }
        // Else: delete (drop).
    }
}

fn drain_packets(
    framed: &mut bsched_wire::FramedStream<Transport>,
    registry: &KernelRegistry,
) -> Vec<Result<(Box<dyn Kernel>, Option<Box<dyn Kernel>>), bsched_wire::WireError>> {
    let mut out = Vec::new();
    loop {
        match framed.read_kernel(registry) {
            Ok(Some(pair)) => out.push(Ok(pair)),
            Ok(None) => break,
            Err(e) => {
                out.push(Err(e));
                break;
            }
        }
    }
    out
}

fn take_matching(buffer: &mut VecDeque<Box<dyn Kernel>>, identity: KernelId) -> Option<Box<dyn Kernel>> {
    let pos = buffer.iter().position(|k| k.header().identity == identity)?;
    buffer.remove(pos)
}

fn virtual_address_to_endpoint(addr: &VirtualAddress) -> Endpoint {
    match addr {
        VirtualAddress::Ip(ip, port) => Endpoint::Ip(SocketAddr::new(*ip, *port)),
        VirtualAddress::Unix(path) => Endpoint::Unix(path.clone()),
    }
}

/// Applies the OS-level knobs std doesn't expose directly to back the
/// software idle timeout. `set_nodelay` is the one universally-useful option
/// here; `TCP_USER_TIMEOUT` (Linux-only) backs the software idle check
/// above with an OS-enforced bound on unacknowledged writes.
fn apply_socket_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    #[cfg(target_os = "linux")]
    {
        let socket = socket2::SockRef::from(stream);
        let _ = socket.set_tcp_user_timeout(Some(IDLE_TIMEOUT));
    }
    Ok(())
}
