// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The discovery / hierarchy state machine: a single
//! long-lived kernel, [`Discoverer`], suspended under the well-known
//! principal id [`DISCOVERY_PRINCIPAL_ID`] for the lifetime of the
//! process. It never goes terminal — probe results, timer fires and
//! peer-disconnect notifications all arrive as children via `react` and
//! mutate its [`Hierarchy`] directly, grounded on
//! `original_source/src/apps/discovery/discovery.hh`'s `Discovery` class.

mod address_interval;
mod hierarchy;
mod kernels;
mod scan_order;

pub use address_interval::{AddressInterval, EmptyInterval};
pub use hierarchy::{Hierarchy, HierarchyNode};
pub use kernels::{
    read_probe, DiscoveryTimer, Probe, Prober, SocketPipelineEvent, DISCOVERY_TIMER_WIRE_TYPE,
    PROBER_WIRE_TYPE, PROBE_WIRE_TYPE, SOCKET_PIPELINE_EVENT_WIRE_TYPE,
};
pub use scan_order::PrincipalScanOrder;

use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use bsched_kernel::{Dispatcher, Endpoint, Kernel, KernelFlags, KernelHeader, KernelId, ResultCode};

/// Well-known principal id every node's `Discoverer` suspends itself
/// under: an inbound `Probe`
/// always addresses this id directly rather than discovering it
/// dynamically, since every node plays the same discovery role. Chosen
/// well below [`bsched_kernel::IdGenerator`]'s range, which seeds its
/// counter with a random nonzero 32-bit prefix in the high half.
pub const DISCOVERY_PRINCIPAL_ID: KernelId = KernelId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Probing,
    Waiting,
}

/// Converts a 1-based scan position within `network` into the endpoint a
/// candidate principal at that position would bind its discovery
/// listener on.
fn address_for_position(network_start: u32, discovery_port: u16, position: u32) -> SocketAddr {
    let addr_u32 = network_start.wrapping_add(position - 1);
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::from(addr_u32)), discovery_port)
}

/// The inverse of [`address_for_position`]: this host's 1-based position
/// within `network`.
fn position_of(network_start: u32, addr: Ipv4Addr) -> u32 {
    u32::from(addr).wrapping_sub(network_start).wrapping_add(1)
}

/// The local node's discovery state machine: probing of
/// candidate principals, acceptance/rejection of subordinates, and
/// reaction to connection-loss events from the socket pipeline. Runs as
/// an ordinary suspended kernel under [`DISCOVERY_PRINCIPAL_ID`] — see
/// the module doc.
pub struct Discoverer {
    header: KernelHeader,
    state: ScanState,
    hierarchy: Hierarchy,
    network_interval: AddressInterval,
    scan: PrincipalScanOrder,
    discovery_port: u16,
    probe_interval: Duration,
}

impl Discoverer {
    /// `network` is the local interface's network + netmask; `bind` is
    /// this node's own discovery endpoint, which must fall inside
    /// `network`. Panics if `network` is an
    /// empty/degenerate prefix — a misconfiguration worth failing
    /// loudly on at start-up rather than silently discovering nothing.
    pub fn new(network: Ipv4Net, bind: SocketAddr, discovery_port: u16, probe_interval: Duration) -> Self {
        let network_start = u32::from(network.network());
        // Number of addresses in the subnet, as a u64 so a /0 network
        // (2^32 addresses) doesn't overflow; clamped to u32::MAX for the
        // interval's end, which only ever needs relative arithmetic.
        let host_count = (1u64 << (32 - network.prefix_len() as u32)).min(u32::MAX as u64);
        let network_end = network_start as u64 + host_count;
        let network_interval =
            AddressInterval::new(network_start, network_end.min(u32::MAX as u64) as u32).expect("configured network must be non-empty");

        let self_ip = match bind.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => panic!("discovery only scans IPv4 subnets"),
        };
        let self_position = position_of(network_start, self_ip).max(1);
        let last_position = host_count.min(u32::MAX as u64).max(1) as u32;
        let scan = PrincipalScanOrder::new(self_position, last_position);

        let mut header = KernelHeader::default();
        header.identity = DISCOVERY_PRINCIPAL_ID;

        Discoverer {
            header,
            state: ScanState::Waiting,
            hierarchy: Hierarchy::new(network, bind),
            network_interval,
            scan,
            discovery_port,
            probe_interval,
        }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    fn candidate_address(&self, position: u32) -> SocketAddr {
        address_for_position(self.network_interval.start(), self.discovery_port, position)
    }

    /// Probes the next candidate: set state `probing`; if the scan
    /// iterator is exhausted, back off for `probe_interval` and go
    /// `waiting`; otherwise issue a `Prober` kernel at the next
    /// candidate.
    fn probe_next(&mut self, dispatcher: &dyn Dispatcher) {
        self.state = ScanState::Probing;
        match self.scan.next() {
            None => {
                self.state = ScanState::Waiting;
                self.arm_timer(dispatcher);
            }
            Some(position) => {
                let candidate = self.candidate_address(position);
                let old_principal = self.hierarchy.principal().map(|p| p.address);
                debug!(%candidate, ?old_principal, "probing candidate principal");
                let prober = Prober::new(candidate, old_principal);
                dispatcher.upstream(self.header.identity, Box::new(prober));
            }
        }
    }

    fn arm_timer(&self, dispatcher: &dyn Dispatcher) {
        let mut timer = Box::new(DiscoveryTimer::new());
        timer.header.principal_id = Some(self.header.identity);
        dispatcher.schedule_after(timer, self.probe_interval);
    }

    fn on_prober_returned(&mut self, prober: &Prober, dispatcher: &dyn Dispatcher) {
        if prober.succeeded() {
            info!(candidate = %prober.candidate, "accepted new principal");
            self.hierarchy.set_principal(prober.candidate);
            self.state = ScanState::Waiting;
            // Re-probe later in case a closer principal appears.
            self.arm_timer(dispatcher);
        } else {
            self.probe_next(dispatcher);
        }
    }

    /// Handles a peer attempting to make us its principal, or notifying
    /// us of its resignation. Returns the outcome so the caller can
    /// build and ship the reply.
    fn on_inbound_probe(&mut self, probe: &Probe, sender: SocketAddr) -> ResultCode {
        if self.hierarchy.is_principal(sender) {
            // Principals may not become our subordinates.
            return ResultCode::Error;
        }

        let our_bind = self.hierarchy.bind();
        if probe.old_principal != Some(probe.new_principal.clone()) {
            if probe.new_principal == Endpoint::Ip(our_bind) {
                self.hierarchy.add_subordinate(sender);
            } else if probe.old_principal == Some(Endpoint::Ip(our_bind)) {
                self.hierarchy.remove_subordinate(sender);
            }
        }
        ResultCode::Success
    }

    fn on_disconnect(&mut self, peer: SocketAddr, dispatcher: &dyn Dispatcher) {
        if self.hierarchy.is_principal(peer) {
            warn!(%peer, "principal disconnected, re-probing");
            self.hierarchy.unset_principal();
            self.probe_next(dispatcher);
        }
    }
}

impl Kernel for Discoverer {
    fn header(&self) -> &KernelHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }
    fn wire_type(&self) -> u16 {
        // Never serialized — the Discoverer itself never crosses the
        // wire, only the `Probe`/`Prober`/`DiscoveryTimer`/
        // `SocketPipelineEvent` kernels it exchanges with the pipelines.
        0
    }
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Probes the first candidate. Invoked once,
    /// when the daemon submits the Discoverer for the first time.
    fn act(&mut self, dispatcher: &dyn Dispatcher) {
        self.probe_next(dispatcher);
    }

    fn react(&mut self, child: Box<dyn Kernel>, dispatcher: &dyn Dispatcher) {
        if let Some(prober) = child.as_any().downcast_ref::<Prober>() {
            self.on_prober_returned(prober, dispatcher);
            return;
        }

        if let Some(probe) = child.as_any().downcast_ref::<Probe>() {
            let sender = match probe.header().source.clone() {
                Some(Endpoint::Ip(addr)) => addr,
                _ => {
                    warn!("inbound probe with no wire source, dropping");
                    return;
                }
            };
            let outcome = self.on_inbound_probe(probe, sender);
            let mut reply = Probe::new(probe.new_principal.clone(), probe.old_principal.clone(), probe.resignation);
            reply.header.identity = probe.header.identity;
            reply.header.result = outcome;
            reply.header.destination = Some(Endpoint::Ip(sender));
            reply.header.flags = KernelFlags::MOVES_DOWNSTREAM;
            dispatcher.send_remote(Box::new(reply));
            return;
        }

        if let Some(_timer) = child.as_any().downcast_ref::<DiscoveryTimer>() {
            if self.state == ScanState::Waiting {
                self.probe_next(dispatcher);
            }
            return;
        }

        if let Some(event) = child.as_any().downcast_ref::<SocketPipelineEvent>() {
            self.on_disconnect(event.peer, dispatcher);
            return;
        }

        warn!("Discoverer received a child kernel of unrecognized type");
    }
}
