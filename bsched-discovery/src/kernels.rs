// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Discovery protocol messages: ordinary kernels with stable
//! type-ids. Only [`Probe`] ever crosses the wire and needs a
//! [`bsched_kernel::KernelRegistry`] reader; [`Prober`], [`DiscoveryTimer`]
//! and [`SocketPipelineEvent`] are local-only kernels used to drive the
//! [`crate::Discoverer`] state machine and never get
//! serialized, but still carry their own stable ids for debuggability.

use std::any::Any;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bsched_kernel::{Dispatcher, Endpoint, Kernel, KernelHeader, KernelId, ResultCode};
use bsched_wire::{read_endpoint, write_endpoint};

pub const PROBE_WIRE_TYPE: u16 = 2001;
pub const PROBER_WIRE_TYPE: u16 = 2002;
pub const DISCOVERY_TIMER_WIRE_TYPE: u16 = 2003;
pub const SOCKET_PIPELINE_EVENT_WIRE_TYPE: u16 = 2004;

/// Sent to a candidate or former principal: carries
/// `old-principal`, `new-principal` endpoints and a direction flag.
/// `resignation = true` marks the second, informational probe the
/// [`Prober`] sub-protocol sends to a node's *former* principal; the
/// first probe to the candidate always has `resignation = false`.
#[derive(Debug, Clone)]
pub struct Probe {
    pub header: KernelHeader,
    pub old_principal: Option<Endpoint>,
    pub new_principal: Endpoint,
    pub resignation: bool,
}

impl Probe {
    pub fn new(new_principal: Endpoint, old_principal: Option<Endpoint>, resignation: bool) -> Self {
        Probe {
            header: KernelHeader::default(),
            old_principal,
            new_principal,
            resignation,
        }
    }
}

impl Kernel for Probe {
    fn header(&self) -> &KernelHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }
    fn wire_type(&self) -> u16 {
        PROBE_WIRE_TYPE
    }
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// A probe is always reacted to at the receiving end by the local
    /// [`crate::Discoverer`] principal; it has no independent `act()` logic of its own — it only
    /// ever arrives with `principal_id` already set to the receiver's
    /// well-known [`crate::DISCOVERY_PRINCIPAL_ID`], so the CPU pipeline's
    /// dispatch rule 1 always routes it to `react` rather than `act`.
    fn act(&mut self, dispatcher: &dyn Dispatcher) {
        self.header.result = ResultCode::Error;
        dispatcher.send(Box::new(self.clone()));
    }

    fn react(&mut self, _child: Box<dyn Kernel>, _dispatcher: &dyn Dispatcher) {}

    fn write_payload(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&[self.resignation as u8])?;
        write_endpoint(out, self.old_principal.as_ref())?;
        write_endpoint(out, Some(&self.new_principal))
    }
}

pub fn read_probe(header: KernelHeader, input: &mut dyn Read) -> io::Result<Box<dyn Kernel>> {
    let mut flag = [0u8; 1];
    input.read_exact(&mut flag)?;
    let resignation = flag[0] != 0;
    let old_principal = read_endpoint(input).map_err(io::Error::other)?;
    let new_principal = read_endpoint(input)
        .map_err(io::Error::other)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "probe missing new_principal"))?;
    Ok(Box::new(Probe {
        header,
        old_principal,
        new_principal,
        resignation,
    }))
}

/// The local supervisor of one probe attempt: sends a probe to the
/// candidate and, if that succeeds
/// and an old principal exists, a second probe informing it of
/// resignation. Never serialized — it only ever runs on the node that
/// initiated the probe.
pub struct Prober {
    pub header: KernelHeader,
    pub candidate: SocketAddr,
    pub old_principal: Option<SocketAddr>,
    outstanding: u32,
    first_result: Option<ResultCode>,
}

impl Prober {
    pub fn new(candidate: SocketAddr, old_principal: Option<SocketAddr>) -> Self {
        Prober {
            header: KernelHeader::default(),
            candidate,
            old_principal,
            outstanding: 0,
            first_result: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.first_result, Some(ResultCode::Success))
    }
}

impl Kernel for Prober {
    fn header(&self) -> &KernelHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }
    fn wire_type(&self) -> u16 {
        PROBER_WIRE_TYPE
    }
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn act(&mut self, dispatcher: &dyn Dispatcher) {
        let id = self.header.identity;
        let mut probe = Probe::new(Endpoint::Ip(self.candidate), self.old_principal.map(Endpoint::Ip), false);
        probe.header.destination = Some(Endpoint::Ip(self.candidate));
        probe.header.principal_id = Some(crate::DISCOVERY_PRINCIPAL_ID);
        probe.header.flags.insert(bsched_kernel::KernelFlags::MOVES_SOMEWHERE);
        self.outstanding += 1;
        dispatcher.upstream(id, Box::new(probe));
    }

    fn react(&mut self, child: Box<dyn Kernel>, dispatcher: &dyn Dispatcher) {
        self.outstanding -= 1;
        let Some(probe) = child.as_any().downcast_ref::<Probe>() else {
            self.header.result = ResultCode::Error;
            return;
        };

        if self.first_result.is_none() {
            self.first_result = Some(probe.header.result);
            // Successful first probe and an old principal to notify:
            // fire the resignation probe before going terminal.
            if probe.header.result == ResultCode::Success {
                if let Some(old) = self.old_principal {
                    let id = self.header.identity;
                    let mut resignation = Probe::new(Endpoint::Ip(self.candidate), Some(Endpoint::Ip(old)), true);
                    resignation.header.destination = Some(Endpoint::Ip(old));
                    resignation.header.principal_id = Some(crate::DISCOVERY_PRINCIPAL_ID);
                    resignation.header.flags.insert(bsched_kernel::KernelFlags::MOVES_SOMEWHERE);
                    self.outstanding += 1;
                    dispatcher.upstream(id, Box::new(resignation));
                }
            }
        }

        if self.outstanding == 0 {
            self.header.result = self.first_result.unwrap_or(ResultCode::Error);
        }
    }
}

/// Fired by the timer pipeline to re-trigger `probe_next`. Carries no payload.
pub struct DiscoveryTimer {
    pub header: KernelHeader,
}

impl DiscoveryTimer {
    pub fn new() -> Self {
        DiscoveryTimer {
            header: KernelHeader::default(),
        }
    }
}

impl Default for DiscoveryTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for DiscoveryTimer {
    fn header(&self) -> &KernelHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }
    fn wire_type(&self) -> u16 {
        DISCOVERY_TIMER_WIRE_TYPE
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn act(&mut self, _dispatcher: &dyn Dispatcher) {
        self.header.result = ResultCode::Success;
    }
    fn react(&mut self, _child: Box<dyn Kernel>, _dispatcher: &dyn Dispatcher) {}
}

/// Delivered locally by the socket pipeline when a peer connection closes.
/// `peer` is the virtual address of the closed
/// connection; the `Discoverer` only acts on it when `peer` is its
/// current principal.
pub struct SocketPipelineEvent {
    pub header: KernelHeader,
    pub peer: SocketAddr,
}

impl SocketPipelineEvent {
    pub fn disconnected(peer: SocketAddr) -> Self {
        SocketPipelineEvent {
            header: KernelHeader::default(),
            peer,
        }
    }
}

impl Kernel for SocketPipelineEvent {
    fn header(&self) -> &KernelHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }
    fn wire_type(&self) -> u16 {
        SOCKET_PIPELINE_EVENT_WIRE_TYPE
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn act(&mut self, _dispatcher: &dyn Dispatcher) {
        self.header.result = ResultCode::Success;
    }
    fn react(&mut self, _child: Box<dyn Kernel>, _dispatcher: &dyn Dispatcher) {}
}
