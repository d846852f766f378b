// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A kernel dispatched upstream to a specific peer travels over a real
//! TCP connection, runs on the peer, and its reply travels back over
//! the same connection to complete the kernel that dispatched it.

mod common;

use std::any::Any;
use std::io::{self, Write};

use bsched_kernel::{Dispatcher, Endpoint, EchoKernel, Kernel, KernelFlags, KernelHeader, ResultCode};

/// Dispatches one fixed child kernel to a named peer on its first
/// `act()`, then forwards whatever the child's reply carries to
/// `graceful_shutdown` once it reacts — standing in for any supervisor
/// kernel that delegates a single piece of work to a named subordinate.
/// Never serialized: it only ever runs on the node that constructs it.
struct UpstreamRelay {
    header: KernelHeader,
    child_destination: Endpoint,
    child_n: u32,
}

impl Kernel for UpstreamRelay {
    fn header(&self) -> &KernelHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }
    fn wire_type(&self) -> u16 {
        0
    }
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn act(&mut self, dispatcher: &dyn Dispatcher) {
        let mut child = EchoKernel::new(self.child_n);
        child.header.destination = Some(self.child_destination.clone());
        child.header.flags = KernelFlags::MOVES_UPSTREAM;
        dispatcher.upstream(self.header.identity, Box::new(child));
    }

    fn react(&mut self, child: Box<dyn Kernel>, dispatcher: &dyn Dispatcher) {
        match child.as_any().downcast_ref::<EchoKernel>() {
            Some(echo) => dispatcher.graceful_shutdown(echo.n as i32),
            None => dispatcher.graceful_shutdown(ResultCode::Error.exit_code()),
        }
    }

    fn write_payload(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn echo_kernel_dispatched_to_a_named_peer_replies_with_its_own_payload() {
    let port = 21100;
    let node_a_addr = common::loopback(10, port);
    let node_b_addr = common::loopback(11, port);

    let node_b = common::start_node(node_b_addr, common::registry());
    let node_a = common::start_node(node_a_addr, common::registry());

    node_a.send(Box::new(UpstreamRelay {
        header: KernelHeader::default(),
        child_destination: Endpoint::Ip(node_b_addr),
        child_n: 7,
    }));

    assert_eq!(node_a.wait(), 7);

    node_b.graceful_shutdown(0);
    let _ = node_b.wait();
}
