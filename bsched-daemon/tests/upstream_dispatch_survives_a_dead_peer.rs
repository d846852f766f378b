// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A node dispatching work upstream with no fixed destination round-
//! robins across whichever peers it currently has open connections to.
//! Losing one of those peers doesn't stall dispatch: the next kernel
//! sent upstream lands on a peer that's still alive.

mod common;

use std::any::Any;
use std::io::{self, Write};
use std::time::Duration;

use bsched_discovery::{Discoverer, DISCOVERY_PRINCIPAL_ID};
use bsched_kernel::{Dispatcher, EchoKernel, Kernel, KernelFlags, KernelHeader, ResultCode};

/// Dispatches one child upstream with no fixed destination, letting the
/// socket pipeline's round robin pick whichever peer is reachable, and
/// surfaces the reply as the process exit code.
struct UpstreamRelay {
    header: KernelHeader,
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
fn upstream_dispatch_still_completes_after_one_peer_is_torn_down() {
    let network: ipnet::Ipv4Net = "127.0.0.50/29".parse().unwrap();
    let port = 21400;
    let addrs: Vec<_> = (50u8..=52).map(|host| common::loopback(host, port)).collect();
    let probe_interval = Duration::from_millis(40);

    let nodes: Vec<_> = addrs
        .iter()
        .map(|&addr| common::start_node_with_discovery(addr, network, probe_interval, common::registry()))
        .collect();

    std::thread::sleep(Duration::from_secs(1));

    let root_index = nodes
        .iter()
        .position(|factory| {
            let principal = factory.take_principal(DISCOVERY_PRINCIPAL_ID).expect("well-known principal id is always present");
            let rootless = !principal
                .as_any()
                .downcast_ref::<Discoverer>()
                .expect("well-known principal id is always a Discoverer")
                .hierarchy()
                .has_principal();
            // Put it back: the root node still needs its Discoverer alive
            // later, and disturbing a non-root node's is harmless either way.
            factory.register_principal(principal);
            rootless
        })
        .expect("exactly one node converges with no principal of its own");

    // Kill one of the non-root nodes outright and give its peers time to
    // notice the connection drop and tear down their side of it.
    let dead_index = (root_index + 1) % nodes.len();
    nodes[dead_index].graceful_shutdown(0);
    let _ = nodes[dead_index].wait();
    std::thread::sleep(Duration::from_millis(500));

    let root = &nodes[root_index];
    root.send(Box::new(UpstreamRelay {
        header: KernelHeader::default(),
        child_n: 19,
    }));

    assert_eq!(root.wait(), 19);

    for (index, node) in nodes.iter().enumerate() {
        if index == root_index || index == dead_index {
            continue;
        }
        node.graceful_shutdown(0);
        let _ = node.wait();
    }
}
