// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A kernel sent upstream with its parent embedded in the same wire
//! frame (`CARRIES_PARENT`) finishes on the peer it was dispatched to
//! even if the node that sent it is torn down immediately afterwards:
//! once the packet is on the wire, the parent lives on as a suspended
//! principal on the receiving node and needs nothing further from the
//! sender to complete.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bsched_kernel::{Dispatcher, Endpoint, EchoKernel, Kernel, KernelFlags, KernelId, PrincipalLookup};
use bsched_net::{BindSpec, SocketConfig, SocketPipeline};

/// Every callback is reachable only from `act`/`react`, neither of
/// which a plain `submit_with_parent` call ever triggers on the
/// sending side; a fielded no-op stands in for the full `Factory`
/// this harness has no need to build.
struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn send(&self, _k: Box<dyn Kernel>) {}
    fn send_local(&self, _k: Box<dyn Kernel>) {}
    fn send_remote(&self, _k: Box<dyn Kernel>) {}
    fn upstream(&self, _parent_id: KernelId, _child: Box<dyn Kernel>) {}
    fn graceful_shutdown(&self, _code: i32) {}
    fn register_principal(&self, _kernel: Box<dyn Kernel>) {}
    fn schedule_after(&self, _k: Box<dyn Kernel>, _after: Duration) {}
    fn peer_disconnected(&self, _endpoint: Endpoint) {}
}

/// This harness never delivers anything back to the sending node, so
/// it never needs to answer `true`.
struct NeverPresent;

impl PrincipalLookup for NeverPresent {
    fn principal_exists(&self, _id: KernelId) -> bool {
        false
    }
}

#[test]
fn a_kernel_carrying_its_parent_completes_on_the_peer_even_after_the_sender_is_torn_down() {
    let port = 21200;
    let node_b_addr = common::loopback(30, port);
    let node_a_addr = common::loopback(31, port);

    let node_b = common::start_node(node_b_addr, common::registry());

    let config = SocketConfig {
        binds: vec![BindSpec {
            bind: node_a_addr,
            ifnet: common::narrow_ifnet(node_a_addr),
        }],
        use_localhost: false,
    };
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(NullDispatcher);
    let principal_lookup: Arc<dyn PrincipalLookup> = Arc::new(NeverPresent);
    let mut node_a = SocketPipeline::start(config, common::registry(), dispatcher, principal_lookup)
        .expect("node_a socket pipeline failed to bind");

    let mut parent = EchoKernel::new(0);
    parent.header.identity = KernelId(900_001);

    let mut child = EchoKernel::new(0);
    child.header.principal_id = Some(parent.header.identity);
    child.header.flags = KernelFlags::CARRIES_PARENT | KernelFlags::MOVES_UPSTREAM;
    child.header.destination = Some(Endpoint::Ip(node_b_addr));

    node_a.submit_with_parent(Box::new(child), Box::new(parent));

    // Give the dial/write/flush a moment to land on the wire, then tear
    // node_a down entirely, simulating it dying right after dispatch.
    std::thread::sleep(Duration::from_millis(250));
    node_a.stop();
    node_a.join();

    assert_eq!(node_b.wait(), 0);
}
