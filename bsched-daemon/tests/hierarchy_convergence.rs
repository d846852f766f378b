// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Several nodes discovering each other on a shared subnet converge on
//! exactly one node with no principal of its own, with every other node
//! accepting some peer as principal.

mod common;

use std::time::Duration;

use bsched_discovery::{Discoverer, DISCOVERY_PRINCIPAL_ID};
use bsched_kernel::Kernel;

#[test]
fn nodes_probing_each_other_converge_on_a_single_principal_less_root() {
    let network: ipnet::Ipv4Net = "127.0.0.40/29".parse().unwrap();
    let port = 21300;
    let addrs: Vec<_> = (40u8..=44).map(|host| common::loopback(host, port)).collect();
    let probe_interval = Duration::from_millis(40);

    let nodes: Vec<_> = addrs
        .iter()
        .map(|&addr| common::start_node_with_discovery(addr, network, probe_interval, common::registry()))
        .collect();

    // Several scan rounds across a five-host subnet settle well within
    // this window; it's generous rather than tight since convergence
    // speed isn't itself the property under test.
    std::thread::sleep(Duration::from_secs(2));

    let rootless: Vec<bool> = nodes
        .iter()
        .map(|factory| {
            let principal = factory
                .take_principal(DISCOVERY_PRINCIPAL_ID)
                .expect("every node suspends a Discoverer under the well-known principal id");
            let discoverer = principal
                .as_any()
                .downcast_ref::<Discoverer>()
                .expect("the well-known principal id is always a Discoverer");
            !discoverer.hierarchy().has_principal()
        })
        .collect();

    assert_eq!(
        rootless.iter().filter(|&&is_rootless| is_rootless).count(),
        1,
        "expected exactly one node with no principal of its own, got: {rootless:?}"
    );

    for node in &nodes {
        node.graceful_shutdown(0);
        let _ = node.wait();
    }
}
