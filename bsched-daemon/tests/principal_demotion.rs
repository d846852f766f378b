// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accepting a principal isn't final: the periodic re-probe a node arms
//! after every acceptance keeps walking its candidate order, and a
//! later successful probe unconditionally replaces whatever principal
//! was already set — even one already accepted and in good standing.

mod common;

use std::time::Duration;

use bsched_discovery::{Discoverer, DISCOVERY_PRINCIPAL_ID};
use bsched_kernel::Kernel;

#[test]
fn a_later_successful_probe_replaces_an_already_accepted_principal() {
    // Network 127.0.0.8/29 puts host 9 at scan position 2. Position 2's
    // candidate order sorts position 3 (host 10) first, then position 1
    // (host 8) second, by (level-difference, rank-difference) from
    // position 2 — see `PrincipalScanOrder`'s own doc comment.
    let network: ipnet::Ipv4Net = "127.0.0.8/29".parse().unwrap();
    let port = 21500;
    let addr_a = common::loopback(9, port);
    let addr_first_candidate = common::loopback(10, port);
    let addr_second_candidate = common::loopback(8, port);
    let probe_interval = Duration::from_millis(250);

    let first_candidate = common::start_node_with_discovery(addr_first_candidate, network, probe_interval, common::registry());
    let node_a = common::start_node_with_discovery(addr_a, network, probe_interval, common::registry());

    // Let A's first scan round reach and accept its nearest candidate.
    std::thread::sleep(Duration::from_millis(200));
    {
        let principal = node_a.take_principal(DISCOVERY_PRINCIPAL_ID).expect("node_a suspends a Discoverer");
        let discoverer = principal.as_any().downcast_ref::<Discoverer>().expect("well-known id is a Discoverer");
        assert!(
            discoverer.hierarchy().is_principal(addr_first_candidate),
            "expected node_a to have already accepted its nearest candidate"
        );
        node_a.register_principal(principal);
    }

    // Now bring up the second candidate and let A's re-probe timer walk
    // to it.
    let second_candidate = common::start_node_with_discovery(addr_second_candidate, network, probe_interval, common::registry());
    std::thread::sleep(probe_interval + Duration::from_millis(200));

    let principal = node_a.take_principal(DISCOVERY_PRINCIPAL_ID).expect("node_a suspends a Discoverer");
    let discoverer = principal.as_any().downcast_ref::<Discoverer>().expect("well-known id is a Discoverer");
    assert!(
        discoverer.hierarchy().is_principal(addr_second_candidate),
        "expected node_a's principal to have moved to the later-accepted candidate"
    );
    node_a.register_principal(principal);

    for node in [first_candidate, node_a, second_candidate] {
        node.graceful_shutdown(0);
        let _ = node.wait();
    }
}
