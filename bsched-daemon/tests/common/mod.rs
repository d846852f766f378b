// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the daemon-level integration tests: a kernel type
//! registry matching `build_registry()` in `src/main.rs`, loopback
//! address helpers, and a `Factory` builder.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;

use bsched_core::{Factory, FactoryConfig};
use bsched_discovery::{read_probe, Discoverer, Probe, PROBE_WIRE_TYPE};
use bsched_kernel::{read_echo_kernel, EchoKernel, KernelRegistry, ECHO_KERNEL_WIRE_TYPE};
use bsched_net::{BindSpec, SocketConfig};

/// The same two types `build_registry()` registers in `src/main.rs`,
/// minus the `process::exit` on conflict (tests never conflict).
#[allow(dead_code)]
pub fn registry() -> Arc<KernelRegistry> {
    let registry = KernelRegistry::new();
    registry
        .register::<EchoKernel>(Some(ECHO_KERNEL_WIRE_TYPE as u32), read_echo_kernel)
        .expect("echo kernel registration");
    registry
        .register::<Probe>(Some(PROBE_WIRE_TYPE as u32), read_probe)
        .expect("probe registration");
    Arc::new(registry)
}

/// A loopback address on `127.0.0.<host>`, distinct per node so several
/// nodes can run in one test process without colliding.
#[allow(dead_code)]
pub fn loopback(host: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, host)), port)
}

/// The exact `/32` covering only `addr`'s own IP.
///
/// `ListeningServer::contains` is a subnet-membership check used both to
/// decide whether a destination is local and to pick which listener
/// assigns identity. Giving every node on a shared loopback range the
/// same broad `ifnet` (the way `main.rs` does, since its deployment
/// shape is one node per real subnet) would make each of these test
/// nodes consider every other node's address local too, short-circuiting
/// wire-bound traffic back onto its own CPU pipeline. Each test node
/// gets a narrow `ifnet` instead; the broader shared subnet a
/// `Discoverer` scans for candidates is `Discoverer::new`'s own
/// `network` parameter, entirely independent of this one.
#[allow(dead_code)]
pub fn narrow_ifnet(addr: SocketAddr) -> Ipv4Net {
    let IpAddr::V4(ip) = addr.ip() else {
        panic!("loopback helper only produces IPv4 addresses");
    };
    Ipv4Net::new(ip, 32).expect("/32 is always a valid prefix")
}

#[allow(dead_code)]
pub fn start_node(bind: SocketAddr, registry: Arc<KernelRegistry>) -> Arc<Factory> {
    let config = FactoryConfig {
        num_cpu_workers: 1,
        socket: SocketConfig {
            binds: vec![BindSpec {
                bind,
                ifnet: narrow_ifnet(bind),
            }],
            use_localhost: true,
        },
    };
    Factory::start(config, registry)
}

/// Starts a node the same way `start_node` does, then submits a
/// `Discoverer` scanning `discovery_network` on `bind`'s own port —
/// the same two-step `main.rs` performs, keeping the routing `ifnet`
/// narrow per `narrow_ifnet`'s doc comment rather than reusing
/// `discovery_network` for it.
#[allow(dead_code)]
pub fn start_node_with_discovery(
    bind: SocketAddr,
    discovery_network: Ipv4Net,
    probe_interval: Duration,
    registry: Arc<KernelRegistry>,
) -> Arc<Factory> {
    let factory = start_node(bind, registry);
    let discoverer = Discoverer::new(discovery_network, bind, bind.port(), probe_interval);
    factory.send(Box::new(discoverer));
    factory
}

/// Polls `condition` until it returns true or `timeout` elapses; returns
/// whether it converged.
#[allow(dead_code)]
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
