// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CLI entry point: parses
//! `--bind`/`--network`/`--port`/`--num-peers`/`--role`, wires up the
//! kernel type registry and the `bsched_core::Factory`, starts the
//! discovery state machine, and blocks until graceful shutdown.
//!
//! Grounded on `qmonnet-dataplane/dataplane/src/main.rs`'s
//! `ctrlc`-channel-then-`process::exit` shutdown shape, adapted so the
//! exit code carries the committed root kernel's result rather than
//! always `0`: a `ctrlc` handler and a committing kernel both just call
//! `Factory::graceful_shutdown`, whichever gets there first wins.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use bsched_core::{Factory, FactoryConfig};
use bsched_discovery::{read_probe, Discoverer, PROBE_WIRE_TYPE};
use bsched_kernel::{read_echo_kernel, EchoKernel, KernelRegistry, ECHO_KERNEL_WIRE_TYPE};
use bsched_net::{BindSpec, SocketConfig};

use config::Cli;

/// `probe_next`'s exhausted-scan backoff: how long a node waits before
/// re-scanning after it either lands a principal or runs out of
/// candidates. Not part of the daemon's CLI surface; picked to be
/// short enough for the loopback integration tests in
/// `bsched-daemon/tests/` to observe failover within their timeouts.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Double registration at start-up is fatal: the process aborts with
/// exit code 1 before any pipeline starts. A `.expect()` here would also
/// stop the daemon, but exits with Rust's panic code (101) instead, so
/// registration failures are surfaced through `main`'s explicit exit
/// instead.
fn build_registry() -> anyhow::Result<Arc<KernelRegistry>> {
    let registry = KernelRegistry::new();
    registry
        .register::<EchoKernel>(Some(ECHO_KERNEL_WIRE_TYPE as u32), read_echo_kernel)
        .context("registering EchoKernel")?;
    registry
        .register::<bsched_discovery::Probe>(Some(PROBE_WIRE_TYPE as u32), read_probe)
        .context("registering Probe")?;
    Ok(Arc::new(registry))
}

fn main() {
    bsched_common::log::init();

    let cli = Cli::parse();
    info!(bind = %cli.bind, network = %cli.network, port = cli.port, num_peers = cli.num_peers, role = ?cli.role, "starting bscheduler daemon");

    // Peer cache is optional; its absence is not an error. Best-effort,
    // diagnostic only at this stage (seeding the scan order
    // from it is a further step the daemon doesn't yet take, since
    // `PrincipalScanOrder` has no notion of a preferred candidate list).
    let cache = bsched_common::peer_cache::load(cli.bind);
    if !cache.peers.is_empty() {
        info!(known_peers = cache.peers.len(), "loaded peer cache");
    }

    let registry = build_registry().unwrap_or_else(|e| {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    });

    let factory_config = FactoryConfig {
        num_cpu_workers: 0,
        socket: SocketConfig {
            binds: vec![BindSpec {
                bind: cli.bind,
                ifnet: cli.network,
            }],
            use_localhost: true,
        },
    };
    let factory = Factory::start(factory_config, registry);

    {
        let factory = Arc::clone(&factory);
        ctrlc::set_handler(move || {
            warn!("received shutdown signal");
            factory.graceful_shutdown(0);
        })
        .expect("failed to install signal handler");
    }

    let discovery_bind: SocketAddr = SocketAddr::new(cli.bind.ip(), cli.port);
    let discoverer = Discoverer::new(cli.network, discovery_bind, cli.port, PROBE_INTERVAL);
    // On start, probe the first candidate: a plain `send` through the
    // CPU pipeline runs `act()` once and then suspends the Discoverer
    // under its own well-known identity, exactly like any other
    // non-terminal kernel (`CpuPipeline::dispatch_one`); no separate
    // principal-registration call is needed since the Discoverer already
    // carries `DISCOVERY_PRINCIPAL_ID` as its own identity.
    factory.send(Box::new(discoverer));

    // `role` and `num_peers` are part of the daemon's external CLI
    // surface (observed by the failover test harness) but don't gate any
    // internal code path: the discovery algorithm is symmetric and
    // elects principal/subordinate roles purely through probing, not
    // through a static flag. They're accepted and logged for
    // compatibility rather than silently rejected.
    let _ = cli.role;

    let code = factory.wait();
    info!(exit_code = code, "bscheduler daemon shutting down");
    std::process::exit(code);
}
