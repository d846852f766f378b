// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The daemon's CLI surface — `--bind`/`--network`/`--port`/
//! `--num-peers`/`--role` — parsed with `clap` derive in the style
//! this corpus uses for its CLI binaries (`libdd-profiling-replayer`,
//! `qmonnet-dataplane/dataplane/src/args.rs`'s `CmdArgs: Parser`).

use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use ipnet::Ipv4Net;

#[derive(Parser, Debug)]
#[command(name = "bscheduler", about = "Distributed hierarchical kernel scheduler daemon")]
pub struct Cli {
    /// Local endpoint the kernel socket pipeline listens on.
    #[arg(long)]
    pub bind: SocketAddr,

    /// The local interface's network, used both to decide whether a
    /// destination is local and to compute discovery candidate
    /// addresses (identity assignment, scan order).
    #[arg(long)]
    pub network: Ipv4Net,

    /// Port every node in this network binds its discovery listener on.
    #[arg(long)]
    pub port: u16,

    /// Expected cluster size; external interface only —
    /// observed by the failover test harness, not consumed internally.
    #[arg(long, default_value_t = 0)]
    pub num_peers: usize,

    /// Operator-stated intent; doesn't gate any internal code path since
    /// principal/subordinate roles are elected purely through probing.
    #[arg(long, value_enum)]
    pub role: Role,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lower")]
pub enum Role {
    Master,
    Slave,
}
