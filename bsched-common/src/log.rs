// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging setup, shared by the daemon binary and test
//! harnesses that want the same formatting.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber with thread ids/names and line numbers,
/// controlled by `RUST_LOG` (defaulting to `info`).
///
/// Safe to call more than once; subsequent calls are no-ops because
/// `tracing_subscriber::fmt().try_init()` swallows the "already set"
/// error, which matters for integration tests that each start their own
/// daemon instance in-process.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .try_init();
}
