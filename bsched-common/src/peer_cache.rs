// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Optional, best-effort peer-cache file keyed by local endpoint: persists
//! the last-known peer set to a temporary directory. No persisted state
//! is required for correct operation, and absence of the file is not an
//! error.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerCache {
    pub peers: Vec<SocketAddr>,
}

fn cache_path(local_bind: SocketAddr) -> PathBuf {
    std::env::temp_dir().join(format!("bscheduler-peers-{}.json", local_bind))
}

/// Reads the cache for `local_bind`. Any failure (missing file, bad json)
/// is logged at `warn` and treated as an empty cache — never an error.
pub fn load(local_bind: SocketAddr) -> PeerCache {
    let path = cache_path(local_bind);
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("peer cache at {path:?} is not valid json, ignoring: {e}");
            PeerCache::default()
        }),
        Err(_) => PeerCache::default(),
    }
}

/// Writes the cache for `local_bind`. Failures are logged and ignored.
pub fn store(local_bind: SocketAddr, cache: &PeerCache) {
    let path = cache_path(local_bind);
    match serde_json::to_string(cache) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                warn!("failed to write peer cache to {path:?}: {e}");
            }
        }
        Err(e) => warn!("failed to serialize peer cache: {e}"),
    }
}
