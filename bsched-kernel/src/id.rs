// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// 64-bit opaque kernel identity. Zero means unassigned; a kernel is
/// assigned one on first network send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u64);

impl KernelId {
    pub const UNASSIGNED: KernelId = KernelId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A monotonic id generator for identity assignment. One
/// lives on the CPU pipeline (assigning a kernel's self-identity on first
/// local submission) and one on the socket pipeline (assigning a wire
/// identity to a kernel that reaches the network without having gone
/// through the CPU pipeline first, e.g. a root kernel submitted directly
/// via `send_remote`); the convention of UNIX-family peers sharing a
/// pipeline-wide counter is generalized here to a single shared counter
/// per pipeline rather than one per listening server, since nothing in
/// this workspace needs server-scoped counters and a single counter is
/// simpler to reason about for uniqueness.
///
/// The counter's starting value is seeded with a random 32-bit prefix in
/// the high half of the id rather than always starting at 1: a kernel's
/// identity can end up as a `HashMap` key on a *different* node than the
/// one that assigned it (carries-parent grafting embeds a
/// parent kernel — with the identity its origin node gave it — into
/// another node's principal table), and two independent node processes
/// both counting up from 1 would collide constantly. [`DISCOVERY_PRINCIPAL_ID`]-style
/// well-known ids stay below this generator's range (they are never
/// drawn from it).
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        let prefix = (rand::random::<u32>() as u64) | 1;
        IdGenerator {
            next: AtomicU64::new((prefix << 32) | 2),
        }
    }

    pub fn next_id(&self) -> KernelId {
        KernelId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let gen = IdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert!(a.is_assigned());
        assert!(b.0 > a.0);
    }

    #[test]
    fn unassigned_is_zero() {
        assert!(!KernelId::UNASSIGNED.is_assigned());
    }
}
