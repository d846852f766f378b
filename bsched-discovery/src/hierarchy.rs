// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The local node's view of its place in the discovery tree, grounded on
//! `original_source/src/apps/discovery/hierarchy.hh`'s `Hierarchy<Addr>`
//! template.

use std::net::SocketAddr;

use ipnet::Ipv4Net;

/// Per-peer record: a socket address plus the number of nodes behind it
/// in the subtree. Two nodes are equal iff their addresses match —
/// `weight` is bookkeeping, not identity.
#[derive(Debug, Clone, Copy)]
pub struct HierarchyNode {
    pub address: SocketAddr,
    pub weight: u32,
}

impl HierarchyNode {
    pub fn new(address: SocketAddr) -> Self {
        HierarchyNode { address, weight: 1 }
    }
}

impl PartialEq for HierarchyNode {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl Eq for HierarchyNode {}

/// The local node's hierarchy state: interface network,
/// bind endpoint, current principal (if any), and the set of
/// subordinates. Invariants enforced here, not just documented:
/// - a given endpoint appears in at most one of {principal, subordinates};
/// - setting a new principal removes that endpoint from subordinates if
///   present;
/// - removing the principal is idempotent.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    network: Ipv4Net,
    bind: SocketAddr,
    principal: Option<HierarchyNode>,
    subordinates: Vec<HierarchyNode>,
}

impl Hierarchy {
    pub fn new(network: Ipv4Net, bind: SocketAddr) -> Self {
        Hierarchy {
            network,
            bind,
            principal: None,
            subordinates: Vec::new(),
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    pub fn principal(&self) -> Option<&HierarchyNode> {
        self.principal.as_ref()
    }

    pub fn has_principal(&self) -> bool {
        self.principal.is_some()
    }

    pub fn is_principal(&self, address: SocketAddr) -> bool {
        self.principal.as_ref().is_some_and(|p| p.address == address)
    }

    pub fn subordinates(&self) -> &[HierarchyNode] {
        &self.subordinates
    }

    pub fn is_subordinate(&self, address: SocketAddr) -> bool {
        self.subordinates.iter().any(|s| s.address == address)
    }

    /// Sets `address` as principal, dropping it from the subordinate set
    /// first if present there (an endpoint cannot be both).
    pub fn set_principal(&mut self, address: SocketAddr) {
        self.subordinates.retain(|s| s.address != address);
        self.principal = Some(HierarchyNode::new(address));
    }

    /// Idempotent: clearing an already-empty principal is a no-op.
    pub fn unset_principal(&mut self) {
        self.principal = None;
    }

    /// No-op if `address` is already our principal (an endpoint cannot be
    /// both principal and subordinate) or already present.
    pub fn add_subordinate(&mut self, address: SocketAddr) {
        if self.is_principal(address) || self.is_subordinate(address) {
            return;
        }
        self.subordinates.push(HierarchyNode::new(address));
    }

    pub fn remove_subordinate(&mut self, address: SocketAddr) {
        self.subordinates.retain(|s| s.address != address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn hierarchy() -> Hierarchy {
        Hierarchy::new("127.0.0.0/24".parse().unwrap(), addr(10000))
    }

    #[test]
    fn setting_principal_removes_it_from_subordinates() {
        let mut h = hierarchy();
        h.add_subordinate(addr(10001));
        h.set_principal(addr(10001));
        assert!(!h.is_subordinate(addr(10001)));
        assert!(h.is_principal(addr(10001)));
    }

    #[test]
    fn unsetting_principal_is_idempotent() {
        let mut h = hierarchy();
        h.unset_principal();
        h.unset_principal();
        assert!(!h.has_principal());
    }

    #[test]
    fn an_endpoint_cannot_become_a_subordinate_while_also_principal() {
        let mut h = hierarchy();
        h.set_principal(addr(10001));
        h.add_subordinate(addr(10001));
        assert!(!h.is_subordinate(addr(10001)));
    }
}
