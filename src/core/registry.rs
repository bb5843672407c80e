// src/core/registry.rs

//! In-memory view of `{pnn -> (flags, capabilities)}` and the mapping from
//! logical node numbers to addresses. Refreshed each monitor iteration from
//! the authoritative node map, but exposed as a standalone component so that
//! election, dispatch, and recovery code share one source of truth within an
//! iteration.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::core::model::{Capabilities, NodeEntry, NodeFlags, NodeMap, Pnn};

#[derive(Debug, Clone, Default)]
struct NodeInfo {
    flags: NodeFlags,
    address: Option<SocketAddr>,
    capabilities: Capabilities,
}

/// The coordinator's local, process-lifetime view of every node it knows
/// about.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    local_pnn: Pnn,
    nodes: HashMap<Pnn, NodeInfo>,
}

impl NodeRegistry {
    pub fn new(local_pnn: Pnn) -> Self {
        Self {
            local_pnn,
            nodes: HashMap::new(),
        }
    }

    pub fn local_pnn(&self) -> Pnn {
        self.local_pnn
    }

    /// Replaces the node set from a freshly fetched node map, preserving any
    /// previously known capabilities.
    pub fn refresh_from_node_map(&mut self, map: &NodeMap) {
        let mut next = HashMap::with_capacity(map.nodes.len());
        for NodeEntry { pnn, flags, address } in &map.nodes {
            let capabilities = self
                .nodes
                .get(pnn)
                .map(|n| n.capabilities)
                .unwrap_or_default();
            next.insert(
                *pnn,
                NodeInfo {
                    flags: *flags,
                    address: Some(*address),
                    capabilities,
                },
            );
        }
        self.nodes = next;
    }

    pub fn set_capabilities(&mut self, pnn: Pnn, caps: Capabilities) {
        self.nodes.entry(pnn).or_default().capabilities = caps;
    }

    pub fn capabilities(&self, pnn: Pnn) -> Capabilities {
        self.nodes.get(&pnn).map(|n| n.capabilities).unwrap_or_default()
    }

    pub fn flags(&self, pnn: Pnn) -> NodeFlags {
        self.nodes.get(&pnn).map(|n| n.flags).unwrap_or(NodeFlags::DISCONNECTED)
    }

    pub fn set_flags(&mut self, pnn: Pnn, flags: NodeFlags) {
        self.nodes.entry(pnn).or_default().flags = flags;
    }

    pub fn local_flags(&self) -> NodeFlags {
        self.flags(self.local_pnn)
    }

    pub fn address(&self, pnn: Pnn) -> Option<SocketAddr> {
        self.nodes.get(&pnn).and_then(|n| n.address)
    }

    pub fn contains(&self, pnn: Pnn) -> bool {
        self.nodes.contains_key(&pnn)
    }

    pub fn active_pnns(&self) -> Vec<Pnn> {
        self.nodes
            .iter()
            .filter(|(_, info)| info.flags.is_active())
            .map(|(pnn, _)| *pnn)
            .collect()
    }

    pub fn pnns_with_capability(&self, cap: Capabilities) -> Vec<Pnn> {
        self.nodes
            .iter()
            .filter(|(_, info)| info.flags.is_active() && info.capabilities.contains(cap))
            .map(|(pnn, _)| *pnn)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn all_have_capability(&self, pnns: &[Pnn], cap: Capabilities) -> bool {
        pnns.iter()
            .all(|pnn| self.nodes.get(pnn).is_some_and(|n| n.capabilities.contains(cap)))
    }
}
