// src/core/model.rs

//! The shared data model for the coordinator: node identifiers and flags,
//! capabilities, the node map, the virtual node-number map, and the record
//! ordering relation used during database recovery.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A stable, non-negative logical node identifier.
pub type Pnn = u32;

/// Sentinel meaning "no master known".
pub const UNKNOWN_PNN: Pnn = u32::MAX;

bitflags! {
    /// Per-node status flags, eventually consistent across the cluster.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct NodeFlags: u16 {
        const DISCONNECTED = 1 << 0;
        const DELETED      = 1 << 1;
        const BANNED       = 1 << 2;
        const STOPPED      = 1 << 3;
        const DISABLED     = 1 << 4;
        const UNHEALTHY    = 1 << 5;
    }
}

impl NodeFlags {
    /// The composite of all flags that make a node ineligible to participate.
    pub const INACTIVE: NodeFlags = NodeFlags::BANNED
        .union(NodeFlags::STOPPED)
        .union(NodeFlags::DISABLED)
        .union(NodeFlags::UNHEALTHY)
        .union(NodeFlags::DISCONNECTED)
        .union(NodeFlags::DELETED);

    pub fn is_inactive(self) -> bool {
        self.intersects(NodeFlags::INACTIVE)
    }

    pub fn is_active(self) -> bool {
        !self.is_inactive()
    }
}

bitflags! {
    /// Per-node capability bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        /// Eligible to be elected recovery master.
        const RECMASTER = 1 << 0;
        /// Eligible to own a slot in the virtual node-number map.
        const LMASTER = 1 << 1;
        /// Supports the out-of-process parallel-recovery helper.
        const PARALLEL_RECOVERY = 1 << 2;
    }
}

/// A single entry in the node map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub pnn: Pnn,
    pub flags: NodeFlags,
    pub address: SocketAddr,
}

/// Ordered sequence of `(pnn, flags, address)` records. Node order and length
/// must agree across all live nodes; divergence is a recovery trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMap {
    pub nodes: Vec<NodeEntry>,
}

impl NodeMap {
    pub fn get(&self, pnn: Pnn) -> Option<&NodeEntry> {
        self.nodes.iter().find(|n| n.pnn == pnn)
    }

    pub fn get_mut(&mut self, pnn: Pnn) -> Option<&mut NodeEntry> {
        self.nodes.iter_mut().find(|n| n.pnn == pnn)
    }

    pub fn active(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter().filter(|n| n.flags.is_active())
    }

    pub fn active_pnns(&self) -> Vec<Pnn> {
        self.active().map(|n| n.pnn).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Same node count and the same `(index → pnn)` assignment as `other`.
    pub fn same_shape(&self, other: &NodeMap) -> bool {
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(other.nodes.iter())
                .all(|(a, b)| a.pnn == b.pnn)
    }
}

/// Ordered sequence of PNNs owning the cluster's key space, plus a monotonic
/// generation id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnnMap {
    pub generation: u32,
    pub map: Vec<Pnn>,
}

impl VnnMap {
    pub fn new(generation: u32, map: Vec<Pnn>) -> Self {
        Self { generation, map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

bitflags! {
    /// Flags on a database descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DbFlags: u8 {
        const PERSISTENT = 1 << 0;
    }
}

/// A database identifier, stable for the lifetime of the cluster.
pub type DbId = u32;

/// Whether a node considers a recovery run in progress. Set `Active` as soon
/// as a node is disqualified from participating (`STOPPED`/`BANNED`) so a
/// data daemon watching this node treats it as unsafe to read from until it
/// rejoins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    #[default]
    Normal,
    Active,
}

/// `(db_id, name, flags)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbDescriptor {
    pub db_id: DbId,
    pub name: String,
    pub flags: DbFlags,
}

impl DbDescriptor {
    pub fn is_persistent(&self) -> bool {
        self.flags.contains(DbFlags::PERSISTENT)
    }
}

bitflags! {
    /// Per-record header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RecordFlags: u8 {
        /// Set on records pushed by recovery to mark them as having traveled
        /// with data (rather than being an empty placeholder).
        const MIGRATED_WITH_DATA = 1 << 0;
    }
}

/// The header carried alongside every record's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Record sequence number; strictly increases on every local write.
    pub rsn: u64,
    /// The node that currently owns this record for local-write purposes.
    pub dmaster: Pnn,
    pub flags: RecordFlags,
}

/// A single stored record: `(key, header, value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub header: RecordHeader,
    pub value: Vec<u8>,
}

impl Record {
    /// A record is "empty" when it carries no payload — for persistent
    /// databases this represents a committed deletion (a tombstone) and must
    /// survive recovery; see the database recovery engine's push phase.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Ordering relation used during merge: `self` is newer than `other` iff
    /// `self.rsn > other.rsn`, or `self.rsn == other.rsn` and
    /// `self.dmaster == local_pnn`.
    pub fn is_newer_than(&self, other: &Record, local_pnn: Pnn) -> bool {
        match self.header.rsn.cmp(&other.header.rsn) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.header.dmaster == local_pnn,
        }
    }
}

/// Merges `incoming` into `existing`, keyed by record key, keeping the newer
/// record per the ordering relation above. Used to fold a remote node's pull
/// response into the working store.
pub fn merge_records(
    existing: &mut BTreeMap<Vec<u8>, Record>,
    incoming: Vec<Record>,
    local_pnn: Pnn,
) {
    for rec in incoming {
        match existing.get(&rec.key) {
            Some(cur) if !rec.is_newer_than(cur, local_pnn) => {}
            _ => {
                existing.insert(rec.key.clone(), rec);
            }
        }
    }
}
