// src/core/rpc/wire.rs

//! Wire message definitions for Control RPC. Every message is framed with a
//! 4-byte big-endian length prefix (via `tokio_util::codec::LengthDelimitedCodec`)
//! and the frame body is `bincode`-encoded.

use std::cmp::{Ordering, Reverse};

use serde::{Deserialize, Serialize};

use crate::core::model::{Capabilities, DbId, NodeFlags, NodeMap, Pnn, Record, VnnMap};

/// The election key a candidate advertises: higher sorts as "more eligible".
/// Compared lexicographically, most significant first, on
/// `(has_recmaster_cap, eligible, num_connected, priority_time, -pnn)` — a
/// node without the `RECMASTER` capability or carrying `BANNED`/`STOPPED`
/// only wins against another equally disqualified node; among otherwise
/// equal candidates the longest-established (highest `priority_time`) wins,
/// and the lowest `pnn` breaks any remaining tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionKey {
    pub has_recmaster_cap: bool,
    /// `!BANNED && !STOPPED` at the moment this key was advertised.
    pub eligible: bool,
    pub num_connected: u32,
    pub priority_time: u64,
    pub pnn: Pnn,
}

impl ElectionKey {
    fn sort_key(&self) -> (bool, bool, u32, u64, Reverse<Pnn>) {
        (self.has_recmaster_cap, self.eligible, self.num_connected, self.priority_time, Reverse(self.pnn))
    }
}

impl PartialOrd for ElectionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElectionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Every request/response/broadcast the coordinator sends or receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Request the current flags of the receiving node.
    GetNodeFlags,
    NodeFlags { flags: NodeFlags },

    /// Ask the receiving node to adopt `flags` for its own bookkeeping of the
    /// sender.
    SetNodeFlags { pnn: Pnn, flags: NodeFlags },

    /// Ask the receiving node to report its capabilities.
    GetCapabilities,
    Capabilities { caps: Capabilities },

    /// An election vote broadcast: "I am standing with this key".
    ElectionVote { key: ElectionKey },

    /// Recovery master announces a new generation and the authoritative node
    /// map for the cluster to adopt.
    SetRecMaster { pnn: Pnn },
    GetRecMaster,
    RecMaster { pnn: Pnn },

    /// Push the authoritative node map to a node.
    PushNodeMap { map: NodeMap },
    GetNodeMap,
    NodeMapReply { map: NodeMap },

    /// Push the authoritative vnn map / trigger a takeover run.
    PushVnnMap { map: VnnMap },

    /// Ask a node for every record (or just a highest-seqnum summary) it
    /// holds for a database, as part of a recovery pull phase.
    PullDb { db_id: DbId, only_seqnum: bool },
    PullDbReply { db_id: DbId, records: Vec<Record>, seqnum: u64 },

    /// Push the merged, authoritative record set for a database.
    PushDb { db_id: DbId, records: Vec<Record> },

    /// Ask a node whether it considers the recovery active for a generation.
    EndRecovery { generation: u32 },

    /// Gate control: disable recovery/takeover runs on the receiving node for
    /// `seconds` (0 re-enables immediately).
    DisableRecovery { seconds: u64 },
    DisableTakeover { seconds: u64 },

    /// Report ban credits against a peer pnn to the recovery master.
    ReportCulprit { pnn: Pnn, credits: u32 },

    /// Master-only: re-broadcast a flag change the master has accepted to
    /// every connected node.
    PushNodeFlags { pnn: Pnn, flags: NodeFlags },

    /// Pass-through notification for clients; the coordinator does not act
    /// on it beyond acknowledging receipt.
    Reconfigure,

    /// Ask the receiving node to pull the given records locally, as a
    /// non-blocking migration-with-data attempt. Skipped on lock contention.
    VacuumFetch { db_id: DbId, records: Vec<Record> },

    /// Remove a database from the receiving node's local registry.
    DetachDatabase { db_id: DbId },

    /// Ask the receiving node to re-read its nodes file.
    ReloadNodes,

    /// Enqueue a reallocate (takeover) request; the requester's pnn is the
    /// reply address the next drain responds to.
    TakeoverRun { requester: Pnn },

    /// Disable the local IP-consistency check (and by extension the
    /// takeover gate) for `seconds`.
    DisableIpCheck { seconds: u64 },

    /// Ask the receiving node to serialize its internal allocator/bookkeeping
    /// state for diagnostics.
    MemDump,
    MemDumpReply { report: String },

    /// Append a pnn to the receiving node's `force_rebalance_nodes` set.
    RebalanceNode { pnn: Pnn },

    /// Master-only: update the sender's IP-assignment index entry.
    RecdUpdateIp { pnn: Pnn },

    /// A node announces it is shutting down gracefully.
    Shutdown,

    Ack,
    Error { message: String },
}
