// src/core/election.rs

//! Leader election: every node periodically broadcasts an `ElectionKey`
//! advertising how well-qualified it considers itself to be recovery master,
//! and the coordinator with the highest key among responders wins.
//!
//! Keys compare lexicographically on `(has_recmaster_cap, eligible,
//! num_connected, priority_time, -pnn)`: a node without the `RECMASTER`
//! capability or that is currently `BANNED`/`STOPPED` only wins against an
//! equally disqualified competitor; among eligible candidates the one
//! connected to more of the cluster wins, then the longest-established
//! (highest `priority_time`) wins, and the lowest pnn breaks any remaining
//! tie deterministically.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::model::{Capabilities, Pnn};
use crate::core::registry::NodeRegistry;
use crate::core::rpc::{fan_out, ControlMessage, ElectionKey, RpcTransport};

/// How a candidate ranks itself before broadcasting a vote. `eligible` is
/// `!BANNED && !STOPPED` at the moment of the vote; `num_connected` is the
/// number of active peers the candidate currently sees.
pub fn local_election_key(
    local_pnn: Pnn,
    priority_time: u64,
    capabilities: Capabilities,
    num_connected: u32,
    eligible: bool,
) -> ElectionKey {
    ElectionKey {
        has_recmaster_cap: capabilities.contains(Capabilities::RECMASTER),
        eligible,
        num_connected,
        priority_time,
        pnn: local_pnn,
    }
}

/// Result of a single election round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    pub winner: Pnn,
    pub votes_seen: usize,
}

/// Broadcasts `our_key` to every active node, collects replies within
/// `round_timeout`, and returns the pnn with the highest key among all
/// responders plus the local node itself. A node with no active peers always
/// wins its own election.
pub async fn run_election_round(
    transport: &dyn RpcTransport,
    registry: &NodeRegistry,
    our_key: ElectionKey,
    round_timeout: Duration,
) -> ElectionResult {
    let local_pnn = registry.local_pnn();
    let targets: Vec<(Pnn, SocketAddr)> = registry
        .active_pnns()
        .into_iter()
        .filter(|&pnn| pnn != local_pnn)
        .filter_map(|pnn| registry.address(pnn).map(|addr| (pnn, addr)))
        .collect();

    debug!(?our_key, peers = targets.len(), "broadcasting election vote");

    let replies = fan_out(
        transport,
        &targets,
        ControlMessage::ElectionVote { key: our_key },
        round_timeout,
    )
    .await;

    let mut best = our_key;
    let mut votes_seen = 1;
    for msg in replies.values() {
        if let ControlMessage::ElectionVote { key } = msg {
            votes_seen += 1;
            if *key > best {
                best = *key;
            }
        }
    }

    let result = ElectionResult { winner: best.pnn, votes_seen };
    info!(winner = result.winner, votes_seen = result.votes_seen, "election round complete");
    result
}

/// Whether an election outcome requires the local node to step up as master.
pub fn should_become_master(result: &ElectionResult, local_pnn: Pnn) -> bool {
    result.winner == local_pnn
}
