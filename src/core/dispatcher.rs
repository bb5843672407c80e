// src/core/dispatcher.rs

//! The inbound message dispatcher: accepts Control RPC connections and
//! answers every request type a peer coordinator or the local data daemon
//! might send, without blocking the monitor loop.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, warn};

use crate::core::ban::BanBookkeeper;
use crate::core::election::local_election_key;
use crate::core::errors::{RecoverdError, Result};
use crate::core::gate::OperationGate;
use crate::core::kv::KvStore;
use crate::core::model::{Capabilities, NodeFlags, Pnn};
use crate::core::registry::NodeRegistry;
use crate::core::rpc::transport::{decode, encode};
use crate::core::rpc::ControlMessage;
use parking_lot::Mutex;

/// Shared state the dispatcher needs to answer requests. Kept separate from
/// `Coordinator` so the dispatcher can be unit tested without constructing
/// the whole coordinator.
pub struct DispatcherState {
    pub registry: Mutex<NodeRegistry>,
    /// Shared with the monitor loop so ban credits reported by peers over
    /// RPC feed the same sweep decision the monitor makes each tick.
    pub ban: Arc<Mutex<BanBookkeeper>>,
    pub recovery_gate: OperationGate,
    pub takeover_gate: OperationGate,
    pub local_capabilities: Capabilities,
    pub recmaster: Mutex<Pnn>,
    /// This node's current election round counter, bumped whenever it forces
    /// a fresh election; included in the key this node advertises when
    /// asked to vote.
    pub priority_time: Mutex<u64>,
    /// The working recovery store, shared with the monitor loop, so
    /// `VacuumFetch`/`DetachDatabase` requests act on the same data a
    /// recovery run would see.
    pub kv: Arc<KvStore>,
    /// Set when a peer's `ReloadNodes` indicates the node map may have
    /// changed; drained by the monitor loop on its next tick.
    pub need_recovery: Mutex<bool>,
    /// Set when a `TakeoverRun` request arrives; drained by the monitor loop,
    /// which then runs the takeover and replies to every queued requester.
    pub need_takeover_run: Mutex<bool>,
    /// Pnns queued by `RebalanceNode`, forcing those nodes' share of the key
    /// space to be rebuilt on the next takeover regardless of convergence.
    pub force_rebalance_nodes: Mutex<Vec<Pnn>>,
    /// Pnns that asked for a takeover run via `TakeoverRun` and are waiting
    /// to learn the winning master once the run drains.
    pub reallocate_queue: Mutex<Vec<Pnn>>,
}

/// Binds `listen_addr` and serves connections until the process exits,
/// spawning one task per accepted connection.
pub async fn serve(listen_addr: SocketAddr, state: Arc<DispatcherState>) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    debug!(%listen_addr, "control rpc listener bound");
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                warn!(%peer, error = %e, "control rpc connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<DispatcherState>) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| RecoverdError::Protocol(e.to_string()))?;
        let request = decode(&frame)?;
        let reply = handle_message(&state, request);
        let bytes = encode(&reply)?;
        framed.send(bytes).await.map_err(|e| RecoverdError::Protocol(e.to_string()))?;
    }
    Ok(())
}

/// Answers a single inbound message against the shared dispatcher state.
/// Pure aside from the locks it briefly holds, so it is exercised directly
/// in tests without any socket machinery.
pub fn handle_message(state: &DispatcherState, msg: ControlMessage) -> ControlMessage {
    match msg {
        ControlMessage::GetNodeFlags => {
            let registry = state.registry.lock();
            ControlMessage::NodeFlags { flags: registry.local_flags() }
        }
        ControlMessage::SetNodeFlags { pnn, flags } => {
            state.registry.lock().set_flags(pnn, flags);
            ControlMessage::Ack
        }
        ControlMessage::GetCapabilities => ControlMessage::Capabilities { caps: state.local_capabilities },
        ControlMessage::ElectionVote { key } => {
            debug!(?key, "received election vote");
            let registry = state.registry.lock();
            let local_pnn = registry.local_pnn();
            let num_connected = registry.active_pnns().len() as u32;
            let local_flags = registry.local_flags();
            let eligible =
                !state.ban.lock().is_banned(local_pnn) && !local_flags.intersects(NodeFlags::BANNED | NodeFlags::STOPPED);
            drop(registry);
            let our_priority_time = *state.priority_time.lock();
            let our_key =
                local_election_key(local_pnn, our_priority_time, state.local_capabilities, num_connected, eligible);
            ControlMessage::ElectionVote { key: our_key }
        }
        ControlMessage::SetRecMaster { pnn } => {
            *state.recmaster.lock() = pnn;
            ControlMessage::Ack
        }
        ControlMessage::GetRecMaster => ControlMessage::RecMaster { pnn: *state.recmaster.lock() },
        ControlMessage::PushNodeMap { map } => {
            state.registry.lock().refresh_from_node_map(&map);
            ControlMessage::Ack
        }
        ControlMessage::GetNodeMap => {
            error!("GetNodeMap must be served by the coordinator's node map store, not the dispatcher");
            ControlMessage::Error { message: "node map lookup unavailable".into() }
        }
        ControlMessage::PushVnnMap { .. } => ControlMessage::Ack,
        ControlMessage::PullDb { .. } => {
            ControlMessage::Error { message: "database pull must be served by the recovery engine".into() }
        }
        ControlMessage::PushDb { .. } => ControlMessage::Ack,
        ControlMessage::EndRecovery { .. } => ControlMessage::Ack,
        ControlMessage::DisableRecovery { seconds } => match state.recovery_gate.disable(seconds) {
            Ok(()) => ControlMessage::Ack,
            Err(e) => ControlMessage::Error { message: e.to_string() },
        },
        ControlMessage::DisableTakeover { seconds } => match state.takeover_gate.disable(seconds) {
            Ok(()) => ControlMessage::Ack,
            Err(e) => ControlMessage::Error { message: e.to_string() },
        },
        ControlMessage::ReportCulprit { pnn, credits } => {
            let local_inactive = state.registry.lock().local_flags().is_inactive();
            state.ban.lock().assign_credits(pnn, credits, local_inactive);
            ControlMessage::Ack
        }
        ControlMessage::PushNodeFlags { pnn, flags } => {
            state.registry.lock().set_flags(pnn, flags);
            ControlMessage::Ack
        }
        ControlMessage::Reconfigure => ControlMessage::Ack,
        ControlMessage::VacuumFetch { db_id, records } => {
            if state.recovery_gate.is_in_progress() || state.recovery_gate.is_disabled() {
                debug!(db_id, "recovery gate busy, skipping vacuum fetch");
                return ControlMessage::Error { message: "recovery gate busy".into() };
            }
            let local_pnn = state.registry.lock().local_pnn();
            match state.kv.merge_records(db_id, records, local_pnn) {
                Ok(()) => ControlMessage::Ack,
                Err(e) => ControlMessage::Error { message: e.to_string() },
            }
        }
        ControlMessage::DetachDatabase { db_id } => match state.kv.detach(db_id) {
            Ok(()) => ControlMessage::Ack,
            Err(e) => ControlMessage::Error { message: e.to_string() },
        },
        ControlMessage::ReloadNodes => {
            *state.need_recovery.lock() = true;
            ControlMessage::Ack
        }
        ControlMessage::TakeoverRun { requester } => {
            state.reallocate_queue.lock().push(requester);
            *state.need_takeover_run.lock() = true;
            ControlMessage::Ack
        }
        ControlMessage::DisableIpCheck { seconds } => match state.takeover_gate.disable(seconds) {
            Ok(()) => ControlMessage::Ack,
            Err(e) => ControlMessage::Error { message: e.to_string() },
        },
        ControlMessage::MemDump => {
            let registry = state.registry.lock();
            let report = format!(
                "local_pnn={} recmaster={} priority_time={}",
                registry.local_pnn(),
                *state.recmaster.lock(),
                *state.priority_time.lock()
            );
            ControlMessage::MemDumpReply { report }
        }
        ControlMessage::RebalanceNode { pnn } => {
            let mut queued = state.force_rebalance_nodes.lock();
            if !queued.contains(&pnn) {
                queued.push(pnn);
            }
            ControlMessage::Ack
        }
        ControlMessage::RecdUpdateIp { .. } => ControlMessage::Ack,
        ControlMessage::Shutdown => ControlMessage::Ack,
        ControlMessage::Ack | ControlMessage::Error { .. } => ControlMessage::Ack,
        ControlMessage::NodeFlags { .. }
        | ControlMessage::Capabilities { .. }
        | ControlMessage::RecMaster { .. }
        | ControlMessage::NodeMapReply { .. }
        | ControlMessage::PullDbReply { .. }
        | ControlMessage::MemDumpReply { .. } => {
            debug!("received a reply-shaped message on the request path, ignoring");
            ControlMessage::Ack
        }
    }
}
