// src/core/takeover.rs

//! The takeover coordinator: the distinct step after recovery has rebuilt
//! and pushed the virtual node-number map (see `recovery::run_recovery`'s
//! Phase 7). Takeover's own job is to pause every node's recovery while an
//! external Takeover Runner process reassigns public IP addresses to match
//! the new map, then resume, clear any forced-rebalance requests the run
//! satisfied, and answer every queued reallocate request with the winning
//! master's pnn (or [`UNKNOWN_PNN`] on failure).
//!
//! Gated the same way recovery is, so an election settling mid-takeover
//! cannot race a second takeover run.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::ban::BanBookkeeper;
use crate::core::errors::Result;
use crate::core::gate::{GateGuard, OperationGate};
use crate::core::helper;
use crate::core::model::{Pnn, VnnMap, UNKNOWN_PNN};
use crate::core::registry::NodeRegistry;
use crate::core::rpc::{fan_out, ControlMessage, RpcTransport};

/// Configuration for the external Takeover Runner process. Absent when no
/// runner binary is configured, in which case a takeover is considered
/// complete once every node has paused and resumed recovery around it.
#[derive(Debug, Clone)]
pub struct TakeoverRunnerConfig {
    pub runner_path: PathBuf,
    pub socket_name: String,
    pub state_dir: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct TakeoverReport {
    pub generation: u32,
    pub acknowledged: usize,
    pub expected: usize,
    pub succeeded: bool,
}

/// Runs one takeover against `vnn_map` (already pushed to every node by the
/// recovery run that produced it). `ban_on_fail` assigns ban credits against
/// any peer that fails to pause for the run. `force_rebalance_nodes` and
/// `reallocate_queue` are drained here: the former is cleared only on
/// success, the latter is always drained and every queued pnn gets a reply.
#[allow(clippy::too_many_arguments)]
pub async fn run_takeover(
    transport: &dyn RpcTransport,
    gate: &OperationGate,
    registry: &NodeRegistry,
    ban: &Arc<Mutex<BanBookkeeper>>,
    vnn_map: &VnnMap,
    run_timeout: Duration,
    ban_on_fail: bool,
    runner: Option<&TakeoverRunnerConfig>,
    force_rebalance_nodes: &mut Vec<Pnn>,
    reallocate_queue: &mut Vec<Pnn>,
) -> Result<TakeoverReport> {
    let _guard = GateGuard::acquire(gate)?;

    let local_pnn = registry.local_pnn();
    let peers: Vec<(Pnn, SocketAddr)> = registry
        .active_pnns()
        .into_iter()
        .filter(|&pnn| pnn != local_pnn)
        .filter_map(|pnn| registry.address(pnn).map(|addr| (pnn, addr)))
        .collect();

    info!(generation = vnn_map.generation, peers = peers.len(), "starting takeover run");

    let pause_pnns = run_timeout.as_secs().max(1);
    let pause_replies =
        fan_out(transport, &peers, ControlMessage::DisableRecovery { seconds: pause_pnns }, run_timeout).await;
    let paused: Vec<Pnn> = peers
        .iter()
        .filter(|(pnn, _)| matches!(pause_replies.get(pnn), Some(ControlMessage::Ack)))
        .map(|(pnn, _)| *pnn)
        .collect();

    let mut succeeded = paused.len() == peers.len();
    if !succeeded {
        warn!(
            generation = vnn_map.generation,
            paused = paused.len(),
            expected = peers.len(),
            "not every node paused recovery for the takeover run"
        );
        if ban_on_fail {
            for (pnn, _) in peers.iter().filter(|(pnn, _)| !paused.contains(pnn)) {
                ban.lock().assign_credits(*pnn, 1, false);
            }
        }
    }

    if succeeded && let Some(cfg) = runner {
        if let Err(e) =
            helper::spawn_and_wait(&cfg.runner_path, &cfg.socket_name, vnn_map.generation, &cfg.state_dir, run_timeout)
                .await
        {
            warn!(error = %e, "takeover runner failed");
            succeeded = false;
        }
    }

    fan_out(transport, &peers, ControlMessage::DisableRecovery { seconds: 0 }, run_timeout).await;

    if succeeded {
        force_rebalance_nodes.clear();
    }

    let waiters = std::mem::take(reallocate_queue);
    if !waiters.is_empty() {
        let reply_pnn = if succeeded { local_pnn } else { UNKNOWN_PNN };
        let waiter_targets: Vec<(Pnn, SocketAddr)> =
            waiters.iter().copied().filter_map(|pnn| registry.address(pnn).map(|addr| (pnn, addr))).collect();
        fan_out(transport, &waiter_targets, ControlMessage::SetRecMaster { pnn: reply_pnn }, run_timeout).await;
    }

    info!(
        generation = vnn_map.generation,
        paused = paused.len(),
        expected = peers.len(),
        succeeded,
        "takeover run complete"
    );

    Ok(TakeoverReport { generation: vnn_map.generation, acknowledged: paused.len(), expected: peers.len(), succeeded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{NodeEntry, NodeFlags, NodeMap};
    use crate::core::rpc::FakeTransport;
    use std::time::Duration as StdDuration;

    fn addr() -> SocketAddr {
        "127.0.0.1:8500".parse().unwrap()
    }

    fn ban() -> Arc<Mutex<BanBookkeeper>> {
        Arc::new(Mutex::new(BanBookkeeper::new(StdDuration::from_secs(60), StdDuration::from_secs(30))))
    }

    #[tokio::test]
    async fn takeover_run_pauses_peers_and_clears_rebalance_on_success() {
        let mut registry = NodeRegistry::new(0);
        registry.refresh_from_node_map(&NodeMap {
            nodes: vec![
                NodeEntry { pnn: 0, flags: NodeFlags::empty(), address: addr() },
                NodeEntry { pnn: 1, flags: NodeFlags::empty(), address: addr() },
            ],
        });
        let transport = FakeTransport::new();
        transport.register(1, |_| async { ControlMessage::Ack }).await;

        let gate = OperationGate::new("takeover");
        let vnn_map = VnnMap::new(3, vec![0, 1]);
        let mut force_rebalance_nodes = vec![1];
        let mut reallocate_queue = vec![];
        let report = run_takeover(
            &transport,
            &gate,
            &registry,
            &ban(),
            &vnn_map,
            Duration::from_millis(200),
            false,
            None,
            &mut force_rebalance_nodes,
            &mut reallocate_queue,
        )
        .await
        .unwrap();

        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.expected, 1);
        assert!(report.succeeded);
        assert!(force_rebalance_nodes.is_empty());
        assert!(!gate.is_in_progress());
    }

    #[tokio::test]
    async fn takeover_run_respects_gate_in_progress() {
        let registry = NodeRegistry::new(0);
        let gate = OperationGate::new("takeover");
        let _held = GateGuard::acquire(&gate).unwrap();
        let transport = FakeTransport::new();
        let vnn_map = VnnMap::new(1, vec![0]);
        let mut force_rebalance_nodes = vec![];
        let mut reallocate_queue = vec![];
        let result = run_takeover(
            &transport,
            &gate,
            &registry,
            &ban(),
            &vnn_map,
            Duration::from_millis(100),
            false,
            None,
            &mut force_rebalance_nodes,
            &mut reallocate_queue,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_pause_bans_on_fail_and_replies_unknown_to_waiters() {
        let mut registry = NodeRegistry::new(0);
        registry.refresh_from_node_map(&NodeMap {
            nodes: vec![
                NodeEntry { pnn: 0, flags: NodeFlags::empty(), address: addr() },
                NodeEntry { pnn: 1, flags: NodeFlags::empty(), address: addr() },
            ],
        });
        // node 1 has no handler registered, so it never acks the pause.
        let transport = FakeTransport::new();
        transport.register(2, |_| async { ControlMessage::Ack }).await;

        let gate = OperationGate::new("takeover");
        let ban = ban();
        let vnn_map = VnnMap::new(1, vec![0, 1]);
        let mut force_rebalance_nodes = vec![1];
        let mut reallocate_queue = vec![2];
        let report = run_takeover(
            &transport,
            &gate,
            &registry,
            &ban,
            &vnn_map,
            Duration::from_millis(100),
            true,
            None,
            &mut force_rebalance_nodes,
            &mut reallocate_queue,
        )
        .await
        .unwrap();

        assert!(!report.succeeded);
        assert_eq!(ban.lock().credits(1), 1);
        assert_eq!(force_rebalance_nodes, vec![1]);
        assert!(reallocate_queue.is_empty());
    }
}
