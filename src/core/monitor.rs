// src/core/monitor.rs

//! The monitor loop: the coordinator's heartbeat. Each iteration refreshes
//! node state, sweeps ban credits, checks whether the cluster agrees on who
//! is recovery master, and triggers an election, a recovery run, or a
//! takeover run as needed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::ban::BanBookkeeper;
use crate::core::dispatcher::DispatcherState;
use crate::core::election::{local_election_key, run_election_round};
use crate::core::errors::Result;
use crate::core::gate::OperationGate;
use crate::core::kv::KvStore;
use crate::core::model::{Capabilities, DbDescriptor, NodeFlags, NodeMap, Pnn, RecoveryMode, UNKNOWN_PNN};
use crate::core::reclock::RecoveryLock;
use crate::core::recovery::{run_recovery, HelperConfig};
use crate::core::registry::NodeRegistry;
use crate::core::rpc::{fan_out, ControlMessage, RpcTransport};
use crate::core::takeover::{run_takeover, TakeoverRunnerConfig};

/// Tunables controlling monitor loop pacing. Mirrors the `[tunables]`
/// section of the on-disk configuration.
#[derive(Debug, Clone)]
pub struct MonitorTunables {
    pub recover_interval: Duration,
    pub election_timeout: Duration,
    pub recover_timeout: Duration,
    pub recover_by_seqnum: bool,
}

/// Everything one monitor iteration needs. Bundled so `tick` can be called
/// repeatedly from `run` or directly from a test without constructing a full
/// `Coordinator`.
pub struct MonitorContext<'a> {
    pub transport: &'a dyn RpcTransport,
    pub registry: &'a mut NodeRegistry,
    pub ban: &'a Arc<Mutex<BanBookkeeper>>,
    pub kv: &'a KvStore,
    pub recovery_gate: &'a OperationGate,
    pub takeover_gate: &'a OperationGate,
    pub local_capabilities: Capabilities,
    pub recmaster: &'a mut Pnn,
    pub generation: &'a mut u32,
    pub databases: &'a [DbDescriptor],
    pub tunables: &'a MonitorTunables,
    pub helper: Option<&'a HelperConfig>,
    pub takeover_runner: Option<&'a TakeoverRunnerConfig>,
    /// The cluster-wide mutual-exclusion lock; acquired only on winning the
    /// recmaster election and released as soon as the local node stops being
    /// recmaster, never held across the process lifetime.
    pub recovery_lock: &'a dyn RecoveryLock,
    pub lock_held: &'a mut bool,
    /// This node's election round counter. Reset to zero whenever the node
    /// is STOPPED/BANNED or its ban just expired, so a node cannot reclaim
    /// master on the strength of a counter it accrued while ineligible.
    pub priority_time: &'a mut u64,
    pub recovery_mode: &'a mut RecoveryMode,
    /// Idempotent latch so the STOPPED/BANNED freeze is only logged once per
    /// ineligibility window, not on every tick it persists.
    pub frozen_on_inactive: &'a mut bool,
    /// Deferred flags and queues the dispatcher populates from inbound
    /// Control RPC requests (`ReloadNodes`, `TakeoverRun`, `RebalanceNode`),
    /// drained here so the dispatcher's request path never itself runs
    /// recovery or takeover.
    pub dispatcher: &'a DispatcherState,
}

/// Outcome of one monitor iteration, mainly for logging and tests.
#[derive(Debug, Default, Clone)]
pub struct TickOutcome {
    pub election_ran: bool,
    pub became_master: bool,
    pub recovery_ran: bool,
    pub takeover_ran: bool,
    pub self_banned: bool,
}

/// Fetches the current node map from the recmaster (or, if unknown, refuses
/// and forces an election). A node with no recmaster always runs an
/// election before anything else.
pub fn needs_election(recmaster: Pnn, local_flags_inactive: bool) -> bool {
    recmaster == UNKNOWN_PNN && !local_flags_inactive
}

/// The master is considered valid only if it is an active node whose node
/// map shape matches ours and who still claims to be recmaster when asked.
pub async fn validate_master(
    transport: &dyn RpcTransport,
    registry: &NodeRegistry,
    recmaster: Pnn,
    timeout: Duration,
) -> bool {
    if recmaster == UNKNOWN_PNN {
        return false;
    }
    if registry.flags(recmaster).is_inactive() {
        return false;
    }
    let Some(addr) = registry.address(recmaster) else {
        return false;
    };
    let targets = [(recmaster, addr)];
    let replies = fan_out(transport, &targets, ControlMessage::GetRecMaster, timeout).await;
    matches!(replies.get(&recmaster), Some(ControlMessage::RecMaster { pnn }) if *pnn == recmaster)
}

/// Fetches each active peer's advertised capability bitset and folds it into
/// the registry, along with this node's own advertised capabilities. Nodes
/// that do not reply within `timeout` keep whatever capabilities the
/// registry last knew about them.
pub async fn refresh_capabilities(
    transport: &dyn RpcTransport,
    registry: &mut NodeRegistry,
    local_capabilities: Capabilities,
    timeout: Duration,
) {
    let local_pnn = registry.local_pnn();
    registry.set_capabilities(local_pnn, local_capabilities);
    let targets: Vec<(Pnn, SocketAddr)> = registry
        .active_pnns()
        .into_iter()
        .filter(|&pnn| pnn != local_pnn)
        .filter_map(|pnn| registry.address(pnn).map(|addr| (pnn, addr)))
        .collect();
    let replies = fan_out(transport, &targets, ControlMessage::GetCapabilities, timeout).await;
    for (pnn, msg) in replies {
        if let ControlMessage::Capabilities { caps } = msg {
            registry.set_capabilities(pnn, caps);
        }
    }
}

/// Confirms every active node agrees on who recmaster is. Disagreement
/// triggers a fresh election on the next tick rather than mid-tick, so a
/// single iteration never both elects and re-elects.
pub async fn verify_recmaster(
    transport: &dyn RpcTransport,
    registry: &NodeRegistry,
    expected: Pnn,
    timeout: Duration,
) -> bool {
    let local_pnn = registry.local_pnn();
    let targets: Vec<(Pnn, SocketAddr)> = registry
        .active_pnns()
        .into_iter()
        .filter(|&pnn| pnn != local_pnn)
        .filter_map(|pnn| registry.address(pnn).map(|addr| (pnn, addr)))
        .collect();
    let replies = fan_out(transport, &targets, ControlMessage::GetRecMaster, timeout).await;
    replies
        .values()
        .all(|msg| matches!(msg, ControlMessage::RecMaster { pnn } if *pnn == expected))
}

/// Runs one monitor iteration to completion.
pub async fn tick(ctx: &mut MonitorContext<'_>, node_map: &NodeMap) -> Result<TickOutcome> {
    let mut outcome = TickOutcome::default();
    let local_pnn = ctx.registry.local_pnn();

    ctx.registry.refresh_from_node_map(node_map);

    let sweep = ctx.ban.lock().sweep(local_pnn, ctx.registry.node_count());
    if sweep.self_banned {
        outcome.self_banned = true;
        warn!(pnn = local_pnn, "local node is self-banned, standing down this tick");
        return Ok(outcome);
    }
    if sweep.newly_unbanned.contains(&local_pnn) {
        info!(pnn = local_pnn, "local node's ban expired, resetting priority_time");
        *ctx.priority_time = 0;
    }

    let local_flags = ctx.registry.local_flags();
    if local_flags.intersects(NodeFlags::STOPPED | NodeFlags::BANNED) {
        *ctx.recovery_mode = RecoveryMode::Active;
        *ctx.priority_time = 0;
        if !*ctx.frozen_on_inactive {
            warn!(pnn = local_pnn, ?local_flags, "local node stopped or banned, freezing until active again");
            *ctx.frozen_on_inactive = true;
        }
        return Ok(outcome);
    }
    *ctx.frozen_on_inactive = false;
    *ctx.priority_time = ctx.priority_time.wrapping_add(1);

    let local_inactive = local_flags.is_inactive();

    refresh_capabilities(ctx.transport, ctx.registry, ctx.local_capabilities, ctx.tunables.election_timeout).await;

    let master_ok = !needs_election(*ctx.recmaster, local_inactive)
        && validate_master(ctx.transport, ctx.registry, *ctx.recmaster, ctx.tunables.election_timeout).await
        && verify_recmaster(ctx.transport, ctx.registry, *ctx.recmaster, ctx.tunables.election_timeout).await;

    if !master_ok {
        outcome.election_ran = true;
        let num_connected = ctx.registry.active_pnns().len() as u32;
        let eligible = !local_flags.intersects(NodeFlags::BANNED | NodeFlags::STOPPED);
        let key = local_election_key(local_pnn, *ctx.priority_time, ctx.local_capabilities, num_connected, eligible);
        let result = run_election_round(ctx.transport, ctx.registry, key, ctx.tunables.election_timeout).await;

        if result.winner == local_pnn {
            if !*ctx.lock_held {
                match ctx.recovery_lock.acquire(local_pnn).await {
                    Ok(()) => *ctx.lock_held = true,
                    Err(e) => {
                        warn!(pnn = local_pnn, error = %e, "recovery lock unavailable, cannot become master this tick");
                        *ctx.recmaster = UNKNOWN_PNN;
                        return Ok(outcome);
                    }
                }
            }
            *ctx.recmaster = result.winner;
            outcome.became_master = true;
        } else {
            *ctx.recmaster = result.winner;
            outcome.became_master = false;
        }
        info!(recmaster = *ctx.recmaster, became_master = outcome.became_master, "election settled");
    }

    if *ctx.recmaster != local_pnn {
        if *ctx.lock_held {
            ctx.recovery_lock.release().await;
            *ctx.lock_held = false;
        }
        debug!(recmaster = *ctx.recmaster, "not recovery master, skipping recovery and takeover");
        return Ok(outcome);
    }

    if std::mem::take(&mut *ctx.dispatcher.need_recovery.lock()) {
        debug!(pnn = local_pnn, "a peer requested a node map reload, forcing recovery this tick");
    }

    *ctx.generation = ctx.generation.wrapping_add(1);
    let report = run_recovery(
        ctx.transport,
        ctx.registry,
        ctx.kv,
        ctx.recovery_gate,
        ctx.ban,
        *ctx.generation,
        ctx.databases,
        ctx.tunables.recover_timeout,
        ctx.tunables.recover_by_seqnum,
        ctx.helper,
    )
    .await?;
    outcome.recovery_ran = true;
    info!(generation = report.generation, recovered = report.databases_recovered, "recovery triggered by monitor tick");

    let needs_takeover = std::mem::take(&mut *ctx.dispatcher.need_takeover_run.lock());
    let mut force_rebalance_nodes = std::mem::take(&mut *ctx.dispatcher.force_rebalance_nodes.lock());
    let mut reallocate_queue = std::mem::take(&mut *ctx.dispatcher.reallocate_queue.lock());
    if needs_takeover || !force_rebalance_nodes.is_empty() || !reallocate_queue.is_empty() {
        let takeover_report = run_takeover(
            ctx.transport,
            ctx.takeover_gate,
            ctx.registry,
            ctx.ban,
            &report.vnn_map,
            ctx.tunables.recover_timeout,
            true,
            ctx.takeover_runner,
            &mut force_rebalance_nodes,
            &mut reallocate_queue,
        )
        .await?;
        outcome.takeover_ran = takeover_report.succeeded;
    } else {
        outcome.takeover_ran = true;
    }
    *ctx.dispatcher.force_rebalance_nodes.lock() = force_rebalance_nodes;
    *ctx.dispatcher.reallocate_queue.lock() = reallocate_queue;

    Ok(outcome)
}
