// src/coordinator.rs

//! Wires every core component into the running coordinator process: loads
//! configuration, opens the working store, and spawns the monitor loop and
//! Control RPC listener as supervised tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::core::ban::BanBookkeeper;
use crate::core::dispatcher::{self, DispatcherState};
use crate::core::gate::OperationGate;
use crate::core::kv::KvStore;
use crate::core::model::{Capabilities, DbDescriptor, DbFlags, NodeMap, RecoveryMode, UNKNOWN_PNN};
use crate::core::monitor::{self, MonitorContext, MonitorTunables};
use crate::core::reclock::{build_recovery_lock, RecoveryLock};
use crate::core::recovery::HelperConfig;
use crate::core::registry::NodeRegistry;
use crate::core::rpc::{RpcTransport, TcpTransport};

/// Control socket of the local data daemon this coordinator manages
/// recovery for. Passed to the recovery helper so it knows which daemon to
/// attach to; the daemon itself is owned by a process outside this crate.
const DEFAULT_DAEMON_SOCKET: &str = "/var/run/ctdb/ctdbd.socket";

/// The default database set this coordinator manages. A real deployment
/// reads this from the data daemon on startup; fixed here since database
/// discovery is owned by that external daemon, not this crate.
fn default_databases() -> Vec<DbDescriptor> {
    vec![
        DbDescriptor { db_id: 1, name: "volatile".into(), flags: DbFlags::empty() },
        DbDescriptor { db_id: 2, name: "persistent".into(), flags: DbFlags::PERSISTENT },
    ]
}

/// Runs the coordinator to completion (i.e. forever, until a task fails).
pub async fn run(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    std::fs::create_dir_all(&config.coordinator.state_dir)
        .with_context(|| format!("failed to create state dir {}", config.coordinator.state_dir.display()))?;

    let kv = Arc::new(
        KvStore::open(config.coordinator.state_dir.join("working.db"))
            .context("failed to open working recovery database")?,
    );

    // The recovery lock is acquired and released by the monitor loop itself,
    // tied to winning and losing the recmaster election (see
    // `monitor::tick`) — never held across the whole process lifetime, since
    // every node in the cluster contends for the same lock.
    let recovery_lock = build_recovery_lock(config.coordinator.recovery_lock_file.as_deref());

    let node_map: NodeMap = config.initial_node_map();

    let transport: Arc<dyn RpcTransport> = Arc::new(TcpTransport);
    let recovery_gate = OperationGate::new("recovery");
    let takeover_gate = OperationGate::new("takeover");
    let local_capabilities = Capabilities::RECMASTER | Capabilities::LMASTER | Capabilities::PARALLEL_RECOVERY;
    let ban = Arc::new(Mutex::new(BanBookkeeper::new(config.tunables.grace_period, config.tunables.ban_period)));

    let mut dispatcher_registry = NodeRegistry::new(config.coordinator.pnn);
    dispatcher_registry.refresh_from_node_map(&node_map);
    let dispatcher_state = Arc::new(DispatcherState {
        registry: Mutex::new(dispatcher_registry),
        ban: ban.clone(),
        recovery_gate: recovery_gate.clone(),
        takeover_gate: takeover_gate.clone(),
        local_capabilities,
        recmaster: Mutex::new(UNKNOWN_PNN),
        priority_time: Mutex::new(0),
        kv: kv.clone(),
        need_recovery: Mutex::new(false),
        need_takeover_run: Mutex::new(false),
        force_rebalance_nodes: Mutex::new(Vec::new()),
        reallocate_queue: Mutex::new(Vec::new()),
    });

    let mut tasks = JoinSet::new();

    let listen_addr = config.coordinator.listen_addr;
    let dispatcher_for_listener = dispatcher_state.clone();
    tasks.spawn(async move {
        dispatcher::serve(listen_addr, dispatcher_for_listener)
            .await
            .map_err(anyhow::Error::from)
    });

    let local_pnn = config.coordinator.pnn;
    let nodes_file = config.coordinator.nodes_file.clone();
    let monitor_transport = transport.clone();
    let monitor_kv = kv.clone();
    let monitor_dispatcher = dispatcher_state.clone();
    tasks.spawn(async move {
        run_monitor_loop(
            config,
            monitor_transport,
            monitor_kv,
            monitor_dispatcher,
            node_map,
            recovery_gate,
            takeover_gate,
            ban,
            recovery_lock,
        )
        .await
    });

    info!(
        pnn = local_pnn,
        listen_addr = %listen_addr,
        nodes_file = %nodes_file.display(),
        "coordinator started"
    );

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "coordinator task failed");
                return Err(e);
            }
            Err(join_err) => {
                error!(error = %join_err, "coordinator task panicked");
                return Err(join_err.into());
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_monitor_loop(
    config: Config,
    transport: Arc<dyn RpcTransport>,
    kv: Arc<KvStore>,
    dispatcher: Arc<DispatcherState>,
    node_map: NodeMap,
    recovery_gate: OperationGate,
    takeover_gate: OperationGate,
    ban: Arc<Mutex<BanBookkeeper>>,
    recovery_lock: Box<dyn RecoveryLock>,
) -> Result<()> {
    let mut registry = NodeRegistry::new(config.coordinator.pnn);
    registry.refresh_from_node_map(&node_map);

    let local_capabilities = Capabilities::RECMASTER | Capabilities::LMASTER | Capabilities::PARALLEL_RECOVERY;
    let databases = default_databases();
    let tunables = MonitorTunables {
        recover_interval: config.tunables.recover_interval,
        election_timeout: config.tunables.election_timeout,
        recover_timeout: config.tunables.recover_timeout,
        recover_by_seqnum: config.tunables.recover_by_seqnum,
    };
    let helper = config.coordinator.recovery_helper_path.as_ref().map(|helper_path| HelperConfig {
        helper_path: helper_path.clone(),
        socket_name: DEFAULT_DAEMON_SOCKET.to_string(),
        state_dir: config.coordinator.state_dir.clone(),
    });

    let mut recmaster = UNKNOWN_PNN;
    let mut generation = kv.last_generation().unwrap_or(None).unwrap_or(0);
    let mut priority_time: u64 = 0;
    let mut lock_held = false;
    let mut recovery_mode = RecoveryMode::Normal;
    let mut frozen_on_inactive = false;

    loop {
        let mut ctx = MonitorContext {
            transport: transport.as_ref(),
            registry: &mut registry,
            ban: &ban,
            kv: kv.as_ref(),
            recovery_gate: &recovery_gate,
            takeover_gate: &takeover_gate,
            local_capabilities,
            recmaster: &mut recmaster,
            generation: &mut generation,
            databases: &databases,
            tunables: &tunables,
            helper: helper.as_ref(),
            takeover_runner: None,
            recovery_lock: recovery_lock.as_ref(),
            lock_held: &mut lock_held,
            priority_time: &mut priority_time,
            recovery_mode: &mut recovery_mode,
            frozen_on_inactive: &mut frozen_on_inactive,
            dispatcher: dispatcher.as_ref(),
        };
        if let Err(e) = monitor::tick(&mut ctx, &node_map).await {
            error!(error = %e, "monitor tick failed");
        }
        tokio::time::sleep(Duration::from_millis(tunables.recover_interval.as_millis() as u64)).await;
    }
}
