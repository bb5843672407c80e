// src/core/recovery.rs

//! The database recovery engine: for every known database, pulls each
//! active node's records, merges them into one authoritative set, and pushes
//! the result back out. This is the most expensive step of a recovery run
//! and the one every other component (election, ban bookkeeping, the
//! takeover coordinator) exists to gate and trigger correctly.
//!
//! Persistent databases carry a shortcut: if every active node already
//! agrees on the same highest sequence number for a database, the full
//! pull/merge/push cycle is skipped entirely, since there is nothing to
//! reconcile.

use std::collections::{BTreeMap, HashMap};
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
use crate::core::kv::KvStore;
use crate::core::model::{merge_records, Capabilities, DbDescriptor, DbId, Pnn, Record, RecordFlags, VnnMap};
use crate::core::registry::NodeRegistry;
use crate::core::rpc::{fan_out, ControlMessage, RpcTransport};

/// Configuration for the out-of-process parallel-recovery path. Absent when
/// no helper binary is configured, in which case recovery always runs
/// in-process regardless of what peers advertise.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub helper_path: PathBuf,
    pub socket_name: String,
    pub state_dir: PathBuf,
}

/// Summary of one completed recovery run, used for logging and for the
/// monitor loop's decision about whether to re-run recovery immediately.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub generation: u32,
    pub databases_recovered: usize,
    pub databases_shortcut: usize,
    pub records_merged: HashMap<DbId, usize>,
    /// The rebuilt virtual node-number map, pushed to every active peer as
    /// the last phase of this run. The distinct Takeover concern (external
    /// IP placement) consumes this map but does not rebuild or push it.
    pub vnn_map: VnnMap,
}

fn local_highest_seqnum(records: &BTreeMap<Vec<u8>, Record>) -> u64 {
    records.values().map(|r| r.header.rsn).max().unwrap_or(0)
}

/// Attempts the persistent-database seqnum shortcut. Returns `Some(())` if
/// every reachable active peer agreed with the local highest seqnum and no
/// further work is needed for this database.
async fn try_seqnum_shortcut(
    transport: &dyn RpcTransport,
    targets: &[(Pnn, SocketAddr)],
    db_id: DbId,
    local_seqnum: u64,
    timeout: Duration,
) -> bool {
    if targets.is_empty() {
        return true;
    }
    let replies = fan_out(transport, targets, ControlMessage::PullDb { db_id, only_seqnum: true }, timeout).await;
    if replies.len() != targets.len() {
        return false;
    }
    replies.values().all(|msg| matches!(
        msg,
        ControlMessage::PullDbReply { seqnum, .. } if *seqnum == local_seqnum
    ))
}

#[allow(clippy::too_many_arguments)]
async fn recover_one_database(
    transport: &dyn RpcTransport,
    kv: &KvStore,
    db: &DbDescriptor,
    targets: &[(Pnn, SocketAddr)],
    local_pnn: Pnn,
    pull_timeout: Duration,
    recover_by_seqnum: bool,
) -> Result<(usize, bool)> {
    let mut working: BTreeMap<Vec<u8>, Record> = kv
        .traverse(db.db_id)?
        .into_iter()
        .map(|r| (r.key.clone(), r))
        .collect();

    if db.is_persistent() && recover_by_seqnum {
        let local_seqnum = local_highest_seqnum(&working);
        if try_seqnum_shortcut(transport, targets, db.db_id, local_seqnum, pull_timeout).await {
            info!(db_id = db.db_id, name = %db.name, "persistent database already converged, skipping pull");
            return Ok((0, true));
        }
    }

    let replies = fan_out(
        transport,
        targets,
        ControlMessage::PullDb { db_id: db.db_id, only_seqnum: false },
        pull_timeout,
    )
    .await;

    let before = working.len();
    let mut merged = 0usize;
    for msg in replies.values() {
        if let ControlMessage::PullDbReply { records, .. } = msg {
            let before_merge = working.len();
            merge_records(&mut working, records.clone(), local_pnn);
            merged += records.len().max(working.len().saturating_sub(before_merge));
        }
    }

    // Push-phase finalization: every surviving record is handed to the new
    // master (this node) and marked as having traveled with data, and for
    // non-persistent databases an empty record (a local-only placeholder,
    // not a tombstone) is dropped rather than propagated. Persistent
    // databases keep empty records, since those are committed deletions that
    // must survive recovery.
    if !db.is_persistent() {
        working.retain(|_, rec| !rec.is_empty());
    }
    for rec in working.values_mut() {
        rec.header.dmaster = local_pnn;
        rec.header.flags |= RecordFlags::MIGRATED_WITH_DATA;
    }

    kv.store_records(db.db_id, &working.values().cloned().collect::<Vec<_>>())?;

    let push_replies = fan_out(
        transport,
        targets,
        ControlMessage::PushDb { db_id: db.db_id, records: working.values().cloned().collect() },
        pull_timeout,
    )
    .await;
    if push_replies.len() != targets.len() {
        warn!(
            db_id = db.db_id,
            acked = push_replies.len(),
            expected = targets.len(),
            "not every node acknowledged the recovered database push"
        );
    }

    info!(
        db_id = db.db_id,
        name = %db.name,
        records = working.len(),
        grew_by = working.len().saturating_sub(before),
        "database recovery complete"
    );

    Ok((merged, false))
}

/// Runs a full recovery pass across every database. Held entirely behind the
/// recovery operation gate so at most one run proceeds at a time, and so
/// other components can disable recovery runs while e.g. an election is
/// settling.
#[allow(clippy::too_many_arguments)]
pub async fn run_recovery(
    transport: &dyn RpcTransport,
    registry: &NodeRegistry,
    kv: &KvStore,
    gate: &OperationGate,
    ban: &Arc<Mutex<BanBookkeeper>>,
    generation: u32,
    databases: &[DbDescriptor],
    pull_timeout: Duration,
    recover_by_seqnum: bool,
    helper: Option<&HelperConfig>,
) -> Result<RecoveryReport> {
    let _guard = GateGuard::acquire(gate)?;

    let local_pnn = registry.local_pnn();
    let active = registry.active_pnns();
    let targets: Vec<(Pnn, SocketAddr)> = active
        .iter()
        .copied()
        .filter(|&pnn| pnn != local_pnn)
        .filter_map(|pnn| registry.address(pnn).map(|addr| (pnn, addr)))
        .collect();

    info!(generation, databases = databases.len(), peers = targets.len(), "starting recovery run");

    let mut report = RecoveryReport {
        generation,
        ..Default::default()
    };

    let parallel = match helper {
        Some(cfg) if registry.all_have_capability(&active, Capabilities::PARALLEL_RECOVERY) => Some(cfg),
        _ => None,
    };

    if let Some(cfg) = parallel {
        info!(generation, "delegating recovery to the out-of-process helper");
        helper::spawn_and_wait(&cfg.helper_path, &cfg.socket_name, generation, &cfg.state_dir, pull_timeout).await?;
        report.databases_recovered = databases.len();
    } else {
        for db in databases {
            let (merged, shortcut) =
                recover_one_database(transport, kv, db, &targets, local_pnn, pull_timeout, recover_by_seqnum).await?;
            report.records_merged.insert(db.db_id, merged);
            report.databases_recovered += 1;
            if shortcut {
                report.databases_shortcut += 1;
            }
        }
    }

    kv.set_last_generation(generation)?;
    kv.set_last_recmaster(local_pnn)?;
    ban.lock().forgive_all();

    // Phase 7: rebuild the vnn map for this generation and push it out so
    // every node agrees on key-space ownership before the distinct Takeover
    // step (external IP placement) runs against it.
    let vnn_map = VnnMap::new(generation, active.clone());
    let vnn_replies = fan_out(transport, &targets, ControlMessage::PushVnnMap { map: vnn_map.clone() }, pull_timeout).await;
    let vnn_acked = vnn_replies.values().filter(|m| matches!(m, ControlMessage::Ack)).count();
    if vnn_acked != targets.len() {
        warn!(generation, acked = vnn_acked, expected = targets.len(), "not every node acknowledged the rebuilt vnn map");
    }
    report.vnn_map = vnn_map;

    info!(
        generation,
        recovered = report.databases_recovered,
        shortcut = report.databases_shortcut,
        parallel = parallel.is_some(),
        "recovery run complete"
    );

    Ok(report)
}
