// tests/integration/cluster_recovery_test.rs

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use recoverd::core::ban::BanBookkeeper;
use recoverd::core::dispatcher::handle_message;
use recoverd::core::gate::OperationGate;
use recoverd::core::kv::KvStore;
use recoverd::core::model::{Capabilities, DbDescriptor, DbFlags, RecoveryMode, UNKNOWN_PNN};
use recoverd::core::monitor::{tick, MonitorContext, MonitorTunables};
use recoverd::core::reclock::NullRecoveryLock;
use recoverd::core::rpc::ControlMessage;

use crate::integration::fixtures::FakeCluster;

fn tunables() -> MonitorTunables {
    MonitorTunables {
        recover_interval: Duration::from_millis(10),
        election_timeout: Duration::from_millis(300),
        recover_timeout: Duration::from_millis(300),
        recover_by_seqnum: true,
    }
}

fn databases() -> Vec<DbDescriptor> {
    vec![
        DbDescriptor { db_id: 1, name: "volatile".into(), flags: DbFlags::empty() },
        DbDescriptor { db_id: 2, name: "persistent".into(), flags: DbFlags::PERSISTENT },
    ]
}

#[tokio::test]
async fn cold_start_elects_lowest_pnn_node_and_it_recovers() {
    let cluster = FakeCluster::new(&[0, 1, 2]).await;

    let mut registry = cluster.registry_for(0);
    let kv_dir = tempfile::tempdir().unwrap();
    let kv = KvStore::open(kv_dir.path().join("db")).unwrap();
    let ban = Arc::new(Mutex::new(BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30))));
    let recovery_gate = OperationGate::new("recovery");
    let takeover_gate = OperationGate::new("takeover");
    let dbs = databases();
    let tun = tunables();
    let mut recmaster = UNKNOWN_PNN;
    let mut generation = 0;
    let lock = NullRecoveryLock;
    let mut lock_held = false;
    let mut priority_time = 1u64;
    let mut recovery_mode = RecoveryMode::Normal;
    let mut frozen_on_inactive = false;
    let dispatcher = cluster.state_for(0);

    let mut ctx = MonitorContext {
        transport: &cluster.transport,
        registry: &mut registry,
        ban: &ban,
        kv: &kv,
        recovery_gate: &recovery_gate,
        takeover_gate: &takeover_gate,
        local_capabilities: Capabilities::RECMASTER | Capabilities::LMASTER | Capabilities::PARALLEL_RECOVERY,
        recmaster: &mut recmaster,
        generation: &mut generation,
        databases: &dbs,
        tunables: &tun,
        helper: None,
        takeover_runner: None,
        recovery_lock: &lock,
        lock_held: &mut lock_held,
        priority_time: &mut priority_time,
        recovery_mode: &mut recovery_mode,
        frozen_on_inactive: &mut frozen_on_inactive,
        dispatcher: dispatcher.as_ref(),
    };

    let outcome = tick(&mut ctx, &cluster.map).await.unwrap();

    assert!(outcome.election_ran);
    // All three nodes advertise equal priority_time and capabilities, so the
    // lowest pnn wins the tie break, and that's node 0 — the node running
    // this tick — so it becomes master and immediately recovers.
    assert_eq!(recmaster, 0);
    assert!(outcome.became_master);
    assert!(outcome.recovery_ran);
    assert!(lock_held);
}

#[tokio::test]
async fn elected_master_runs_recovery_and_takeover() {
    let cluster = FakeCluster::new(&[0, 1]).await;

    let mut registry = cluster.registry_for(0);
    let kv_dir = tempfile::tempdir().unwrap();
    let kv = KvStore::open(kv_dir.path().join("db")).unwrap();
    let ban = Arc::new(Mutex::new(BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30))));
    let recovery_gate = OperationGate::new("recovery");
    let takeover_gate = OperationGate::new("takeover");
    let dbs = databases();
    let tun = tunables();
    let mut recmaster = UNKNOWN_PNN;
    let mut generation = 0;
    let lock = NullRecoveryLock;
    let mut lock_held = false;
    let mut priority_time = 1u64;
    let mut recovery_mode = RecoveryMode::Normal;
    let mut frozen_on_inactive = false;
    let dispatcher = cluster.state_for(0);

    let mut ctx = MonitorContext {
        transport: &cluster.transport,
        registry: &mut registry,
        ban: &ban,
        kv: &kv,
        recovery_gate: &recovery_gate,
        takeover_gate: &takeover_gate,
        local_capabilities: Capabilities::RECMASTER | Capabilities::LMASTER | Capabilities::PARALLEL_RECOVERY,
        recmaster: &mut recmaster,
        generation: &mut generation,
        databases: &dbs,
        tunables: &tun,
        helper: None,
        takeover_runner: None,
        recovery_lock: &lock,
        lock_held: &mut lock_held,
        priority_time: &mut priority_time,
        recovery_mode: &mut recovery_mode,
        frozen_on_inactive: &mut frozen_on_inactive,
        dispatcher: dispatcher.as_ref(),
    };

    let outcome = tick(&mut ctx, &cluster.map).await.unwrap();

    assert_eq!(recmaster, 0);
    assert!(outcome.became_master);
    assert!(outcome.recovery_ran);
    assert!(outcome.takeover_ran);
    assert_eq!(kv.last_generation().unwrap(), Some(generation));
}

#[tokio::test]
async fn culprit_reports_relayed_over_rpc_self_ban_the_target() {
    let cluster = FakeCluster::new(&[0, 1]).await;

    // Node 1 reports node 0 as a culprit enough times to cross the ban
    // threshold (2 * node_count = 4) before node 0's own tick runs.
    let target_state = cluster.state_for(0);
    handle_message(target_state, ControlMessage::ReportCulprit { pnn: 0, credits: 5 });

    let mut registry = cluster.registry_for(0);
    let kv_dir = tempfile::tempdir().unwrap();
    let kv = KvStore::open(kv_dir.path().join("db")).unwrap();
    let ban = target_state.ban.clone();
    let recovery_gate = OperationGate::new("recovery");
    let takeover_gate = OperationGate::new("takeover");
    let dbs = databases();
    let tun = tunables();
    let mut recmaster = UNKNOWN_PNN;
    let mut generation = 0;
    let lock = NullRecoveryLock;
    let mut lock_held = false;
    let mut priority_time = 1u64;
    let mut recovery_mode = RecoveryMode::Normal;
    let mut frozen_on_inactive = false;
    let dispatcher = cluster.state_for(0);

    let mut ctx = MonitorContext {
        transport: &cluster.transport,
        registry: &mut registry,
        ban: &ban,
        kv: &kv,
        recovery_gate: &recovery_gate,
        takeover_gate: &takeover_gate,
        local_capabilities: Capabilities::RECMASTER | Capabilities::LMASTER | Capabilities::PARALLEL_RECOVERY,
        recmaster: &mut recmaster,
        generation: &mut generation,
        databases: &dbs,
        tunables: &tun,
        helper: None,
        takeover_runner: None,
        recovery_lock: &lock,
        lock_held: &mut lock_held,
        priority_time: &mut priority_time,
        recovery_mode: &mut recovery_mode,
        frozen_on_inactive: &mut frozen_on_inactive,
        dispatcher: dispatcher.as_ref(),
    };

    let outcome = tick(&mut ctx, &cluster.map).await.unwrap();

    assert!(outcome.self_banned);
    assert!(!outcome.election_ran);
    assert_eq!(recmaster, UNKNOWN_PNN);
}
