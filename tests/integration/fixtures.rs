// tests/integration/fixtures.rs

//! Builds small in-memory clusters over `FakeTransport` so integration tests
//! can exercise election, recovery, and takeover without real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use recoverd::core::ban::BanBookkeeper;
use recoverd::core::dispatcher::{self, DispatcherState};
use recoverd::core::gate::OperationGate;
use recoverd::core::kv::KvStore;
use recoverd::core::model::{Capabilities, NodeEntry, NodeFlags, NodeMap, Pnn};
use recoverd::core::registry::NodeRegistry;
use recoverd::core::rpc::FakeTransport;

pub fn node_addr(pnn: Pnn) -> SocketAddr {
    format!("127.0.0.1:{}", 10_000 + pnn).parse().unwrap()
}

pub fn node_map(pnns: &[Pnn]) -> NodeMap {
    NodeMap {
        nodes: pnns
            .iter()
            .map(|&pnn| NodeEntry { pnn, flags: NodeFlags::empty(), address: node_addr(pnn) })
            .collect(),
    }
}

/// A simulated cluster: one `DispatcherState` per node, all reachable
/// through a single shared `FakeTransport`.
pub struct FakeCluster {
    pub transport: FakeTransport,
    pub states: Vec<Arc<DispatcherState>>,
    pub map: NodeMap,
    /// Keeps each node's working store directory alive for the cluster's
    /// lifetime; dropping it would delete the database out from under an
    /// open `KvStore`.
    _state_dirs: Vec<tempfile::TempDir>,
}

impl FakeCluster {
    pub async fn new(pnns: &[Pnn]) -> Self {
        let transport = FakeTransport::new();
        let map = node_map(pnns);
        let mut states = Vec::new();
        let mut state_dirs = Vec::new();

        for &pnn in pnns {
            let mut registry = NodeRegistry::new(pnn);
            registry.refresh_from_node_map(&map);
            let dir = tempfile::tempdir().unwrap();
            let kv = Arc::new(KvStore::open(dir.path().join("db")).unwrap());
            state_dirs.push(dir);
            let state = Arc::new(DispatcherState {
                registry: Mutex::new(registry),
                ban: Arc::new(Mutex::new(BanBookkeeper::new(Duration::from_secs(60), Duration::from_secs(30)))),
                recovery_gate: OperationGate::new("recovery"),
                takeover_gate: OperationGate::new("takeover"),
                local_capabilities: Capabilities::RECMASTER | Capabilities::LMASTER | Capabilities::PARALLEL_RECOVERY,
                recmaster: Mutex::new(recoverd::core::model::UNKNOWN_PNN),
                priority_time: Mutex::new(0),
                kv,
                need_recovery: Mutex::new(false),
                need_takeover_run: Mutex::new(false),
                force_rebalance_nodes: Mutex::new(Vec::new()),
                reallocate_queue: Mutex::new(Vec::new()),
            });
            states.push(state);
        }

        for (pnn, state) in pnns.iter().zip(states.iter().cloned()) {
            transport
                .register(*pnn, move |msg| {
                    let state = state.clone();
                    async move { dispatcher::handle_message(&state, msg) }
                })
                .await;
        }

        Self { transport, states, map, _state_dirs: state_dirs }
    }

    /// Builds a standalone registry for `pnn`, mirroring the cluster's
    /// shared node map, for use as a monitor-loop-local registry in tests.
    pub fn registry_for(&self, pnn: Pnn) -> NodeRegistry {
        let mut registry = NodeRegistry::new(pnn);
        registry.refresh_from_node_map(&self.map);
        registry
    }

    pub fn state_for(&self, pnn: Pnn) -> &Arc<DispatcherState> {
        self.states.iter().find(|s| s.registry.lock().local_pnn() == pnn).expect("unknown pnn")
    }
}
