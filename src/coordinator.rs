//! Coordinator object
//!
//! Owns the whole control-plane state: worker registry, table catalog,
//! op queues and the allocation counters. One coarse mutex guards all of
//! it; flags that background loops poll without the lock are atomics.
//! Construction order is store adapter, registry, catalog, engine,
//! failover, lifecycle; all of them are impl areas over this object.

use crate::catalog::TableInfo;
use crate::cluster::{ClusterAddress, RemoteConnector};
use crate::common::{CoordinatorConfig, Error, Result};
use crate::engine::op::OpData;
use crate::registry::{Worker, WorkerState};
use crate::store::MetaStore;
use crate::worker::{WorkerConnector, WorkerRpc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};

/// Identity of this coordinator cluster within a federation.
#[derive(Debug, Clone)]
pub struct ZoneInfo {
    pub name: String,
    pub term: u64,
}

/// Everything the coarse mutex protects.
pub(crate) struct State {
    pub workers: BTreeMap<String, Worker>,
    pub tables: BTreeMap<String, Arc<TableInfo>>,
    /// Parallel FIFO op queues; an op is pinned to one queue for life.
    pub queues: Vec<VecDeque<Arc<OpData>>>,
    /// Recently finished ops, bounded by `max_op_num`.
    pub done_ops: VecDeque<Arc<OpData>>,
    /// Endpoint to the time (ms) it was last seen going offline.
    pub offline_endpoint_map: BTreeMap<String, u64>,
    pub table_index: u64,
    pub term: u64,
    pub op_index: u64,
    pub zone: ZoneInfo,
    pub replica_clusters: BTreeMap<String, ClusterAddress>,
}

impl State {
    fn new(queue_count: usize, zone_name: String) -> Self {
        Self {
            workers: BTreeMap::new(),
            tables: BTreeMap::new(),
            queues: (0..queue_count).map(|_| VecDeque::new()).collect(),
            done_ops: VecDeque::new(),
            offline_endpoint_map: BTreeMap::new(),
            table_index: 0,
            term: 0,
            op_index: 0,
            zone: ZoneInfo {
                name: zone_name,
                term: 0,
            },
            replica_clusters: BTreeMap::new(),
        }
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableMissing(name.to_string()))
    }

    /// The alive leader endpoint of a partition.
    pub fn leader_endpoint(&self, table: &TableInfo, pid: u32) -> Result<String> {
        table
            .leader_of(pid)
            .map(|meta| meta.endpoint.clone())
            .ok_or_else(|| Error::LeaderMissing {
                name: table.name.clone(),
                pid,
            })
    }

    /// RPC stub of a healthy worker.
    pub fn healthy_worker(&self, endpoint: &str) -> Result<Arc<dyn WorkerRpc>> {
        let worker = self
            .workers
            .get(endpoint)
            .ok_or_else(|| Error::WorkerMissing(endpoint.to_string()))?;
        if worker.state != WorkerState::Healthy {
            return Err(Error::WorkerOffline(endpoint.to_string()));
        }
        Ok(worker.rpc.clone())
    }

    pub fn is_worker_healthy(&self, endpoint: &str) -> bool {
        self.workers
            .get(endpoint)
            .map(|w| w.state == WorkerState::Healthy)
            .unwrap_or(false)
    }
}

pub struct Coordinator {
    pub(crate) cfg: CoordinatorConfig,
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) connector: Arc<dyn WorkerConnector>,
    pub(crate) remote_connector: Mutex<Option<Arc<dyn RemoteConnector>>>,
    pub(crate) state: Mutex<State>,
    /// True only while this node holds the leader lock and has recovered.
    running: AtomicBool,
    auto_failover: AtomicBool,
    follower: AtomicBool,
    /// Bumped on every task RPC; lets the progress poller detect that its
    /// snapshot of the queues went stale mid-pass.
    pub(crate) task_rpc_version: AtomicU64,
    /// Wakes the driver on any catalog or queue mutation.
    pub(crate) notify: Notify,
    /// Bounds concurrently executing task bodies.
    pub(crate) pool: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        cfg: CoordinatorConfig,
        store: Arc<dyn MetaStore>,
        connector: Arc<dyn WorkerConnector>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let state = State::new(cfg.max_concurrency as usize, cfg.zone_name.clone());
        let pool = Arc::new(Semaphore::new(cfg.task_pool_size));
        Ok(Arc::new(Self {
            cfg,
            store,
            connector,
            remote_connector: Mutex::new(None),
            state: Mutex::new(state),
            running: AtomicBool::new(false),
            auto_failover: AtomicBool::new(false),
            follower: AtomicBool::new(false),
            task_rpc_version: AtomicU64::new(0),
            notify: Notify::new(),
            pool,
        }))
    }

    /// Install the factory used to reach remote coordinator clusters.
    pub fn set_remote_connector(&self, connector: Arc<dyn RemoteConnector>) {
        *self.remote_connector.lock().unwrap() = Some(connector);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Release);
    }

    pub fn auto_failover(&self) -> bool {
        self.auto_failover.load(Ordering::Acquire)
    }

    pub(crate) fn set_auto_failover(&self, value: bool) {
        self.auto_failover.store(value, Ordering::Release);
    }

    pub fn is_follower(&self) -> bool {
        self.follower.load(Ordering::Acquire)
    }

    pub(crate) fn set_follower(&self, value: bool) {
        self.follower.store(value, Ordering::Release);
    }

    pub(crate) fn bump_task_rpc_version(&self) {
        self.task_rpc_version.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn current_task_rpc_version(&self) -> u64 {
        self.task_rpc_version.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }
}
