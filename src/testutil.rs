//! Test support: scripted workers, a mock cluster and a harness that
//! runs the full coordinator against the in-memory store.

use crate::catalog::{ColumnDesc, TtlSpec};
use crate::common::{CoordinatorConfig, Error, Result};
use crate::coordinator::Coordinator;
use crate::engine::task::{TaskStatus, TaskType};
use crate::lifecycle::{LeaderLock, StaticLock};
use crate::store::{paths, MemStore, MetaStore};
use crate::worker::{
    Manifest, ReplicaMode, TableMeta, TableStatusReport, TaskRef, TaskStatusReport, TermPair,
    WorkerConnector, WorkerRpc,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Install the log subscriber once for the whole test binary. Output is
/// captured per test; `RUST_LOG` controls verbosity.
pub(crate) fn init_test_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn test_config() -> CoordinatorConfig {
    init_test_logging();
    CoordinatorConfig {
        zone_name: "zone-a".to_string(),
        max_concurrency: 4,
        task_pool_size: 4,
        task_wait_time_ms: 20,
        op_execute_timeout_ms: 60_000,
        get_task_status_interval_ms: 20,
        get_table_status_interval_ms: 20,
        offline_check_interval_ms: 20,
        heartbeat_timeout_ms: 100,
        max_op_num: 100,
        offset_delta: 1000,
        task_concurrency: 2,
        partition_num: 4,
        replica_num: 2,
    }
}

#[derive(Debug, Clone)]
struct MockReplica {
    is_leader: bool,
    term: u64,
    offset: u64,
}

#[derive(Default)]
struct MockInner {
    replicas: HashMap<(u32, u32), MockReplica>,
    tasks: Vec<TaskStatusReport>,
    task_log: Vec<TaskRef>,
    fail_types: HashSet<TaskType>,
    hold_types: HashSet<TaskType>,
    manifest_offsets: HashMap<(u32, u32), u64>,
    ttls: HashMap<(u32, u32), TtlSpec>,
    added_fields: Vec<(u32, u32, String)>,
}

/// A worker whose behavior is scripted per test: every accepted op task
/// is acknowledged and immediately reported done.
pub(crate) struct MockWorker {
    pub endpoint: String,
    inner: Mutex<MockInner>,
}

impl MockWorker {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            inner: Mutex::new(MockInner::default()),
        }
    }

    pub fn set_offset(&self, tid: u32, pid: u32, offset: u64) {
        if let Some(replica) = self.inner.lock().unwrap().replicas.get_mut(&(tid, pid)) {
            replica.offset = offset;
        }
    }

    pub fn set_manifest(&self, tid: u32, pid: u32, offset: u64) {
        self.inner
            .lock()
            .unwrap()
            .manifest_offsets
            .insert((tid, pid), offset);
    }

    pub fn fail_task_type(&self, task_type: TaskType) {
        self.inner.lock().unwrap().fail_types.insert(task_type);
    }

    /// Accept tasks of this type but never report them finished.
    pub fn hold_task_type(&self, task_type: TaskType) {
        self.inner.lock().unwrap().hold_types.insert(task_type);
    }

    /// Finish every held task of this type and stop holding new ones.
    pub fn complete_held(&self, task_type: TaskType) {
        let mut inner = self.inner.lock().unwrap();
        inner.hold_types.remove(&task_type);
        for report in inner.tasks.iter_mut() {
            if report.task_type == task_type && report.status == TaskStatus::Doing {
                report.status = TaskStatus::Done;
            }
        }
    }

    pub fn has_replica(&self, tid: u32, pid: u32) -> bool {
        self.inner.lock().unwrap().replicas.contains_key(&(tid, pid))
    }

    pub fn replica_is_leader(&self, tid: u32, pid: u32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .replicas
            .get(&(tid, pid))
            .map(|r| r.is_leader)
            .unwrap_or(false)
    }

    pub fn task_log(&self) -> Vec<TaskRef> {
        self.inner.lock().unwrap().task_log.clone()
    }

    pub fn ttl_of(&self, tid: u32, pid: u32) -> Option<TtlSpec> {
        self.inner.lock().unwrap().ttls.get(&(tid, pid)).copied()
    }

    pub fn added_fields(&self) -> Vec<(u32, u32, String)> {
        self.inner.lock().unwrap().added_fields.clone()
    }

    fn gate(&self, task_type: TaskType) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_types.contains(&task_type) {
            return Err(Error::worker(&self.endpoint, "scripted failure"));
        }
        Ok(())
    }

    /// Accept an op task: log it and report it done on the next poll,
    /// unless the type is held open.
    fn accept(&self, task: TaskRef) {
        let mut inner = self.inner.lock().unwrap();
        inner.task_log.push(task);
        let status = if inner.hold_types.contains(&task.task_type) {
            TaskStatus::Doing
        } else {
            TaskStatus::Done
        };
        inner.tasks.push(TaskStatusReport {
            op_id: task.op_id,
            task_type: task.task_type,
            status,
        });
    }
}

#[async_trait]
impl WorkerRpc for MockWorker {
    async fn create_table(&self, meta: &TableMeta) -> Result<()> {
        self.gate(TaskType::LoadTable)?;
        self.inner.lock().unwrap().replicas.insert(
            (meta.tid, meta.pid),
            MockReplica {
                is_leader: meta.mode == ReplicaMode::Leader,
                term: meta.term,
                offset: 0,
            },
        );
        Ok(())
    }

    async fn drop_table(&self, tid: u32, pid: u32, task: TaskRef) -> Result<()> {
        self.gate(TaskType::DropTable)?;
        self.inner.lock().unwrap().replicas.remove(&(tid, pid));
        self.accept(task);
        Ok(())
    }

    async fn make_snapshot(&self, _tid: u32, _pid: u32, task: TaskRef) -> Result<()> {
        self.gate(TaskType::MakeSnapshot)?;
        self.accept(task);
        Ok(())
    }

    async fn pause_snapshot(&self, _tid: u32, _pid: u32, task: TaskRef) -> Result<()> {
        self.gate(TaskType::PauseSnapshot)?;
        self.accept(task);
        Ok(())
    }

    async fn recover_snapshot(&self, _tid: u32, _pid: u32, task: TaskRef) -> Result<()> {
        self.gate(TaskType::RecoverSnapshot)?;
        self.accept(task);
        Ok(())
    }

    async fn send_snapshot(&self, _tid: u32, _pid: u32, _dest: &str, task: TaskRef) -> Result<()> {
        self.gate(TaskType::SendSnapshot)?;
        self.accept(task);
        Ok(())
    }

    async fn load_table(&self, meta: &TableMeta, task: TaskRef) -> Result<()> {
        self.gate(TaskType::LoadTable)?;
        self.inner.lock().unwrap().replicas.insert(
            (meta.tid, meta.pid),
            MockReplica {
                is_leader: meta.mode == ReplicaMode::Leader,
                term: meta.term,
                offset: 0,
            },
        );
        self.accept(task);
        Ok(())
    }

    async fn add_replica(&self, _tid: u32, _pid: u32, _dest: &str, task: TaskRef) -> Result<()> {
        self.gate(TaskType::AddReplica)?;
        self.accept(task);
        Ok(())
    }

    async fn del_replica(&self, _tid: u32, _pid: u32, _dest: &str, task: TaskRef) -> Result<()> {
        self.gate(TaskType::DelReplica)?;
        self.accept(task);
        Ok(())
    }

    async fn follow_of_no_one(&self, tid: u32, pid: u32, term: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        match inner.replicas.get_mut(&(tid, pid)) {
            Some(replica) => {
                replica.is_leader = false;
                replica.term = term;
                Ok(replica.offset)
            }
            None => Err(Error::worker(&self.endpoint, "no such replica")),
        }
    }

    async fn change_role(
        &self,
        tid: u32,
        pid: u32,
        leader: bool,
        _followers: &[String],
        term: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.replicas.get_mut(&(tid, pid)) {
            Some(replica) => {
                replica.is_leader = leader;
                if leader {
                    replica.term = term;
                }
                Ok(())
            }
            None => Err(Error::worker(&self.endpoint, "no such replica")),
        }
    }

    async fn get_term_pair(&self, tid: u32, pid: u32) -> Result<TermPair> {
        let inner = self.inner.lock().unwrap();
        Ok(match inner.replicas.get(&(tid, pid)) {
            Some(replica) => TermPair {
                has_table: true,
                is_leader: replica.is_leader,
                term: replica.term,
                offset: replica.offset,
            },
            None => TermPair {
                has_table: false,
                is_leader: false,
                term: 0,
                offset: 0,
            },
        })
    }

    async fn delete_binlog(&self, _tid: u32, _pid: u32) -> Result<()> {
        Ok(())
    }

    async fn get_manifest(&self, tid: u32, pid: u32) -> Result<Manifest> {
        let inner = self.inner.lock().unwrap();
        Ok(Manifest {
            offset: inner
                .manifest_offsets
                .get(&(tid, pid))
                .copied()
                .unwrap_or(0),
        })
    }

    async fn get_task_status(&self) -> Result<Vec<TaskStatusReport>> {
        Ok(self.inner.lock().unwrap().tasks.clone())
    }

    async fn delete_op_tasks(&self, op_ids: &[u64]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .retain(|report| !op_ids.contains(&report.op_id));
        Ok(())
    }

    async fn update_ttl(
        &self,
        tid: u32,
        pid: u32,
        ttl: TtlSpec,
        _ts_name: Option<&str>,
    ) -> Result<()> {
        self.gate(TaskType::UpdateTableInfo)?;
        self.inner.lock().unwrap().ttls.insert((tid, pid), ttl);
        Ok(())
    }

    async fn add_table_field(&self, tid: u32, pid: u32, column: &ColumnDesc) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .added_fields
            .push((tid, pid, column.name.clone()));
        Ok(())
    }

    async fn get_table_status(&self) -> Result<Vec<TableStatusReport>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .replicas
            .iter()
            .map(|((tid, pid), replica)| TableStatusReport {
                tid: *tid,
                pid: *pid,
                is_leader: replica.is_leader,
                offset: replica.offset,
                record_cnt: 0,
                record_byte_size: 0,
            })
            .collect())
    }
}

/// The set of mock workers a test cluster hands out as RPC stubs.
pub(crate) struct MockCluster {
    workers: Mutex<BTreeMap<String, Arc<MockWorker>>>,
    refuse: Mutex<HashSet<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            refuse: Mutex::new(HashSet::new()),
        }
    }

    /// Make stub creation fail for an endpoint.
    pub fn fail_connect(&self, endpoint: &str) {
        self.refuse.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn worker(&self, endpoint: &str) -> Arc<MockWorker> {
        self.workers
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(MockWorker::new(endpoint)))
            .clone()
    }
}

impl WorkerConnector for MockCluster {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn WorkerRpc>> {
        if self.refuse.lock().unwrap().contains(endpoint) {
            return Err(Error::WorkerInit(endpoint.to_string()));
        }
        Ok(self.worker(endpoint))
    }
}

/// Poll `predicate` until it holds or the timeout elapses.
pub(crate) async fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Full coordinator running against the in-memory store and a mock
/// worker fleet.
pub(crate) struct TestCluster {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<MemStore>,
    pub cluster: Arc<MockCluster>,
    pub lock: Arc<StaticLock>,
}

impl TestCluster {
    pub async fn start(endpoints: &[&str]) -> TestCluster {
        Self::start_with(test_config(), endpoints).await
    }

    pub async fn start_with(cfg: CoordinatorConfig, endpoints: &[&str]) -> TestCluster {
        let store = Arc::new(MemStore::new());
        for endpoint in endpoints {
            store
                .create(&paths::node_entry(endpoint), b"alive")
                .unwrap();
        }
        let cluster = Arc::new(MockCluster::new());
        let coordinator = Coordinator::new(cfg, store.clone(), cluster.clone()).unwrap();
        let lock = Arc::new(StaticLock::new());
        coordinator
            .clone()
            .start(lock.clone() as Arc<dyn LeaderLock>)
            .await
            .unwrap();
        lock.acquire();
        assert!(
            wait_until(Duration::from_secs(5), || coordinator.is_running()).await,
            "coordinator did not become active"
        );
        TestCluster {
            coordinator,
            store,
            cluster,
            lock,
        }
    }

    /// Attach a fresh coordinator to the same store and worker fleet, as
    /// a standby taking over after this one lost the lock.
    pub async fn start_standby(&self) -> (Arc<Coordinator>, Arc<StaticLock>) {
        let coordinator = Coordinator::new(
            self.coordinator.config().clone(),
            self.store.clone() as Arc<dyn MetaStore>,
            self.cluster.clone(),
        )
        .unwrap();
        let lock = Arc::new(StaticLock::new());
        coordinator
            .clone()
            .start(lock.clone() as Arc<dyn LeaderLock>)
            .await
            .unwrap();
        lock.acquire();
        assert!(
            wait_until(Duration::from_secs(5), || coordinator.is_running()).await,
            "standby did not become active"
        );
        (coordinator, lock)
    }

    pub fn register_worker(&self, endpoint: &str) {
        self.store
            .create(&paths::node_entry(endpoint), b"alive")
            .unwrap();
    }

    pub fn register_worker_startup(&self, endpoint: &str) {
        self.store
            .create(&paths::node_entry(endpoint), b"startup_alive")
            .unwrap();
    }

    pub fn unregister_worker(&self, endpoint: &str) {
        self.store.delete(&paths::node_entry(endpoint)).unwrap();
    }

    /// Wait until no op is left in any queue, then return the status of
    /// every op seen so far.
    pub async fn wait_ops_settled(&self) -> Vec<(u64, TaskStatus)> {
        let coordinator = self.coordinator.clone();
        assert!(
            wait_until(Duration::from_secs(10), || {
                let st = coordinator.lock_state();
                st.queues.iter().all(|queue| queue.is_empty())
            })
            .await,
            "ops did not settle"
        );
        let st = self.coordinator.lock_state();
        st.done_ops
            .iter()
            .map(|op| (op.op_id, op.status()))
            .collect()
    }

    /// Wait until the given op is finished and return its final status.
    pub async fn wait_op_done(&self, op_id: u64) -> TaskStatus {
        let coordinator = self.coordinator.clone();
        assert!(
            wait_until(Duration::from_secs(10), || {
                let st = coordinator.lock_state();
                st.done_ops.iter().any(|op| op.op_id == op_id)
            })
            .await,
            "op {} did not finish",
            op_id
        );
        let st = self.coordinator.lock_state();
        st.done_ops
            .iter()
            .find(|op| op.op_id == op_id)
            .map(|op| op.status())
            .unwrap()
    }
}
