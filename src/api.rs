//! Coordinator request surface
//!
//! Typed request handlers backing the RPC interface; transport wiring
//! lives outside this crate. Every handler reports an integer code plus
//! a message through `ApiError`, 0 being success.

use crate::catalog::{
    ColumnDesc, ColumnKey, CompressMode, Partition, PartitionMeta, StorageMode, TableInfo,
    TermOffset, TtlSpec, MAX_ADDED_COLUMNS,
};
use crate::common::Error;
use crate::coordinator::{Coordinator, State};
use crate::engine::OpView;
use crate::engine::task::TaskType;
use crate::registry::WorkerState;
use crate::store::{paths, MetaStoreExt};
use crate::worker::{ReplicaMode, TableMeta, TaskRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Response codes of the request surface.
pub mod code {
    pub const OK: i32 = 0;
    pub const TABLE_MISSING: i32 = 100;
    pub const TABLE_EXISTS: i32 = 101;
    pub const CANNOT_DROP_LEADER: i32 = 102;
    pub const NO_FOLLOWER: i32 = 134;
    pub const NOT_LEADER: i32 = 300;
    pub const AUTO_FAILOVER_ENABLED: i32 = 301;
    pub const ENDPOINT_MISSING: i32 = 302;
    pub const ENDPOINT_UNHEALTHY: i32 = 303;
    pub const STORE_WRITE_FAILED: i32 = 304;
    pub const OP_BUILD_FAILED: i32 = 305;
    pub const OP_ADD_FAILED: i32 = 306;
    pub const INVALID_PARAMETER: i32 = 307;
    pub const PID_MISSING: i32 = 308;
    pub const LEADER_ALIVE: i32 = 309;
    pub const NO_ALIVE_FOLLOWER: i32 = 310;
    pub const ALREADY_ALIVE: i32 = 311;
    pub const WRONG_OP_STATE: i32 = 312;
    pub const DROP_FAILED: i32 = 313;
    pub const PARTITION_INFO_FAILED: i32 = 314;
    pub const COLUMN_DESC_FAILED: i32 = 315;
    pub const CREATE_ON_WORKER_FAILED: i32 = 316;
    pub const REPLICA_EXISTS: i32 = 317;
    pub const SRC_UNAVAILABLE: i32 = 318;
    pub const DEST_UNAVAILABLE: i32 = 319;
    pub const MIGRATE_PRECONDITION: i32 = 320;
    pub const NO_OP_UPDATE: i32 = 321;
    pub const TTL_PROPAGATION_FAILED: i32 = 322;
    pub const DUPLICATE_COLUMN: i32 = 323;
    pub const ADDED_COLUMN_OVERFLOW: i32 = 324;
    pub const WORKER_META_UPDATE_FAILED: i32 = 325;
}

/// A non-zero response code plus its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.msg)
    }
}

impl std::error::Error for ApiError {}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

fn store_error(e: Error) -> ApiError {
    ApiError::new(code::STORE_WRITE_FAILED, e.to_string())
}

fn op_error(e: Error) -> ApiError {
    let code = match &e {
        Error::OpBuild(_) => code::OP_BUILD_FAILED,
        Error::OpAdd(_) => code::OP_ADD_FAILED,
        Error::Store(_) | Error::NodeExists(_) | Error::NodeMissing(_) | Error::Codec(_) => {
            code::STORE_WRITE_FAILED
        }
        Error::TableMissing(_) => code::TABLE_MISSING,
        Error::LeaderMissing { .. } => code::NO_ALIVE_FOLLOWER,
        _ => code::INVALID_PARAMETER,
    };
    ApiError::new(code, e.to_string())
}

/// Table creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub name: String,
    #[serde(default)]
    pub partition_num: Option<u32>,
    #[serde(default)]
    pub replica_num: Option<u32>,
    #[serde(default)]
    pub columns: Vec<ColumnDesc>,
    #[serde(default)]
    pub column_keys: Vec<ColumnKey>,
    #[serde(default)]
    pub ttl: Option<TtlSpec>,
    #[serde(default)]
    pub seg_cnt: Option<u32>,
    #[serde(default)]
    pub compress: Option<CompressMode>,
    #[serde(default)]
    pub storage: Option<StorageMode>,
    #[serde(default)]
    pub key_entry_max_height: Option<u32>,
    /// Explicit placement; computed from the live workers when empty.
    #[serde(default)]
    pub table_partition: Vec<Partition>,
}

/// One worker row of the worker listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub endpoint: String,
    pub state: WorkerState,
    /// Time since the last state change (ms).
    pub age_ms: u64,
}

impl Coordinator {
    fn ensure_running(&self) -> ApiResult<()> {
        if !self.is_running() {
            return Err(ApiError::new(code::NOT_LEADER, "coordinator is not leader"));
        }
        Ok(())
    }

    /// Mutating surface: requires leadership and a leader zone.
    fn ensure_leader(&self) -> ApiResult<()> {
        self.ensure_running()?;
        if self.is_follower() {
            return Err(ApiError::new(code::NOT_LEADER, "zone is a follower"));
        }
        Ok(())
    }

    fn ensure_manual(&self) -> ApiResult<()> {
        if self.auto_failover() {
            return Err(ApiError::new(
                code::AUTO_FAILOVER_ENABLED,
                "auto failover is enabled",
            ));
        }
        Ok(())
    }

    fn resolve_concurrency(&self, requested: Option<u32>) -> ApiResult<u32> {
        match requested {
            Some(value) if value > self.cfg.max_concurrency => Err(ApiError::new(
                code::INVALID_PARAMETER,
                format!("concurrency exceeds the maximum {}", self.cfg.max_concurrency),
            )),
            Some(value) if value > 0 => Ok(value),
            _ => Ok(self.cfg.task_concurrency),
        }
    }

    /// Create a table: validate the schema, place replicas on the live
    /// workers, create every replica remotely and persist the catalog
    /// entry.
    pub async fn create_table(&self, req: CreateTableRequest) -> ApiResult<u32> {
        self.ensure_leader()?;
        validate_schema(&req)?;
        let column_keys = fill_column_keys(&req)?;
        let (table, cur_term) = {
            let mut st = self.lock_state();
            if st.tables.contains_key(&req.name) {
                return Err(ApiError::new(
                    code::TABLE_EXISTS,
                    format!("table {} already exists", req.name),
                ));
            }
            let table_partition = if req.table_partition.is_empty() {
                self.plan_placement(&st, &req)?
            } else {
                validate_explicit_placement(&req.table_partition)?;
                req.table_partition.clone()
            };
            self.store
                .write_counter(paths::TABLE_INDEX, st.table_index + 1)
                .map_err(store_error)?;
            st.table_index += 1;
            let tid = st.table_index;
            let cur_term = st.term;
            let replica_num = table_partition
                .iter()
                .map(|p| p.partition_meta.len() as u32)
                .max()
                .unwrap_or(0);
            let mut table = TableInfo {
                name: req.name.clone(),
                tid: tid as u32,
                partition_num: table_partition.len() as u32,
                replica_num,
                seg_cnt: req.seg_cnt.unwrap_or(8),
                ttl: req.ttl.unwrap_or_default(),
                compress: req.compress.unwrap_or(CompressMode::None),
                storage: req.storage.unwrap_or(StorageMode::Memory),
                key_entry_max_height: req.key_entry_max_height,
                columns: req.columns.clone(),
                column_keys,
                added_columns: Vec::new(),
                table_partition,
            };
            for partition in table.table_partition.iter_mut() {
                partition.term_offset = vec![TermOffset {
                    term: cur_term,
                    offset: 0,
                }];
            }
            (table, cur_term)
        };
        if let Err(e) = self.create_table_on_workers(&table, cur_term).await {
            tracing::warn!("create table {} on workers failed: {}", table.name, e);
            self.spawn_drop_on_workers(table);
            return Err(ApiError::new(code::CREATE_ON_WORKER_FAILED, e.to_string()));
        }
        let tid = table.tid;
        {
            let mut st = self.lock_state();
            if let Err(e) = self.create_table_record(&mut st, table.clone()) {
                drop(st);
                self.spawn_drop_on_workers(table);
                return Err(store_error(e));
            }
        }
        tracing::info!("created table {} tid[{}]", req.name, tid);
        Ok(tid)
    }

    /// Round-robin placement starting at the least-loaded worker; each
    /// partition's leader goes to the endpoint holding the fewest leaders.
    fn plan_placement(&self, st: &State, req: &CreateTableRequest) -> ApiResult<Vec<Partition>> {
        let partition_num = req.partition_num.unwrap_or(self.cfg.partition_num);
        if partition_num == 0 {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                "partition_num must be positive",
            ));
        }
        let mut replica_load: BTreeMap<String, u64> = st
            .workers
            .values()
            .filter(|w| w.is_healthy())
            .map(|w| (w.endpoint.clone(), 0))
            .collect();
        let replica_num = match req.replica_num {
            Some(value) if value > 0 => value,
            _ => self.cfg.replica_num.min(replica_load.len() as u32),
        };
        if replica_num == 0 || replica_load.len() < replica_num as usize {
            return Err(ApiError::new(
                code::PARTITION_INFO_FAILED,
                format!(
                    "{} healthy workers cannot host {} replicas",
                    replica_load.len(),
                    replica_num
                ),
            ));
        }
        let mut leader_load = replica_load.clone();
        for table in st.tables.values() {
            for partition in &table.table_partition {
                for meta in &partition.partition_meta {
                    if !meta.is_alive {
                        continue;
                    }
                    if let Some(count) = replica_load.get_mut(&meta.endpoint) {
                        *count += 1;
                        if meta.is_leader {
                            if let Some(leaders) = leader_load.get_mut(&meta.endpoint) {
                                *leaders += 1;
                            }
                        }
                    }
                }
            }
        }
        let endpoints: Vec<String> = replica_load.keys().cloned().collect();
        let mut pos = endpoints
            .iter()
            .enumerate()
            .min_by_key(|(_, ep)| replica_load[ep.as_str()])
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let mut partitions = Vec::new();
        for pid in 0..partition_num {
            let mut metas = Vec::new();
            for _ in 0..replica_num {
                metas.push(PartitionMeta::new(&endpoints[pos % endpoints.len()], false));
                pos += 1;
            }
            let leader_idx = metas
                .iter()
                .enumerate()
                .min_by_key(|(_, meta)| leader_load[&meta.endpoint])
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            metas[leader_idx].is_leader = true;
            if let Some(leaders) = leader_load.get_mut(&metas[leader_idx].endpoint) {
                *leaders += 1;
            }
            partitions.push(Partition {
                pid,
                record_cnt: 0,
                record_byte_size: 0,
                partition_meta: metas,
                term_offset: Vec::new(),
            });
        }
        Ok(partitions)
    }

    /// Create every replica remotely: followers first, then each leader
    /// with its replication set and the current term.
    async fn create_table_on_workers(&self, table: &TableInfo, term: u64) -> crate::Result<()> {
        for leader_round in [false, true] {
            for partition in &table.table_partition {
                let followers: Vec<String> = partition
                    .partition_meta
                    .iter()
                    .filter(|m| !m.is_leader)
                    .map(|m| m.endpoint.clone())
                    .collect();
                for meta in &partition.partition_meta {
                    if meta.is_leader != leader_round {
                        continue;
                    }
                    let request = TableMeta {
                        name: table.name.clone(),
                        tid: table.tid,
                        pid: partition.pid,
                        mode: if meta.is_leader {
                            ReplicaMode::Leader
                        } else {
                            ReplicaMode::Follower
                        },
                        term: if meta.is_leader { term } else { 0 },
                        ttl: table.ttl,
                        seg_cnt: table.seg_cnt,
                        storage: table.storage,
                        compress: table.compress,
                        key_entry_max_height: table.key_entry_max_height,
                        columns: table.columns.clone(),
                        followers: if meta.is_leader {
                            followers.clone()
                        } else {
                            Vec::new()
                        },
                    };
                    let rpc = self.worker_rpc(&meta.endpoint)?;
                    rpc.create_table(&request).await?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort cleanup of a half-created table.
    fn spawn_drop_on_workers(&self, table: TableInfo) {
        let placements: Vec<(String, u32)> = table
            .table_partition
            .iter()
            .flat_map(|p| {
                p.partition_meta
                    .iter()
                    .map(move |m| (m.endpoint.clone(), p.pid))
            })
            .collect();
        let rpcs: Vec<_> = {
            let st = self.lock_state();
            placements
                .iter()
                .filter_map(|(endpoint, pid)| {
                    st.healthy_worker(endpoint).ok().map(|rpc| (rpc, *pid))
                })
                .collect()
        };
        let tid = table.tid;
        tokio::spawn(async move {
            for (rpc, pid) in rpcs {
                let task = TaskRef {
                    op_id: 0,
                    task_type: TaskType::DropTable,
                };
                if let Err(e) = rpc.drop_table(tid, pid, task).await {
                    tracing::warn!("cleanup drop of tid[{}] pid[{}] failed: {}", tid, pid, e);
                }
            }
        });
    }

    /// Drop a table everywhere and delete its catalog entry.
    pub async fn drop_table(&self, name: &str) -> ApiResult<()> {
        self.ensure_leader()?;
        let table = {
            let st = self.lock_state();
            st.tables
                .get(name)
                .cloned()
                .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?
        };
        for partition in &table.table_partition {
            for meta in &partition.partition_meta {
                let rpc = match self.worker_rpc(&meta.endpoint) {
                    Ok(rpc) => rpc,
                    Err(e) => {
                        tracing::warn!("skip drop on {}: {}", meta.endpoint, e);
                        continue;
                    }
                };
                let task = TaskRef {
                    op_id: 0,
                    task_type: TaskType::DropTable,
                };
                if let Err(e) = rpc.drop_table(table.tid, partition.pid, task).await {
                    tracing::warn!(
                        "drop of {} pid[{}] on {} failed: {}",
                        name,
                        partition.pid,
                        meta.endpoint,
                        e
                    );
                }
            }
        }
        let mut st = self.lock_state();
        self.drop_table_record(&mut st, name).map_err(store_error)?;
        tracing::info!("dropped table {}", name);
        Ok(())
    }

    /// List tables, optionally filtered by name.
    pub fn show_table(&self, name: Option<&str>) -> ApiResult<Vec<TableInfo>> {
        self.ensure_leader()?;
        let st = self.lock_state();
        Ok(st
            .tables
            .values()
            .filter(|table| name.map(|n| table.name == n).unwrap_or(true))
            .map(|table| (**table).clone())
            .collect())
    }

    /// List workers with state and age.
    pub fn show_workers(&self) -> ApiResult<Vec<WorkerView>> {
        self.ensure_running()?;
        let now = crate::common::timestamp_now_millis();
        let st = self.lock_state();
        Ok(st
            .workers
            .values()
            .map(|worker| WorkerView {
                endpoint: worker.endpoint.clone(),
                state: worker.state,
                age_ms: now.saturating_sub(worker.ctime_ms),
            })
            .collect())
    }

    /// List queued and recently finished ops.
    pub fn show_op_status(&self, name: Option<&str>, pid: Option<u32>) -> ApiResult<Vec<OpView>> {
        self.ensure_running()?;
        {
            let mut st = self.lock_state();
            self.trim_done_ops(&mut st);
        }
        Ok(self.snapshot_ops(name, pid))
    }

    pub fn make_snapshot(&self, name: &str, pid: u32) -> ApiResult<u64> {
        self.ensure_leader()?;
        let mut st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        if table.partition(pid).is_none() {
            return Err(ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)));
        }
        self.create_make_snapshot_op(&mut st, name, pid)
            .map_err(op_error)
    }

    /// Add a replica of the given partitions on `endpoint`.
    pub fn add_replica(&self, name: &str, pids: &[u32], endpoint: &str) -> ApiResult<Vec<u64>> {
        self.ensure_leader()?;
        let mut st = self.lock_state();
        self.check_worker(&st, endpoint)?;
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        for pid in pids {
            if table.partition(*pid).is_none() {
                return Err(ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)));
            }
            if table.meta_of(*pid, endpoint).is_some() {
                return Err(ApiError::new(
                    code::REPLICA_EXISTS,
                    format!("pid {} already has a replica at {}", pid, endpoint),
                ));
            }
        }
        let mut op_ids = Vec::new();
        for pid in pids {
            op_ids.push(
                self.create_add_replica_op(&mut st, name, *pid, endpoint)
                    .map_err(op_error)?,
            );
        }
        Ok(op_ids)
    }

    /// Remove a follower replica from the given partitions.
    pub fn del_replica(&self, name: &str, pids: &[u32], endpoint: &str) -> ApiResult<Vec<u64>> {
        self.ensure_leader()?;
        let mut st = self.lock_state();
        self.check_worker(&st, endpoint)?;
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        for pid in pids {
            let meta = table.meta_of(*pid, endpoint).ok_or_else(|| {
                ApiError::new(code::PID_MISSING, format!("pid {} has no replica at {}", pid, endpoint))
            })?;
            if meta.is_leader {
                return Err(ApiError::new(
                    code::CANNOT_DROP_LEADER,
                    format!("replica at {} leads pid {}", endpoint, pid),
                ));
            }
        }
        let mut op_ids = Vec::new();
        for pid in pids {
            op_ids.push(
                self.create_del_replica_op(&mut st, name, *pid, endpoint)
                    .map_err(op_error)?,
            );
        }
        Ok(op_ids)
    }

    /// Move replicas of the given partitions from `src` to `dest`.
    pub fn migrate(&self, name: &str, pids: &[u32], src: &str, dest: &str) -> ApiResult<Vec<u64>> {
        self.ensure_leader()?;
        let mut st = self.lock_state();
        if !st.is_worker_healthy(src) {
            return Err(ApiError::new(
                code::SRC_UNAVAILABLE,
                format!("src endpoint {} is missing or unhealthy", src),
            ));
        }
        if !st.is_worker_healthy(dest) {
            return Err(ApiError::new(
                code::DEST_UNAVAILABLE,
                format!("dest endpoint {} is missing or unhealthy", dest),
            ));
        }
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        for pid in pids {
            if table.partition(*pid).is_none() {
                return Err(ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)));
            }
            let meta = table.meta_of(*pid, src).ok_or_else(|| {
                ApiError::new(
                    code::MIGRATE_PRECONDITION,
                    format!("pid {} has no replica at {}", pid, src),
                )
            })?;
            if meta.is_leader {
                return Err(ApiError::new(
                    code::MIGRATE_PRECONDITION,
                    format!("replica at {} leads pid {}", src, pid),
                ));
            }
            if !meta.is_alive {
                return Err(ApiError::new(
                    code::MIGRATE_PRECONDITION,
                    format!("replica at {} for pid {} is not alive", src, pid),
                ));
            }
            if table.meta_of(*pid, dest).is_some() {
                return Err(ApiError::new(
                    code::MIGRATE_PRECONDITION,
                    format!("pid {} already has a replica at {}", pid, dest),
                ));
            }
        }
        let mut op_ids = Vec::new();
        for pid in pids {
            op_ids.push(
                self.create_migrate_op(&mut st, src, name, *pid, dest)
                    .map_err(op_error)?,
            );
        }
        Ok(op_ids)
    }

    /// Planned leader change; refused while auto-failover is on.
    pub fn change_leader(&self, name: &str, pid: u32, candidate: Option<&str>) -> ApiResult<u64> {
        self.ensure_leader()?;
        self.ensure_manual()?;
        let mut st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        if table.partition(pid).is_none() {
            return Err(ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)));
        }
        match self.create_change_leader_op(&mut st, name, pid, candidate, false, 0) {
            Ok(Some(op_id)) => Ok(op_id),
            Ok(None) => Err(ApiError::new(
                code::NO_FOLLOWER,
                format!("{} pid[{}] has no follower", name, pid),
            )),
            Err(Error::InvalidArg(msg)) => Err(ApiError::new(code::INVALID_PARAMETER, msg)),
            Err(e) => Err(op_error(e)),
        }
    }

    /// Manual failover of a whole endpoint; refused while auto-failover
    /// is on.
    pub fn offline_endpoint(&self, endpoint: &str, concurrency: Option<u32>) -> ApiResult<()> {
        self.ensure_leader()?;
        self.ensure_manual()?;
        let concurrency = self.resolve_concurrency(concurrency)?;
        let mut st = self.lock_state();
        if !st.workers.contains_key(endpoint) {
            return Err(ApiError::new(
                code::ENDPOINT_MISSING,
                format!("endpoint {} is not registered", endpoint),
            ));
        }
        self.offline_endpoint_internal(&mut st, endpoint, concurrency);
        Ok(())
    }

    /// Manual recovery of a whole endpoint; refused while auto-failover
    /// is on.
    pub fn recover_endpoint(
        &self,
        endpoint: &str,
        need_restore: bool,
        concurrency: Option<u32>,
    ) -> ApiResult<()> {
        self.ensure_leader()?;
        self.ensure_manual()?;
        let concurrency = self.resolve_concurrency(concurrency)?;
        let mut st = self.lock_state();
        self.check_worker(&st, endpoint)?;
        self.recover_endpoint_internal(&mut st, endpoint, need_restore, concurrency);
        Ok(())
    }

    /// Recover a single replica; refused while auto-failover is on.
    pub fn recover_table(&self, name: &str, pid: u32, endpoint: &str) -> ApiResult<u64> {
        self.ensure_leader()?;
        self.ensure_manual()?;
        let mut st = self.lock_state();
        self.check_worker(&st, endpoint)?;
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        if table.partition(pid).is_none() {
            return Err(ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)));
        }
        let meta = table.meta_of(pid, endpoint).ok_or_else(|| {
            ApiError::new(
                code::INVALID_PARAMETER,
                format!("pid {} has no replica at {}", pid, endpoint),
            )
        })?;
        if meta.is_alive {
            return Err(ApiError::new(
                code::ALREADY_ALIVE,
                format!("replica at {} for pid {} is already alive", endpoint, pid),
            ));
        }
        self.create_recover_table_op(
            &mut st,
            name,
            pid,
            endpoint,
            meta.is_leader,
            self.cfg.offset_delta,
            self.cfg.task_concurrency,
        )
        .map_err(op_error)
    }

    /// Cancel an in-queue op.
    pub fn cancel_op(&self, op_id: u64) -> ApiResult<()> {
        self.ensure_running()?;
        self.ensure_manual()?;
        self.cancel_queued_op(op_id)
            .map(|_| ())
            .map_err(|_| ApiError::new(code::WRONG_OP_STATE, "op is not queued"))
    }

    /// Persisted configuration write; only `auto_failover` exists.
    pub fn conf_set(&self, key: &str, value: &str) -> ApiResult<()> {
        self.ensure_running()?;
        if key != "auto_failover" {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                format!("unknown config key {}", key),
            ));
        }
        let flag = match value {
            "true" => true,
            "false" => false,
            _ => {
                return Err(ApiError::new(
                    code::INVALID_PARAMETER,
                    format!("bad flag value {}", value),
                ))
            }
        };
        self.store
            .write_flag(paths::AUTO_FAILOVER, flag)
            .map_err(store_error)?;
        self.set_auto_failover(flag);
        tracing::info!("auto_failover set to {}", flag);
        Ok(())
    }

    pub fn conf_get(&self, key: Option<&str>) -> ApiResult<Vec<(String, String)>> {
        self.ensure_running()?;
        let all = vec![(
            "auto_failover".to_string(),
            self.auto_failover().to_string(),
        )];
        match key {
            None => Ok(all),
            Some(key) => {
                let hit: Vec<_> = all.into_iter().filter(|(k, _)| k == key).collect();
                if hit.is_empty() {
                    Err(ApiError::new(
                        code::INVALID_PARAMETER,
                        format!("unknown config key {}", key),
                    ))
                } else {
                    Ok(hit)
                }
            }
        }
    }

    /// Change a table's ttl on every replica, then persist it.
    pub async fn update_ttl(
        &self,
        name: &str,
        ttl: TtlSpec,
        ts_name: Option<&str>,
    ) -> ApiResult<()> {
        self.ensure_leader()?;
        let table = {
            let st = self.lock_state();
            st.tables
                .get(name)
                .cloned()
                .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?
        };
        if let Some(ts) = ts_name {
            if !table.all_columns().any(|c| c.name == ts && c.is_ts) {
                return Err(ApiError::new(
                    code::INVALID_PARAMETER,
                    format!("{} is not a ts column of {}", ts, name),
                ));
            }
        }
        let mut failed = false;
        for partition in &table.table_partition {
            for meta in &partition.partition_meta {
                let rpc = match self.worker_rpc(&meta.endpoint) {
                    Ok(rpc) => rpc,
                    Err(e) => {
                        tracing::warn!("ttl push to {} skipped: {}", meta.endpoint, e);
                        failed = true;
                        continue;
                    }
                };
                if let Err(e) = rpc.update_ttl(table.tid, partition.pid, ttl, ts_name).await {
                    tracing::warn!(
                        "ttl push of {} pid[{}] to {} failed: {}",
                        name,
                        partition.pid,
                        meta.endpoint,
                        e
                    );
                    failed = true;
                }
            }
        }
        if failed {
            return Err(ApiError::new(
                code::TTL_PROPAGATION_FAILED,
                "ttl update failed on some replicas",
            ));
        }
        let mut st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        self.persist_table(&mut st, table.with_ttl(ttl))
            .map_err(store_error)?;
        Ok(())
    }

    /// Append-only schema evolution, bounded at 63 added columns.
    pub async fn add_table_field(&self, name: &str, column: ColumnDesc) -> ApiResult<()> {
        self.ensure_leader()?;
        let table = {
            let st = self.lock_state();
            st.tables
                .get(name)
                .cloned()
                .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?
        };
        if table.added_columns.len() >= MAX_ADDED_COLUMNS {
            return Err(ApiError::new(
                code::ADDED_COLUMN_OVERFLOW,
                format!("table {} already has {} added columns", name, MAX_ADDED_COLUMNS),
            ));
        }
        if table.all_columns().any(|c| c.name == column.name) {
            return Err(ApiError::new(
                code::DUPLICATE_COLUMN,
                format!("column {} already exists", column.name),
            ));
        }
        for partition in &table.table_partition {
            for meta in &partition.partition_meta {
                let rpc = self.worker_rpc(&meta.endpoint).map_err(|e| {
                    ApiError::new(code::WORKER_META_UPDATE_FAILED, e.to_string())
                })?;
                rpc.add_table_field(table.tid, partition.pid, &column)
                    .await
                    .map_err(|e| ApiError::new(code::WORKER_META_UPDATE_FAILED, e.to_string()))?;
            }
        }
        let mut st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        let updated = table
            .with_added_column(column)
            .map_err(|e| ApiError::new(code::INVALID_PARAMETER, e.to_string()))?;
        self.persist_table(&mut st, updated).map_err(store_error)?;
        Ok(())
    }

    pub fn get_table_partition(&self, name: &str, pid: u32) -> ApiResult<Partition> {
        self.ensure_running()?;
        let st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        table
            .partition(pid)
            .cloned()
            .ok_or_else(|| ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)))
    }

    /// Full replacement of one partition's placement record; refused
    /// while auto-failover is on.
    pub fn set_table_partition(&self, name: &str, partition: Partition) -> ApiResult<()> {
        self.ensure_leader()?;
        self.ensure_manual()?;
        let mut st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        let pid = partition.pid;
        if table.partition(pid).is_none() {
            return Err(ApiError::new(code::PID_MISSING, format!("pid {} not found", pid)));
        }
        let updated = table
            .with_partition(pid, partition)
            .map_err(|e| ApiError::new(code::INVALID_PARAMETER, e.to_string()))?;
        self.persist_table(&mut st, updated).map_err(store_error)?;
        Ok(())
    }

    /// Manual alive-flag override; refuses to take the last alive replica
    /// of any partition out of service.
    pub fn update_table_alive_status(
        &self,
        name: &str,
        endpoint: &str,
        pid: Option<u32>,
        is_alive: bool,
    ) -> ApiResult<()> {
        self.ensure_running()?;
        self.ensure_manual()?;
        let mut st = self.lock_state();
        let table = st
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::new(code::TABLE_MISSING, format!("table {} not found", name)))?;
        let mut updated = (*table).clone();
        let mut changed = false;
        for partition in updated.table_partition.iter_mut() {
            if pid.map(|p| p != partition.pid).unwrap_or(false) {
                continue;
            }
            let alive_count = partition.partition_meta.iter().filter(|m| m.is_alive).count();
            for meta in partition.partition_meta.iter_mut() {
                if meta.endpoint != endpoint || meta.is_alive == is_alive {
                    continue;
                }
                if !is_alive && alive_count <= 1 {
                    return Err(ApiError::new(
                        code::NO_ALIVE_FOLLOWER,
                        format!(
                            "replica at {} is the last alive one of pid {}",
                            endpoint, partition.pid
                        ),
                    ));
                }
                meta.is_alive = is_alive;
                changed = true;
            }
        }
        if !changed {
            return Err(ApiError::new(
                code::NO_OP_UPDATE,
                "no replica state would change",
            ));
        }
        self.persist_table(&mut st, updated).map_err(store_error)?;
        Ok(())
    }

    /// Re-establish the coordination store session.
    pub fn connect_store(&self) -> ApiResult<()> {
        self.store.reconnect().map_err(store_error)
    }

    /// Drop the coordination store session.
    pub fn disconnect_store(&self) -> ApiResult<()> {
        self.store.disconnect().map_err(store_error)
    }

    fn check_worker(&self, st: &State, endpoint: &str) -> ApiResult<()> {
        match st.workers.get(endpoint) {
            None => Err(ApiError::new(
                code::ENDPOINT_MISSING,
                format!("endpoint {} is not registered", endpoint),
            )),
            Some(worker) if !worker.is_healthy() => Err(ApiError::new(
                code::ENDPOINT_UNHEALTHY,
                format!("endpoint {} is offline", endpoint),
            )),
            Some(_) => Ok(()),
        }
    }
}

fn validate_schema(req: &CreateTableRequest) -> ApiResult<()> {
    for column in &req.columns {
        if column.is_index && !column.kind.indexable() {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                format!("column {} cannot be an index", column.name),
            ));
        }
    }
    for key in &req.column_keys {
        if key.col_names.is_empty() {
            let column = req
                .columns
                .iter()
                .find(|c| c.name == key.index_name)
                .ok_or_else(|| {
                    ApiError::new(
                        code::INVALID_PARAMETER,
                        format!("index {} is not a column", key.index_name),
                    )
                })?;
            if !column.kind.indexable() {
                return Err(ApiError::new(
                    code::INVALID_PARAMETER,
                    format!("index {} cannot use a float column", key.index_name),
                ));
            }
            continue;
        }
        for col_name in &key.col_names {
            let column = req.columns.iter().find(|c| &c.name == col_name).ok_or_else(|| {
                ApiError::new(
                    code::INVALID_PARAMETER,
                    format!("index column {} is not a column", col_name),
                )
            })?;
            if !column.kind.indexable() {
                return Err(ApiError::new(
                    code::INVALID_PARAMETER,
                    format!("index {} cannot use column {}", key.index_name, col_name),
                ));
            }
        }
    }
    Ok(())
}

/// Derive the index keys when the request leaves them implicit.
fn fill_column_keys(req: &CreateTableRequest) -> ApiResult<Vec<ColumnKey>> {
    if !req.column_keys.is_empty() {
        let mut keys = req.column_keys.clone();
        for key in keys.iter_mut() {
            if key.col_names.is_empty() {
                key.col_names.push(key.index_name.clone());
            }
        }
        return Ok(keys);
    }
    let ts_cols: Vec<String> = req
        .columns
        .iter()
        .filter(|c| c.is_ts)
        .map(|c| c.name.clone())
        .collect();
    if ts_cols.len() > 1 {
        return Err(ApiError::new(
            code::INVALID_PARAMETER,
            "multiple ts columns require explicit column keys",
        ));
    }
    Ok(req
        .columns
        .iter()
        .filter(|c| c.is_index)
        .map(|c| ColumnKey {
            index_name: c.name.clone(),
            col_names: vec![c.name.clone()],
            ts_names: ts_cols.clone(),
        })
        .collect())
}

fn validate_explicit_placement(partitions: &[Partition]) -> ApiResult<()> {
    let mut pids: Vec<u32> = partitions.iter().map(|p| p.pid).collect();
    pids.sort_unstable();
    pids.dedup();
    let contiguous = pids.len() == partitions.len()
        && pids
            .iter()
            .enumerate()
            .all(|(idx, pid)| *pid == idx as u32);
    if !contiguous {
        return Err(ApiError::new(
            code::INVALID_PARAMETER,
            "pids must be contiguous from zero",
        ));
    }
    for partition in partitions {
        if partition.partition_meta.is_empty() {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                format!("pid {} has no replicas", partition.pid),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnKind;
    use crate::engine::task::TaskStatus;
    use crate::store::{MemStore, MetaStore};
    use crate::testutil::{test_config, wait_until, MockCluster, TestCluster};
    use std::sync::Arc;
    use std::time::Duration;

    fn table_request(name: &str, partition_num: u32, replica_num: u32) -> CreateTableRequest {
        CreateTableRequest {
            name: name.to_string(),
            partition_num: Some(partition_num),
            replica_num: Some(replica_num),
            columns: vec![
                ColumnDesc {
                    name: "key".to_string(),
                    kind: ColumnKind::String,
                    is_index: true,
                    is_ts: false,
                },
                ColumnDesc {
                    name: "ts".to_string(),
                    kind: ColumnKind::Timestamp,
                    is_index: false,
                    is_ts: true,
                },
                ColumnDesc {
                    name: "value".to_string(),
                    kind: ColumnKind::Double,
                    is_index: false,
                    is_ts: false,
                },
            ],
            column_keys: vec![],
            ttl: None,
            seg_cnt: None,
            compress: None,
            storage: None,
            key_entry_max_height: None,
            table_partition: vec![],
        }
    }

    /// Coordinator with registered workers but no background loops, for
    /// tests that need to drive the engine passes by hand.
    async fn manual_coordinator(
        endpoints: &[&str],
    ) -> (Arc<Coordinator>, Arc<MemStore>, Arc<MockCluster>) {
        let store = Arc::new(MemStore::new());
        let cluster = Arc::new(MockCluster::new());
        let coordinator =
            Coordinator::new(test_config(), store.clone(), cluster.clone()).unwrap();
        store.ensure_counter(paths::TABLE_INDEX, 0).unwrap();
        store.ensure_counter(paths::TERM, 1).unwrap();
        store.ensure_counter(paths::OP_INDEX, 0).unwrap();
        store.ensure_counter(paths::NOTIFY, 1).unwrap();
        {
            let mut st = coordinator.lock_state();
            let endpoints: Vec<String> = endpoints.iter().map(|ep| ep.to_string()).collect();
            coordinator.update_workers(&mut st, &endpoints);
            st.term = 1;
        }
        coordinator.set_running(true);
        (coordinator, store, cluster)
    }

    #[tokio::test]
    async fn test_create_and_observe() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 3, 2))
            .await
            .unwrap();
        assert_eq!(tid, 1);
        assert_eq!(
            tc.store.read_counter(paths::TABLE_INDEX).unwrap(),
            Some(1)
        );
        assert!(tc.store.get(&paths::table_node("t")).unwrap().is_some());

        let tables = tc.coordinator.show_table(None).unwrap();
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.table_partition.len(), 3);
        let pids: Vec<u32> = table.table_partition.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![0, 1, 2]);
        for partition in &table.table_partition {
            assert_eq!(partition.partition_meta.len(), 2);
            assert_eq!(
                partition
                    .partition_meta
                    .iter()
                    .filter(|m| m.is_leader && m.is_alive)
                    .count(),
                1
            );
            for meta in &partition.partition_meta {
                assert!(tc
                    .cluster
                    .worker(&meta.endpoint)
                    .has_replica(tid, partition.pid));
            }
        }
    }

    #[tokio::test]
    async fn test_create_table_validation() {
        let tc = TestCluster::start(&["a:1"]).await;
        // more replicas than live workers
        let err = tc
            .coordinator
            .create_table(table_request("t", 2, 2))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::PARTITION_INFO_FAILED);

        tc.coordinator
            .create_table(table_request("t", 2, 1))
            .await
            .unwrap();
        let err = tc
            .coordinator
            .create_table(table_request("t", 2, 1))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::TABLE_EXISTS);

        // float columns cannot be indexed
        let mut bad = table_request("u", 1, 1);
        bad.columns[2].is_index = true;
        let err = tc.coordinator.create_table(bad).await.unwrap_err();
        assert_eq!(err.code, code::INVALID_PARAMETER);
    }

    #[tokio::test]
    async fn test_planned_leader_change() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let before = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let old_leader = before.leader_of(0).unwrap().endpoint.clone();
        let follower = before
            .partition(0)
            .unwrap()
            .partition_meta
            .iter()
            .find(|m| !m.is_leader)
            .unwrap()
            .endpoint
            .clone();
        assert_eq!(tc.store.read_counter(paths::TERM).unwrap(), Some(1));

        let op_id = tc.coordinator.change_leader("t", 0, None).unwrap();
        assert_eq!(tc.wait_op_done(op_id).await, TaskStatus::Done);

        let after = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = after.leader_of(0).unwrap();
        assert_eq!(leader.endpoint, follower);
        let old_meta = after.meta_of(0, &old_leader).unwrap();
        assert!(!old_meta.is_alive);
        // the term advanced by 2 and a new epoch was recorded
        assert_eq!(tc.store.read_counter(paths::TERM).unwrap(), Some(3));
        let epochs = &after.partition(0).unwrap().term_offset;
        assert_eq!(epochs.len(), 2);
        assert!(epochs[0].term < epochs[1].term);
        assert_eq!(epochs[1].term, 3);
        assert!(tc.cluster.worker(&follower).replica_is_leader(tid, 0));
    }

    #[tokio::test]
    async fn test_change_leader_refused_with_auto_failover() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        tc.coordinator.conf_set("auto_failover", "true").unwrap();
        let err = tc.coordinator.change_leader("t", 0, None).unwrap_err();
        assert_eq!(err.code, code::AUTO_FAILOVER_ENABLED);
        let err = tc.coordinator.offline_endpoint("a:1", None).unwrap_err();
        assert_eq!(err.code, code::AUTO_FAILOVER_ENABLED);
    }

    #[tokio::test]
    async fn test_crash_and_auto_failover() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 4, 2))
            .await
            .unwrap();
        tc.coordinator.conf_set("auto_failover", "true").unwrap();

        tc.unregister_worker("b:1");

        let coordinator = tc.coordinator.clone();
        assert!(
            wait_until(Duration::from_secs(10), || {
                let tables = match coordinator.show_table(Some("t")) {
                    Ok(tables) => tables,
                    Err(_) => return false,
                };
                let queues_empty = {
                    let st = coordinator.lock_state();
                    st.queues.iter().all(|queue| queue.is_empty())
                };
                queues_empty
                    && tables[0].table_partition.iter().all(|partition| {
                        let leaders = partition
                            .partition_meta
                            .iter()
                            .filter(|m| m.is_leader && m.is_alive)
                            .count();
                        let b_dead = partition
                            .partition_meta
                            .iter()
                            .filter(|m| m.endpoint == "b:1")
                            .all(|m| !m.is_alive);
                        leaders == 1
                            && b_dead
                            && partition
                                .partition_meta
                                .iter()
                                .find(|m| m.is_leader && m.is_alive)
                                .map(|m| m.endpoint != "b:1")
                                .unwrap_or(false)
                    })
            })
            .await,
            "failover did not converge"
        );
        for (op_id, status) in tc.wait_ops_settled().await {
            assert_eq!(status, TaskStatus::Done, "op {} not done", op_id);
            // finished ops leave no store node behind
            assert!(tc.store.get(&paths::op_node(op_id)).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_crash_recover_when_worker_returns() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 2, 2))
            .await
            .unwrap();
        tc.coordinator.conf_set("auto_failover", "true").unwrap();

        tc.unregister_worker("b:1");
        let coordinator = tc.coordinator.clone();
        assert!(
            wait_until(Duration::from_secs(10), || {
                let st = coordinator.lock_state();
                let settled = st.queues.iter().all(|queue| queue.is_empty());
                let failed_over = st
                    .tables
                    .get("t")
                    .map(|t| {
                        t.table_partition.iter().all(|p| {
                            p.partition_meta
                                .iter()
                                .filter(|m| m.endpoint == "b:1")
                                .all(|m| !m.is_alive)
                        })
                    })
                    .unwrap_or(false);
                settled && failed_over && !st.done_ops.is_empty()
            })
            .await,
            "failover did not converge"
        );

        // the worker restarts and announces it through the startup marker
        tc.register_worker_startup("b:1");
        let coordinator = tc.coordinator.clone();
        assert!(
            wait_until(Duration::from_secs(10), || {
                let st = coordinator.lock_state();
                let settled = st.queues.iter().all(|queue| queue.is_empty());
                let recovered = st
                    .tables
                    .get("t")
                    .map(|t| {
                        t.table_partition.iter().all(|p| {
                            p.partition_meta.iter().all(|m| m.is_alive)
                                && p.partition_meta
                                    .iter()
                                    .filter(|m| m.is_leader && m.is_alive)
                                    .count()
                                    == 1
                        })
                    })
                    .unwrap_or(false);
                settled && recovered
            })
            .await,
            "returned worker was not recovered"
        );
    }

    #[tokio::test]
    async fn test_migrate() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = table.leader_of(0).unwrap().endpoint.clone();
        let src = table
            .partition(0)
            .unwrap()
            .partition_meta
            .iter()
            .find(|m| !m.is_leader)
            .unwrap()
            .endpoint
            .clone();
        let dest = ["a:1", "b:1", "c:1"]
            .iter()
            .find(|ep| table.meta_of(0, ep).is_none())
            .unwrap()
            .to_string();

        let op_ids = tc.coordinator.migrate("t", &[0], &src, &dest).unwrap();
        assert_eq!(op_ids.len(), 1);
        assert_eq!(tc.wait_op_done(op_ids[0]).await, TaskStatus::Done);

        let after = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        assert!(after.meta_of(0, &src).is_none());
        let moved = after.meta_of(0, &dest).unwrap();
        assert!(moved.is_alive);
        assert!(!moved.is_leader);
        assert_eq!(after.leader_of(0).unwrap().endpoint, leader);
        assert!(tc.cluster.worker(&dest).has_replica(tid, 0));
        assert!(!tc.cluster.worker(&src).has_replica(tid, 0));
    }

    #[tokio::test]
    async fn test_migrate_preconditions() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = table.leader_of(0).unwrap().endpoint.clone();
        let dest = ["a:1", "b:1", "c:1"]
            .iter()
            .find(|ep| table.meta_of(0, ep).is_none())
            .unwrap()
            .to_string();

        let err = tc
            .coordinator
            .migrate("t", &[0], &leader, &dest)
            .unwrap_err();
        assert_eq!(err.code, code::MIGRATE_PRECONDITION);
        let err = tc
            .coordinator
            .migrate("t", &[0], "nope:1", &dest)
            .unwrap_err();
        assert_eq!(err.code, code::SRC_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cancel_mid_flight() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = tc.cluster.worker(&table.leader_of(0).unwrap().endpoint);
        leader.hold_task_type(TaskType::MakeSnapshot);

        let op_id = tc.coordinator.make_snapshot("t", 0).unwrap();
        // wait for the snapshot rpc to be dispatched
        let worker = leader.clone();
        assert!(
            wait_until(Duration::from_secs(5), || {
                worker
                    .task_log()
                    .iter()
                    .any(|t| t.op_id == op_id && t.task_type == TaskType::MakeSnapshot)
            })
            .await
        );

        tc.coordinator.cancel_op(op_id).unwrap();
        assert_eq!(tc.wait_op_done(op_id).await, TaskStatus::Canceled);
        assert!(tc.store.get(&paths::op_node(op_id)).unwrap().is_none());
        // cancelling a finished op is rejected
        let err = tc.coordinator.cancel_op(op_id).unwrap_err();
        assert_eq!(err.code, code::WRONG_OP_STATE);
    }

    #[tokio::test]
    async fn test_cancel_before_any_task_runs() {
        let (coordinator, store, cluster) = manual_coordinator(&["a:1", "b:1"]).await;
        coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let op_id = coordinator.make_snapshot("t", 0).unwrap();
        coordinator.cancel_op(op_id).unwrap();

        // the reaper finishes the removal; no task body ever ran
        assert!(coordinator.reaper_pass().await);
        {
            let st = coordinator.lock_state();
            assert!(st.queues.iter().all(|queue| queue.is_empty()));
            let op = st.done_ops.iter().find(|op| op.op_id == op_id).unwrap();
            assert_eq!(op.status(), TaskStatus::Canceled);
        }
        assert!(store.get(&paths::op_node(op_id)).unwrap().is_none());
        assert!(cluster.worker("a:1").task_log().is_empty());
        assert!(cluster.worker("b:1").task_log().is_empty());
    }

    #[tokio::test]
    async fn test_del_replica_refuses_leader() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = table.leader_of(0).unwrap().endpoint.clone();
        let err = tc.coordinator.del_replica("t", &[0], &leader).unwrap_err();
        assert_eq!(err.code, code::CANNOT_DROP_LEADER);
    }

    #[tokio::test]
    async fn test_add_and_del_replica() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let spare = ["a:1", "b:1", "c:1"]
            .iter()
            .find(|ep| table.meta_of(0, ep).is_none())
            .unwrap()
            .to_string();

        let op_ids = tc.coordinator.add_replica("t", &[0], &spare).unwrap();
        assert_eq!(tc.wait_op_done(op_ids[0]).await, TaskStatus::Done);
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let added = table.meta_of(0, &spare).unwrap();
        assert!(added.is_alive && !added.is_leader);
        assert!(tc.cluster.worker(&spare).has_replica(tid, 0));
        // duplicate replica is rejected
        let err = tc.coordinator.add_replica("t", &[0], &spare).unwrap_err();
        assert_eq!(err.code, code::REPLICA_EXISTS);

        let op_ids = tc.coordinator.del_replica("t", &[0], &spare).unwrap();
        assert_eq!(tc.wait_op_done(op_ids[0]).await, TaskStatus::Done);
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        assert!(table.meta_of(0, &spare).is_none());
        assert!(!tc.cluster.worker(&spare).has_replica(tid, 0));
    }

    #[tokio::test]
    async fn test_parent_op_must_exist() {
        let (coordinator, _store, _cluster) = manual_coordinator(&["a:1", "b:1"]).await;
        coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let mut st = coordinator.lock_state();
        let err = coordinator
            .create_update_partition_status_op(&mut st, "t", 0, "a:1", true, true, Some(9999), 0)
            .unwrap_err();
        assert!(matches!(err, Error::OpAdd(_)));
        assert_eq!(op_error(err).code, code::OP_ADD_FAILED);
    }

    #[tokio::test]
    async fn test_add_table_field_limits() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        for idx in 0..MAX_ADDED_COLUMNS - 1 {
            tc.coordinator
                .add_table_field(
                    "t",
                    ColumnDesc {
                        name: format!("c{}", idx),
                        kind: ColumnKind::Int,
                        is_index: false,
                        is_ts: false,
                    },
                )
                .await
                .unwrap();
        }
        // below the bound a repeated name reports the duplicate
        let err = tc
            .coordinator
            .add_table_field(
                "t",
                ColumnDesc {
                    name: "c0".to_string(),
                    kind: ColumnKind::Int,
                    is_index: false,
                    is_ts: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, code::DUPLICATE_COLUMN);

        tc.coordinator
            .add_table_field(
                "t",
                ColumnDesc {
                    name: format!("c{}", MAX_ADDED_COLUMNS - 1),
                    kind: ColumnKind::Int,
                    is_index: false,
                    is_ts: false,
                },
            )
            .await
            .unwrap();
        let err = tc
            .coordinator
            .add_table_field(
                "t",
                ColumnDesc {
                    name: "overflow".to_string(),
                    kind: ColumnKind::Int,
                    is_index: false,
                    is_ts: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, code::ADDED_COLUMN_OVERFLOW);

        // at the bound the overflow wins even for a repeated name
        let err = tc
            .coordinator
            .add_table_field(
                "t",
                ColumnDesc {
                    name: "c0".to_string(),
                    kind: ColumnKind::Int,
                    is_index: false,
                    is_ts: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, code::ADDED_COLUMN_OVERFLOW);
        // the schema changes reached the workers
        assert!(!tc.cluster.worker("a:1").added_fields().is_empty());
    }

    #[tokio::test]
    async fn test_update_ttl() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let ttl = TtlSpec {
            kind: crate::catalog::TtlKind::LatestCount,
            value: 10,
        };
        tc.coordinator
            .update_ttl("t", ttl, Some("ts"))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        assert_eq!(table.ttl, ttl);
        assert_eq!(tc.cluster.worker("a:1").ttl_of(tid, 0), Some(ttl));

        let err = tc
            .coordinator
            .update_ttl("t", ttl, Some("not_a_ts"))
            .await
            .unwrap_err();
        assert_eq!(err.code, code::INVALID_PARAMETER);
    }

    #[tokio::test]
    async fn test_conf_and_status_surface() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        assert_eq!(
            tc.coordinator.conf_get(Some("auto_failover")).unwrap(),
            vec![("auto_failover".to_string(), "false".to_string())]
        );
        tc.coordinator.conf_set("auto_failover", "true").unwrap();
        assert_eq!(
            tc.store.read_flag(paths::AUTO_FAILOVER).unwrap(),
            Some(true)
        );
        assert_eq!(
            tc.coordinator.conf_set("bogus", "true").unwrap_err().code,
            code::INVALID_PARAMETER
        );

        let workers = tc.coordinator.show_workers().unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.state == WorkerState::Healthy));
    }

    #[tokio::test]
    async fn test_show_op_status_reports_head_task() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let op_id = tc.coordinator.make_snapshot("t", 0).unwrap();
        tc.wait_op_done(op_id).await;
        let views = tc.coordinator.show_op_status(Some("t"), None).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].op_id, op_id);
        assert_eq!(views[0].status, TaskStatus::Done);
        // filtered out by pid
        assert!(tc
            .coordinator
            .show_op_status(Some("t"), Some(7))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_table_alive_status_guard() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let follower = table
            .partition(0)
            .unwrap()
            .partition_meta
            .iter()
            .find(|m| !m.is_leader)
            .unwrap()
            .endpoint
            .clone();
        let leader = table.leader_of(0).unwrap().endpoint.clone();

        tc.coordinator
            .update_table_alive_status("t", &follower, Some(0), false)
            .unwrap();
        // the leader is now the last alive replica of pid 0
        let err = tc
            .coordinator
            .update_table_alive_status("t", &leader, Some(0), false)
            .unwrap_err();
        assert_eq!(err.code, code::NO_ALIVE_FOLLOWER);
        // flipping a flag to its current value changes nothing
        let err = tc
            .coordinator
            .update_table_alive_status("t", &follower, Some(0), false)
            .unwrap_err();
        assert_eq!(err.code, code::NO_OP_UPDATE);
    }

    #[tokio::test]
    async fn test_worker_failure_fails_op() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        tc.coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = table.leader_of(0).unwrap().endpoint.clone();
        tc.cluster
            .worker(&leader)
            .fail_task_type(TaskType::MakeSnapshot);

        let op_id = tc.coordinator.make_snapshot("t", 0).unwrap();
        assert_eq!(tc.wait_op_done(op_id).await, TaskStatus::Failed);
        // failed ops are kept for inspection, store node included
        assert!(tc.store.get(&paths::op_node(op_id)).unwrap().is_some());
        let views = tc.coordinator.show_op_status(Some("t"), Some(0)).unwrap();
        assert_eq!(views[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_select_leader_prefers_highest_offset() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 3))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let followers: Vec<String> = table
            .partition(0)
            .unwrap()
            .partition_meta
            .iter()
            .filter(|m| !m.is_leader)
            .map(|m| m.endpoint.clone())
            .collect();
        assert_eq!(followers.len(), 2);
        let ahead = followers[0].clone();
        tc.cluster.worker(&ahead).set_offset(tid, 0, 100);

        let op_id = tc.coordinator.change_leader("t", 0, None).unwrap();
        assert_eq!(tc.wait_op_done(op_id).await, TaskStatus::Done);
        let after = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        assert_eq!(after.leader_of(0).unwrap().endpoint, ahead);
        // the new epoch starts one past the winner's offset
        let epochs = &after.partition(0).unwrap().term_offset;
        assert_eq!(epochs.last().unwrap().offset, 101);
    }

    #[tokio::test]
    async fn test_change_leader_candidate_must_hold_max_offset() {
        let tc = TestCluster::start(&["a:1", "b:1", "c:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 3))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let followers: Vec<String> = table
            .partition(0)
            .unwrap()
            .partition_meta
            .iter()
            .filter(|m| !m.is_leader)
            .map(|m| m.endpoint.clone())
            .collect();
        tc.cluster.worker(&followers[0]).set_offset(tid, 0, 100);

        // the lagging candidate is accepted into the op but the leader
        // selection rejects it
        let op_id = tc
            .coordinator
            .change_leader("t", 0, Some(&followers[1]))
            .unwrap();
        assert_eq!(tc.wait_op_done(op_id).await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_recover_table_picks_drop_variant() {
        let tc = TestCluster::start(&["a:1", "b:1"]).await;
        let tid = tc
            .coordinator
            .create_table(table_request("t", 1, 2))
            .await
            .unwrap();
        let table = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        let leader = table.leader_of(0).unwrap().endpoint.clone();
        let follower = table
            .partition(0)
            .unwrap()
            .partition_meta
            .iter()
            .find(|m| !m.is_leader)
            .unwrap()
            .endpoint
            .clone();
        // the follower fell far behind the leader's snapshot
        tc.coordinator
            .update_table_alive_status("t", &follower, Some(0), false)
            .unwrap();
        tc.cluster.worker(&leader).set_manifest(tid, 0, 100);

        let op_id = tc.coordinator.recover_table("t", 0, &follower).unwrap();
        assert_eq!(tc.wait_op_done(op_id).await, TaskStatus::Done);
        let tc_coordinator = tc.coordinator.clone();
        assert!(
            wait_until(Duration::from_secs(10), || {
                let st = tc_coordinator.lock_state();
                st.queues.iter().all(|queue| queue.is_empty())
            })
            .await
        );
        // the probe decided on the drop-and-resend variant
        let views = tc.coordinator.show_op_status(Some("t"), Some(0)).unwrap();
        assert!(views
            .iter()
            .any(|v| v.op_type == crate::engine::op::OpType::ReAddReplicaWithDropOp
                && v.status == TaskStatus::Done));
        let after = &tc.coordinator.show_table(Some("t")).unwrap()[0];
        assert!(after.meta_of(0, &follower).unwrap().is_alive);
    }

    #[tokio::test]
    async fn test_not_leader_surface() {
        let store = Arc::new(MemStore::new());
        let cluster = Arc::new(MockCluster::new());
        let coordinator = Coordinator::new(test_config(), store, cluster).unwrap();
        let err = coordinator.show_table(None).unwrap_err();
        assert_eq!(err.code, code::NOT_LEADER);
        let err = coordinator.make_snapshot("t", 0).unwrap_err();
        assert_eq!(err.code, code::NOT_LEADER);
    }
}
