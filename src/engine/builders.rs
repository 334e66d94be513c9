//! Op builders
//!
//! Each op type is a named workflow; its builder turns the persisted
//! payload plus the current catalog state into the ordered task list.
//! The same builders run for newly created ops and for ops recovered
//! from the store, so a task list is always reproducible from the
//! header alone.

use crate::catalog::TableInfo;
use crate::common::{Error, Result};
use crate::coordinator::{Coordinator, State};
use crate::engine::op::{OpInfo, OpType};
use crate::engine::task::{Task, TaskSpec, TaskType};
use crate::worker::{ReplicaMode, TableMeta};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_payload<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(raw)?)
}

/// Payload of replica-shaped ops: add, re-add, del, offline, reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReplicaPayload {
    pub endpoint: String,
    pub offset_delta: u64,
}

/// Payload of MigrateOp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MigratePayload {
    pub src: String,
    pub dest: String,
    pub offset_delta: u64,
}

/// Payload of ChangeLeaderOp. The select-leader task fills in the
/// chosen leader, its offset and the new term for the following tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChangeLeaderData {
    pub tid: u32,
    pub followers: Vec<String>,
    pub candidate: Option<String>,
    pub leader: Option<String>,
    pub offset: Option<u64>,
    pub term: Option<u64>,
}

/// Payload of UpdatePartitionStatusOp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StatusPayload {
    pub endpoint: String,
    pub is_leader: bool,
    pub is_alive: bool,
}

/// Payload of RecoverTableOp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecoverPayload {
    pub endpoint: String,
    pub is_leader: bool,
    pub offset_delta: u64,
    pub concurrency: u32,
}

fn build_err(info: &OpInfo, msg: impl Into<String>) -> Error {
    Error::OpBuild(format!(
        "{} {} pid[{}]: {}",
        info.op_type,
        info.name,
        info.pid,
        msg.into()
    ))
}

/// An RPC task targets a worker that must be healthy at build time.
fn rpc_task(st: &State, info: &OpInfo, task_type: TaskType, endpoint: &str, spec: TaskSpec) -> Result<Task> {
    if !st.is_worker_healthy(endpoint) {
        return Err(build_err(info, format!("worker {} is not online", endpoint)));
    }
    Ok(Task::rpc(task_type, endpoint, spec))
}

/// The load-table request sent to a worker about to host a replica.
fn load_meta(table: &TableInfo, pid: u32, mode: ReplicaMode) -> TableMeta {
    TableMeta {
        name: table.name.clone(),
        tid: table.tid,
        pid,
        mode,
        term: 0,
        ttl: table.ttl,
        seg_cnt: table.seg_cnt,
        storage: table.storage,
        compress: table.compress,
        key_entry_max_height: table.key_entry_max_height,
        columns: table.all_columns().cloned().collect(),
        followers: Vec::new(),
    }
}

fn lookup(st: &State, info: &OpInfo) -> Result<(std::sync::Arc<TableInfo>, String)> {
    let table = st
        .table(&info.name)
        .map_err(|_| build_err(info, "table not found"))?;
    let leader = st
        .leader_endpoint(&table, info.pid)
        .map_err(|_| build_err(info, "no alive leader"))?;
    Ok((table, leader))
}

/// Build the task list for an op header.
pub(crate) fn build_task_list(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let tasks = match info.op_type {
        OpType::MakeSnapshotOp => build_make_snapshot(st, info)?,
        OpType::AddReplicaOp => build_add_replica(st, info, AddVariant::Full)?,
        OpType::ReAddReplicaOp => build_add_replica(st, info, AddVariant::Re)?,
        OpType::ReAddReplicaWithDropOp => build_add_replica(st, info, AddVariant::WithDrop)?,
        OpType::ReAddReplicaNoSendOp => build_add_replica(st, info, AddVariant::NoSend)?,
        OpType::ReAddReplicaSimplifyOp => build_add_replica(st, info, AddVariant::Simplify)?,
        OpType::DelReplicaOp => build_del_replica(st, info)?,
        OpType::OfflineReplicaOp => build_offline_replica(st, info)?,
        OpType::ChangeLeaderOp => build_change_leader(info)?,
        OpType::MigrateOp => build_migrate(st, info)?,
        OpType::ReLoadTableOp => build_re_load_table(st, info)?,
        OpType::UpdatePartitionStatusOp => build_update_partition_status(st, info)?,
        OpType::RecoverTableOp => build_recover_table(st, info)?,
    };
    if tasks.is_empty() {
        return Err(build_err(info, "empty task list"));
    }
    Ok(tasks)
}

fn build_make_snapshot(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let (table, leader) = lookup(st, info)?;
    let mut tasks = VecDeque::new();
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::MakeSnapshot,
        &leader,
        TaskSpec::MakeSnapshot {
            endpoint: leader.clone(),
            tid: table.tid,
            pid: info.pid,
        },
    )?);
    Ok(tasks)
}

/// The add-replica family shares one skeleton; the variants differ in
/// which data-movement steps can be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddVariant {
    /// Fresh replica: full copy plus a new catalog meta entry.
    Full,
    /// Meta already present, data still needs the full copy.
    Re,
    /// Stale local data must be dropped before the copy.
    WithDrop,
    /// Local snapshot is current, only the binlog tail is replayed.
    NoSend,
    /// Replica only needs re-registration with the leader.
    Simplify,
}

fn build_add_replica(st: &State, info: &OpInfo, variant: AddVariant) -> Result<VecDeque<Task>> {
    let payload: ReplicaPayload = decode_payload(&info.data)?;
    let (table, leader) = lookup(st, info)?;
    let tid = table.tid;
    let pid = info.pid;
    let dest = payload.endpoint.clone();
    let mut tasks = VecDeque::new();

    if variant != AddVariant::Simplify {
        tasks.push_back(rpc_task(
            st,
            info,
            TaskType::PauseSnapshot,
            &leader,
            TaskSpec::PauseSnapshot {
                endpoint: leader.clone(),
                tid,
                pid,
            },
        )?);
    }
    if variant == AddVariant::WithDrop {
        tasks.push_back(rpc_task(
            st,
            info,
            TaskType::DropTable,
            &dest,
            TaskSpec::DropTable {
                endpoint: dest.clone(),
                tid,
                pid,
            },
        )?);
    }
    if matches!(variant, AddVariant::Full | AddVariant::Re | AddVariant::WithDrop) {
        tasks.push_back(rpc_task(
            st,
            info,
            TaskType::SendSnapshot,
            &leader,
            TaskSpec::SendSnapshot {
                endpoint: leader.clone(),
                tid,
                pid,
                dest: dest.clone(),
            },
        )?);
    }
    if variant != AddVariant::Simplify {
        tasks.push_back(rpc_task(
            st,
            info,
            TaskType::LoadTable,
            &dest,
            TaskSpec::LoadTable {
                endpoint: dest.clone(),
                meta: load_meta(&table, pid, ReplicaMode::Follower),
            },
        )?);
    }
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::AddReplica,
        &leader,
        TaskSpec::AddReplica {
            endpoint: leader.clone(),
            tid,
            pid,
            dest: dest.clone(),
        },
    )?);
    if variant != AddVariant::Simplify {
        tasks.push_back(rpc_task(
            st,
            info,
            TaskType::RecoverSnapshot,
            &leader,
            TaskSpec::RecoverSnapshot {
                endpoint: leader.clone(),
                tid,
                pid,
            },
        )?);
    }
    if variant == AddVariant::Full {
        tasks.push_back(Task::local(
            TaskType::AddTableInfo,
            TaskSpec::AddTableInfo {
                name: info.name.clone(),
                pid,
                endpoint: dest.clone(),
            },
        ));
    }
    tasks.push_back(Task::local(
        TaskType::CheckBinlogSyncProgress,
        TaskSpec::CheckBinlogSyncProgress {
            name: info.name.clone(),
            pid,
            follower: dest.clone(),
            offset_delta: payload.offset_delta,
        },
    ));
    tasks.push_back(Task::local(
        TaskType::UpdatePartitionStatus,
        TaskSpec::UpdatePartitionStatus {
            name: info.name.clone(),
            pid,
            endpoint: dest,
            is_leader: false,
            is_alive: true,
        },
    ));
    Ok(tasks)
}

fn build_del_replica(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: ReplicaPayload = decode_payload(&info.data)?;
    let (table, leader) = lookup(st, info)?;
    let mut tasks = VecDeque::new();
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::DelReplica,
        &leader,
        TaskSpec::DelReplica {
            endpoint: leader.clone(),
            tid: table.tid,
            pid: info.pid,
            dest: payload.endpoint.clone(),
        },
    )?);
    tasks.push_back(Task::local(
        TaskType::DelTableInfo,
        TaskSpec::DelTableInfo {
            name: info.name.clone(),
            pid: info.pid,
            endpoint: payload.endpoint.clone(),
        },
    ));
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::DropTable,
        &payload.endpoint,
        TaskSpec::DropTable {
            endpoint: payload.endpoint.clone(),
            tid: table.tid,
            pid: info.pid,
        },
    )?);
    Ok(tasks)
}

fn build_offline_replica(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: ReplicaPayload = decode_payload(&info.data)?;
    let (table, leader) = lookup(st, info)?;
    let mut tasks = VecDeque::new();
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::DelReplica,
        &leader,
        TaskSpec::DelReplica {
            endpoint: leader.clone(),
            tid: table.tid,
            pid: info.pid,
            dest: payload.endpoint.clone(),
        },
    )?);
    tasks.push_back(Task::local(
        TaskType::UpdatePartitionStatus,
        TaskSpec::UpdatePartitionStatus {
            name: info.name.clone(),
            pid: info.pid,
            endpoint: payload.endpoint,
            is_leader: false,
            is_alive: false,
        },
    ));
    Ok(tasks)
}

fn build_change_leader(info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: ChangeLeaderData = decode_payload(&info.data)?;
    let mut tasks = VecDeque::new();
    tasks.push_back(Task::local(
        TaskType::SelectLeader,
        TaskSpec::SelectLeader {
            name: info.name.clone(),
            tid: payload.tid,
            pid: info.pid,
            followers: payload.followers.clone(),
        },
    ));
    tasks.push_back(Task::local(
        TaskType::ChangeLeader,
        TaskSpec::ChangeLeader {
            name: info.name.clone(),
            pid: info.pid,
        },
    ));
    tasks.push_back(Task::local(
        TaskType::UpdateLeaderInfo,
        TaskSpec::UpdateLeaderInfo {
            name: info.name.clone(),
            pid: info.pid,
        },
    ));
    Ok(tasks)
}

fn build_migrate(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: MigratePayload = decode_payload(&info.data)?;
    let (table, leader) = lookup(st, info)?;
    let tid = table.tid;
    let pid = info.pid;
    let mut tasks = VecDeque::new();
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::PauseSnapshot,
        &leader,
        TaskSpec::PauseSnapshot {
            endpoint: leader.clone(),
            tid,
            pid,
        },
    )?);
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::SendSnapshot,
        &leader,
        TaskSpec::SendSnapshot {
            endpoint: leader.clone(),
            tid,
            pid,
            dest: payload.dest.clone(),
        },
    )?);
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::RecoverSnapshot,
        &leader,
        TaskSpec::RecoverSnapshot {
            endpoint: leader.clone(),
            tid,
            pid,
        },
    )?);
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::LoadTable,
        &payload.dest,
        TaskSpec::LoadTable {
            endpoint: payload.dest.clone(),
            meta: load_meta(&table, pid, ReplicaMode::Follower),
        },
    )?);
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::AddReplica,
        &leader,
        TaskSpec::AddReplica {
            endpoint: leader.clone(),
            tid,
            pid,
            dest: payload.dest.clone(),
        },
    )?);
    tasks.push_back(Task::local(
        TaskType::AddTableInfo,
        TaskSpec::AddTableInfo {
            name: info.name.clone(),
            pid,
            endpoint: payload.dest.clone(),
        },
    ));
    tasks.push_back(Task::local(
        TaskType::CheckBinlogSyncProgress,
        TaskSpec::CheckBinlogSyncProgress {
            name: info.name.clone(),
            pid,
            follower: payload.dest.clone(),
            offset_delta: payload.offset_delta,
        },
    ));
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::DelReplica,
        &leader,
        TaskSpec::DelReplica {
            endpoint: leader.clone(),
            tid,
            pid,
            dest: payload.src.clone(),
        },
    )?);
    tasks.push_back(Task::local(
        TaskType::UpdateTableInfo,
        TaskSpec::UpdateTableInfo {
            name: info.name.clone(),
            pid,
            src: payload.src.clone(),
            dest: payload.dest.clone(),
        },
    ));
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::DropTable,
        &payload.src,
        TaskSpec::DropTable {
            endpoint: payload.src.clone(),
            tid,
            pid,
        },
    )?);
    Ok(tasks)
}

fn build_re_load_table(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: ReplicaPayload = decode_payload(&info.data)?;
    let table = st
        .table(&info.name)
        .map_err(|_| build_err(info, "table not found"))?;
    let mut tasks = VecDeque::new();
    tasks.push_back(rpc_task(
        st,
        info,
        TaskType::LoadTable,
        &payload.endpoint,
        TaskSpec::LoadTable {
            endpoint: payload.endpoint.clone(),
            meta: load_meta(&table, info.pid, ReplicaMode::Leader),
        },
    )?);
    tasks.push_back(Task::local(
        TaskType::UpdatePartitionStatus,
        TaskSpec::UpdatePartitionStatus {
            name: info.name.clone(),
            pid: info.pid,
            endpoint: payload.endpoint,
            is_leader: true,
            is_alive: true,
        },
    ));
    Ok(tasks)
}

fn build_update_partition_status(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: StatusPayload = decode_payload(&info.data)?;
    st.table(&info.name)
        .map_err(|_| build_err(info, "table not found"))?;
    let mut tasks = VecDeque::new();
    tasks.push_back(Task::local(
        TaskType::UpdatePartitionStatus,
        TaskSpec::UpdatePartitionStatus {
            name: info.name.clone(),
            pid: info.pid,
            endpoint: payload.endpoint,
            is_leader: payload.is_leader,
            is_alive: payload.is_alive,
        },
    ));
    Ok(tasks)
}

fn build_recover_table(st: &State, info: &OpInfo) -> Result<VecDeque<Task>> {
    let payload: RecoverPayload = decode_payload(&info.data)?;
    let mut tasks = VecDeque::new();
    if !payload.is_leader {
        let (table, leader) = lookup(st, info)?;
        if leader == payload.endpoint {
            return Err(build_err(info, "endpoint is the leader"));
        }
        tasks.push_back(rpc_task(
            st,
            info,
            TaskType::DelReplica,
            &leader,
            TaskSpec::DelReplica {
                endpoint: leader.clone(),
                tid: table.tid,
                pid: info.pid,
                dest: payload.endpoint.clone(),
            },
        )?);
    }
    tasks.push_back(Task::local(
        TaskType::RecoverTable,
        TaskSpec::RecoverTable {
            name: info.name.clone(),
            pid: info.pid,
            endpoint: payload.endpoint,
            offset_delta: payload.offset_delta,
            concurrency: payload.concurrency,
        },
    ));
    Ok(tasks)
}

impl Coordinator {
    pub(crate) fn create_make_snapshot_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
    ) -> Result<u64> {
        let payload = encode_payload(&ReplicaPayload {
            endpoint: String::new(),
            offset_delta: 0,
        })?;
        self.create_op(st, OpType::MakeSnapshotOp, name, pid, payload, None, 0)
    }

    pub(crate) fn create_add_replica_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        endpoint: &str,
    ) -> Result<u64> {
        let payload = encode_payload(&ReplicaPayload {
            endpoint: endpoint.to_string(),
            offset_delta: self.cfg.offset_delta,
        })?;
        self.create_op(st, OpType::AddReplicaOp, name, pid, payload, None, 0)
    }

    pub(crate) fn create_del_replica_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        endpoint: &str,
    ) -> Result<u64> {
        let payload = encode_payload(&ReplicaPayload {
            endpoint: endpoint.to_string(),
            offset_delta: 0,
        })?;
        self.create_op(st, OpType::DelReplicaOp, name, pid, payload, None, 0)
    }

    pub(crate) fn create_offline_replica_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        endpoint: &str,
        concurrency: u32,
    ) -> Result<u64> {
        let payload = encode_payload(&ReplicaPayload {
            endpoint: endpoint.to_string(),
            offset_delta: 0,
        })?;
        self.create_op(
            st,
            OpType::OfflineReplicaOp,
            name,
            pid,
            payload,
            None,
            concurrency,
        )
    }

    pub(crate) fn create_migrate_op(
        &self,
        st: &mut State,
        src: &str,
        name: &str,
        pid: u32,
        dest: &str,
    ) -> Result<u64> {
        let payload = encode_payload(&MigratePayload {
            src: src.to_string(),
            dest: dest.to_string(),
            offset_delta: self.cfg.offset_delta,
        })?;
        self.create_op(st, OpType::MigrateOp, name, pid, payload, None, 0)
    }

    /// Plan a leader change. Collects the alive healthy followers now so
    /// the workflow is pinned to a concrete candidate set. Returns `None`
    /// when the partition has no follower to promote.
    pub(crate) fn create_change_leader_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        candidate: Option<&str>,
        need_restore: bool,
        concurrency: u32,
    ) -> Result<Option<u64>> {
        let table = st.table(name)?;
        let partition = table.partition(pid).ok_or_else(|| Error::PartitionMissing {
            name: name.to_string(),
            pid,
        })?;
        let mut followers = Vec::new();
        for meta in &partition.partition_meta {
            if !meta.is_alive || meta.is_leader {
                continue;
            }
            if st.is_worker_healthy(&meta.endpoint) {
                followers.push(meta.endpoint.clone());
            } else {
                tracing::warn!(
                    "follower {} of {} pid[{}] is offline, skipped as candidate",
                    meta.endpoint,
                    name,
                    pid
                );
            }
        }
        if need_restore {
            if let Some(candidate) = candidate {
                if !followers.iter().any(|ep| ep == candidate) {
                    followers.push(candidate.to_string());
                }
            }
        }
        if followers.is_empty() {
            tracing::info!("no follower to promote for {} pid[{}]", name, pid);
            return Ok(None);
        }
        if let Some(candidate) = candidate {
            if !followers.iter().any(|ep| ep == candidate) {
                return Err(Error::InvalidArg(format!(
                    "candidate {} is not an alive follower of {} pid[{}]",
                    candidate, name, pid
                )));
            }
        }
        let payload = encode_payload(&ChangeLeaderData {
            tid: table.tid,
            followers,
            candidate: candidate.map(|ep| ep.to_string()),
            leader: None,
            offset: None,
            term: None,
        })?;
        let op_id = self.create_op(
            st,
            OpType::ChangeLeaderOp,
            name,
            pid,
            payload,
            None,
            concurrency,
        )?;
        Ok(Some(op_id))
    }

    pub(crate) fn create_recover_table_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        endpoint: &str,
        is_leader: bool,
        offset_delta: u64,
        concurrency: u32,
    ) -> Result<u64> {
        let payload = encode_payload(&RecoverPayload {
            endpoint: endpoint.to_string(),
            is_leader,
            offset_delta,
            concurrency,
        })?;
        self.create_op(
            st,
            OpType::RecoverTableOp,
            name,
            pid,
            payload,
            None,
            concurrency,
        )
    }

    /// The four re-add variants share one entry; the recover-table task
    /// picks the variant after probing the worker.
    pub(crate) fn create_re_add_replica_op(
        &self,
        st: &mut State,
        op_type: OpType,
        name: &str,
        pid: u32,
        endpoint: &str,
        offset_delta: u64,
        parent_id: u64,
        concurrency: u32,
    ) -> Result<u64> {
        let payload = encode_payload(&ReplicaPayload {
            endpoint: endpoint.to_string(),
            offset_delta,
        })?;
        self.create_op(st, op_type, name, pid, payload, Some(parent_id), concurrency)
    }

    pub(crate) fn create_re_load_table_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        endpoint: &str,
        parent_id: u64,
        concurrency: u32,
    ) -> Result<u64> {
        let payload = encode_payload(&ReplicaPayload {
            endpoint: endpoint.to_string(),
            offset_delta: 0,
        })?;
        self.create_op(
            st,
            OpType::ReLoadTableOp,
            name,
            pid,
            payload,
            Some(parent_id),
            concurrency,
        )
    }

    pub(crate) fn create_update_partition_status_op(
        &self,
        st: &mut State,
        name: &str,
        pid: u32,
        endpoint: &str,
        is_leader: bool,
        is_alive: bool,
        parent_id: Option<u64>,
        concurrency: u32,
    ) -> Result<u64> {
        let payload = encode_payload(&StatusPayload {
            endpoint: endpoint.to_string(),
            is_leader,
            is_alive,
        })?;
        self.create_op(
            st,
            OpType::UpdatePartitionStatusOp,
            name,
            pid,
            payload,
            parent_id,
            concurrency,
        )
    }
}
