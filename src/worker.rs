//! Worker node RPC contract
//!
//! The coordinator drives remote workers through this trait. Wiring to a
//! concrete transport lives outside this crate; tests script the trait
//! directly. Stubs are owned by the worker registry and live exactly as
//! long as the registry entry.

use crate::catalog::{ColumnDesc, CompressMode, StorageMode, TtlSpec};
use crate::common::Result;
use crate::engine::task::{TaskStatus, TaskType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifies the op step an RPC belongs to, so the worker can track it
/// and report it back through `get_task_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub op_id: u64,
    pub task_type: TaskType,
}

/// Replica role requested when creating or loading a table on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaMode {
    Leader,
    Follower,
}

/// Per-worker table creation / load request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub tid: u32,
    pub pid: u32,
    pub mode: ReplicaMode,
    pub term: u64,
    pub ttl: TtlSpec,
    pub seg_cnt: u32,
    pub storage: StorageMode,
    pub compress: CompressMode,
    pub key_entry_max_height: Option<u32>,
    pub columns: Vec<ColumnDesc>,
    /// Replication set handed to a leader replica; empty for followers.
    pub followers: Vec<String>,
}

/// Replication epoch state of a replica as reported by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermPair {
    pub has_table: bool,
    pub is_leader: bool,
    pub term: u64,
    pub offset: u64,
}

/// Snapshot manifest of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub offset: u64,
}

/// One op-task entry of a worker's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub op_id: u64,
    pub task_type: TaskType,
    pub status: TaskStatus,
}

/// Per-replica counters reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatusReport {
    pub tid: u32,
    pub pid: u32,
    pub is_leader: bool,
    pub offset: u64,
    pub record_cnt: u64,
    pub record_byte_size: u64,
}

/// RPC surface of a worker node.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Create a fresh replica with the given role.
    async fn create_table(&self, meta: &TableMeta) -> Result<()>;

    /// Drop the local replica of (tid, pid).
    async fn drop_table(&self, tid: u32, pid: u32, task: TaskRef) -> Result<()>;

    /// Trigger a snapshot of the local replica.
    async fn make_snapshot(&self, tid: u32, pid: u32, task: TaskRef) -> Result<()>;

    /// Stop snapshot IO on the leader replica.
    async fn pause_snapshot(&self, tid: u32, pid: u32, task: TaskRef) -> Result<()>;

    /// Resume snapshot IO on the leader replica.
    async fn recover_snapshot(&self, tid: u32, pid: u32, task: TaskRef) -> Result<()>;

    /// Copy the current snapshot to another worker.
    async fn send_snapshot(&self, tid: u32, pid: u32, dest: &str, task: TaskRef) -> Result<()>;

    /// Create a local replica and load data from the received snapshot.
    async fn load_table(&self, meta: &TableMeta, task: TaskRef) -> Result<()>;

    /// Register `dest` in the leader's replication set.
    async fn add_replica(&self, tid: u32, pid: u32, dest: &str, task: TaskRef) -> Result<()>;

    /// Remove `dest` from the leader's replication set.
    async fn del_replica(&self, tid: u32, pid: u32, dest: &str, task: TaskRef) -> Result<()>;

    /// Detach the replica from any leader for the given term and report
    /// its last applied offset.
    async fn follow_of_no_one(&self, tid: u32, pid: u32, term: u64) -> Result<u64>;

    /// Switch replica role; leaders get the follower set and the term.
    async fn change_role(
        &self,
        tid: u32,
        pid: u32,
        leader: bool,
        followers: &[String],
        term: u64,
    ) -> Result<()>;

    /// Report replication epoch state of (tid, pid).
    async fn get_term_pair(&self, tid: u32, pid: u32) -> Result<TermPair>;

    /// Drop the local binlog of (tid, pid).
    async fn delete_binlog(&self, tid: u32, pid: u32) -> Result<()>;

    /// Report the snapshot manifest of (tid, pid).
    async fn get_manifest(&self, tid: u32, pid: u32) -> Result<Manifest>;

    /// Report all op tasks the worker currently tracks.
    async fn get_task_status(&self) -> Result<Vec<TaskStatusReport>>;

    /// Forget finished op tasks.
    async fn delete_op_tasks(&self, op_ids: &[u64]) -> Result<()>;

    /// Apply a new ttl to the local replica.
    async fn update_ttl(
        &self,
        tid: u32,
        pid: u32,
        ttl: TtlSpec,
        ts_name: Option<&str>,
    ) -> Result<()>;

    /// Append a column to the local replica's schema.
    async fn add_table_field(&self, tid: u32, pid: u32, column: &ColumnDesc) -> Result<()>;

    /// Report per-replica counters for every replica the worker holds.
    async fn get_table_status(&self) -> Result<Vec<TableStatusReport>>;
}

/// Creates RPC stubs for newly registered workers. A failed init skips
/// the registration.
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn WorkerRpc>>;
}
