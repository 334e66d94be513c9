//! Op records
//!
//! An op is a persisted compound workflow: a header stored on the
//! coordination store plus an in-memory ordered task list rebuilt from
//! the header on recovery.

use crate::engine::task::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    MakeSnapshotOp,
    AddReplicaOp,
    ReAddReplicaOp,
    ReAddReplicaWithDropOp,
    ReAddReplicaNoSendOp,
    ReAddReplicaSimplifyOp,
    DelReplicaOp,
    OfflineReplicaOp,
    ChangeLeaderOp,
    MigrateOp,
    ReLoadTableOp,
    UpdatePartitionStatusOp,
    RecoverTableOp,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Persisted op header. This is the whole durable footprint of an op;
/// the task list is deterministically rebuilt from `op_type` + `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInfo {
    pub op_id: u64,
    pub op_type: OpType,
    /// Target table name.
    pub name: String,
    /// Target partition.
    pub pid: u32,
    /// Child ops link to their parent and run right after it.
    pub parent_id: Option<u64>,
    /// Queue the op was assigned to.
    pub vec_idx: u32,
    /// Opaque serialized request payload.
    pub data: Vec<u8>,
    pub status: TaskStatus,
    /// Count of completed tasks; the durable progress cursor.
    pub task_index: u32,
    pub start_time: u64,
    pub end_time: u64,
}

/// An op in a queue: the header plus runtime task list.
#[derive(Debug)]
pub struct OpData {
    pub op_id: u64,
    pub info: Mutex<OpInfo>,
    pub tasks: Mutex<VecDeque<Task>>,
}

impl OpData {
    pub fn new(info: OpInfo) -> Self {
        Self {
            op_id: info.op_id,
            info: Mutex::new(info),
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn info(&self) -> OpInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.info.lock().unwrap().status
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.info.lock().unwrap().status = status;
    }

    /// Current head task, if any.
    pub fn head_task(&self) -> Option<Task> {
        self.tasks.lock().unwrap().front().cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Replace the in-memory payload. The change is made durable on the
    /// next header persist.
    pub fn set_data(&self, data: Vec<u8>) {
        self.info.lock().unwrap().data = data;
    }
}
