//! Task primitives
//!
//! A task is one step of an op: a tagged record plus the parameters its
//! execution needs. Dispatch happens on the tag in the runner; there are
//! no per-task closures. Shared status lives in a `TaskTracker` so the
//! executing body, the driver and the progress poller all see one value.

use crate::worker::TableMeta;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Inited,
    Doing,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskStatus::Inited => "inited",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    MakeSnapshot,
    PauseSnapshot,
    SendSnapshot,
    LoadTable,
    AddReplica,
    RecoverSnapshot,
    DelReplica,
    DropTable,
    AddTableInfo,
    DelTableInfo,
    UpdateTableInfo,
    UpdatePartitionStatus,
    SelectLeader,
    ChangeLeader,
    UpdateLeaderInfo,
    CheckBinlogSyncProgress,
    RecoverTable,
}

impl TaskType {
    /// Local tasks complete inside the coordinator; all others delegate
    /// to a worker which tracks and reports them.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TaskType::AddTableInfo
                | TaskType::DelTableInfo
                | TaskType::UpdateTableInfo
                | TaskType::UpdatePartitionStatus
                | TaskType::SelectLeader
                | TaskType::ChangeLeader
                | TaskType::UpdateLeaderInfo
                | TaskType::CheckBinlogSyncProgress
                | TaskType::RecoverTable
        )
    }

    /// Idempotent local tasks are re-run from scratch after a coordinator
    /// restart; everything else resumes as in-flight.
    pub fn reinit_on_recovery(&self) -> bool {
        matches!(
            self,
            TaskType::SelectLeader
                | TaskType::UpdateLeaderInfo
                | TaskType::UpdatePartitionStatus
                | TaskType::UpdateTableInfo
                | TaskType::RecoverTable
                | TaskType::AddTableInfo
                | TaskType::CheckBinlogSyncProgress
        )
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Shared mutable state of one task.
#[derive(Debug)]
pub struct TaskTracker {
    status: Mutex<TaskStatus>,
    rpc_sent: AtomicBool,
}

impl TaskTracker {
    pub fn new(status: TaskStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            rpc_sent: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn fail(&self) {
        self.set_status(TaskStatus::Failed);
    }

    pub fn mark_rpc_sent(&self) {
        self.rpc_sent.store(true, Ordering::Release);
    }

    pub fn rpc_sent(&self) -> bool {
        self.rpc_sent.load(Ordering::Acquire)
    }
}

/// Parameters of one task, tagged by kind.
#[derive(Debug, Clone)]
pub enum TaskSpec {
    MakeSnapshot {
        endpoint: String,
        tid: u32,
        pid: u32,
    },
    PauseSnapshot {
        endpoint: String,
        tid: u32,
        pid: u32,
    },
    SendSnapshot {
        endpoint: String,
        tid: u32,
        pid: u32,
        dest: String,
    },
    RecoverSnapshot {
        endpoint: String,
        tid: u32,
        pid: u32,
    },
    LoadTable {
        endpoint: String,
        meta: TableMeta,
    },
    AddReplica {
        endpoint: String,
        tid: u32,
        pid: u32,
        dest: String,
    },
    DelReplica {
        endpoint: String,
        tid: u32,
        pid: u32,
        dest: String,
    },
    DropTable {
        endpoint: String,
        tid: u32,
        pid: u32,
    },
    AddTableInfo {
        name: String,
        pid: u32,
        endpoint: String,
    },
    DelTableInfo {
        name: String,
        pid: u32,
        endpoint: String,
    },
    UpdateTableInfo {
        name: String,
        pid: u32,
        src: String,
        dest: String,
    },
    UpdatePartitionStatus {
        name: String,
        pid: u32,
        endpoint: String,
        is_leader: bool,
        is_alive: bool,
    },
    SelectLeader {
        name: String,
        tid: u32,
        pid: u32,
        followers: Vec<String>,
    },
    ChangeLeader {
        name: String,
        pid: u32,
    },
    UpdateLeaderInfo {
        name: String,
        pid: u32,
    },
    CheckBinlogSyncProgress {
        name: String,
        pid: u32,
        follower: String,
        offset_delta: u64,
    },
    RecoverTable {
        name: String,
        pid: u32,
        endpoint: String,
        offset_delta: u64,
        concurrency: u32,
    },
}

/// One step of an op.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_type: TaskType,
    /// Target worker of an RPC task; local tasks carry none.
    pub endpoint: Option<String>,
    pub tracker: Arc<TaskTracker>,
    pub spec: TaskSpec,
}

impl Task {
    pub fn rpc(task_type: TaskType, endpoint: &str, spec: TaskSpec) -> Task {
        Task {
            task_type,
            endpoint: Some(endpoint.to_string()),
            tracker: TaskTracker::new(TaskStatus::Inited),
            spec,
        }
    }

    pub fn local(task_type: TaskType, spec: TaskSpec) -> Task {
        Task {
            task_type,
            endpoint: None,
            tracker: TaskTracker::new(TaskStatus::Inited),
            spec,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.tracker.status()
    }
}
