//! Op engine
//!
//! Persistent, sharded queues of compound ops. An op is assigned a queue
//! by its partition id and runs its tasks strictly in order; queues are
//! concurrent with each other. The single driver loop schedules head
//! tasks onto the bounded worker pool, advances the durable progress
//! cursor and reaps finished ops. Everything is rebuilt from the store
//! on leader acquisition.

pub mod builders;
pub mod op;
pub mod runner;
pub mod task;

use crate::common::{Error, Result};
use crate::common::{timestamp_now, timestamp_now_millis};
use crate::coordinator::{Coordinator, State};
use crate::engine::op::{OpData, OpInfo, OpType};
use crate::engine::task::{TaskStatus, TaskType};
use crate::store::{paths, MetaStoreExt};
use std::sync::Arc;
use std::time::Duration;

impl Coordinator {
    fn alloc_op_id(&self, st: &mut State) -> Result<u64> {
        self.store.write_counter(paths::OP_INDEX, st.op_index + 1)?;
        st.op_index += 1;
        Ok(st.op_index)
    }

    /// Full op creation protocol: allocate the id, build the task list,
    /// persist the header, insert into the right queue and wake the
    /// driver. Any failure aborts without queueing.
    pub(crate) fn create_op(
        &self,
        st: &mut State,
        op_type: OpType,
        name: &str,
        pid: u32,
        data: Vec<u8>,
        parent_id: Option<u64>,
        concurrency: u32,
    ) -> Result<u64> {
        let op_id = self.alloc_op_id(st)?;
        let queue_count = st.queues.len() as u32;
        let mut vec_idx = pid % queue_count;
        if concurrency > 0 && concurrency < queue_count {
            vec_idx = pid % concurrency;
        }
        let info = OpInfo {
            op_id,
            op_type,
            name: name.to_string(),
            pid,
            parent_id,
            vec_idx,
            data,
            status: TaskStatus::Inited,
            task_index: 0,
            start_time: 0,
            end_time: 0,
        };
        let tasks = builders::build_task_list(st, &info)?;
        let op = Arc::new(OpData::new(info));
        *op.tasks.lock().unwrap() = tasks;
        self.store
            .create_record(&paths::op_node(op_id), &op.info())?;
        self.insert_op(st, op)?;
        self.trim_done_ops(st);
        self.notify.notify_one();
        tracing::info!(
            "created op {} op_id[{}] {} pid[{}]",
            op_type,
            op_id,
            name,
            pid
        );
        Ok(op_id)
    }

    /// A parentless op joins the tail of its queue; a child is placed
    /// right behind its parent so it can never overtake it.
    fn insert_op(&self, st: &mut State, op: Arc<OpData>) -> Result<()> {
        let info = op.info();
        let queue = &mut st.queues[info.vec_idx as usize];
        match info.parent_id {
            Some(parent_id) => match queue.iter().position(|o| o.op_id == parent_id) {
                Some(pos) => queue.insert(pos + 1, op),
                None => {
                    tracing::warn!(
                        "parent op {} not found in queue {}, dropping op {}",
                        parent_id,
                        info.vec_idx,
                        info.op_id
                    );
                    if let Err(e) = self.store.delete(&paths::op_node(info.op_id)) {
                        tracing::warn!("cleanup of op node {} failed: {}", info.op_id, e);
                    }
                    return Err(Error::OpAdd(format!(
                        "parent op {} not found for op {}",
                        parent_id, info.op_id
                    )));
                }
            },
            None => queue.push_back(op),
        }
        Ok(())
    }

    /// FIFO-trim the done list down to `max_op_num`. Failed entries still
    /// own their store node; it is deleted before the entry is dropped.
    pub(crate) fn trim_done_ops(&self, st: &mut State) {
        while st.done_ops.len() > self.cfg.max_op_num {
            let op = match st.done_ops.front() {
                Some(op) => op.clone(),
                None => break,
            };
            if op.status() == TaskStatus::Failed {
                if let Err(e) = self.store.delete(&paths::op_node(op.op_id)) {
                    tracing::warn!("delete op node {} failed: {}", op.op_id, e);
                    break;
                }
                op.tasks.lock().unwrap().clear();
            }
            tracing::info!(
                "done op list over {}, dropping op {}",
                self.cfg.max_op_num,
                op.op_id
            );
            st.done_ops.pop_front();
        }
    }

    pub(crate) fn find_running_op(st: &State, op_id: u64) -> Option<Arc<OpData>> {
        st.queues
            .iter()
            .flat_map(|queue| queue.iter())
            .find(|op| op.op_id == op_id)
            .cloned()
    }

    /// Cancel an in-queue op: the op and all its tasks flip to canceled
    /// and the reaper completes the removal. Terminal ops are rejected.
    pub(crate) fn cancel_queued_op(&self, op_id: u64) -> Result<OpType> {
        let st = self.lock_state();
        match Self::find_running_op(&st, op_id) {
            Some(op) => {
                op.set_status(TaskStatus::Canceled);
                for task in op.tasks.lock().unwrap().iter() {
                    task.tracker.set_status(TaskStatus::Canceled);
                }
                let op_type = op.info().op_type;
                tracing::info!("op {} op_id[{}] canceled", op_type, op_id);
                self.notify.notify_one();
                Ok(op_type)
            }
            None => Err(Error::OpMissing(op_id)),
        }
    }

    /// Driver loop. Scans all queues, then runs the store-status and
    /// reaper passes; parks on the notifier when nothing moved.
    pub(crate) async fn run_driver(self: Arc<Self>) {
        tracing::info!("op driver started");
        while self.is_running() {
            let scheduled = self.clone().schedule_ready_tasks();
            let advanced = self.store_status_pass();
            let reaped = self.reaper_pass().await;
            if !self.is_running() {
                break;
            }
            if !(scheduled || advanced || reaped) {
                let wait = Duration::from_millis(self.cfg.task_wait_time_ms);
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        tracing::info!("op driver stopped");
    }

    /// Inspect each queue head and submit runnable head tasks to the
    /// worker pool.
    pub(crate) fn schedule_ready_tasks(self: Arc<Self>) -> bool {
        let mut scheduled = false;
        let st = self.lock_state();
        for queue in &st.queues {
            let op = match queue.front() {
                Some(op) => op.clone(),
                None => continue,
            };
            let status = op.status();
            if status == TaskStatus::Failed || status == TaskStatus::Canceled {
                continue;
            }
            if op.task_count() == 0 {
                continue;
            }
            if status == TaskStatus::Inited {
                let reverted = {
                    let mut info = op.info.lock().unwrap();
                    info.start_time = timestamp_now();
                    info.status = TaskStatus::Doing;
                    let snapshot = info.clone();
                    drop(info);
                    if let Err(e) = self.store.save_record(&paths::op_node(op.op_id), &snapshot) {
                        tracing::warn!("persist op {} start failed: {}", op.op_id, e);
                        let mut info = op.info.lock().unwrap();
                        info.status = TaskStatus::Inited;
                        info.start_time = 0;
                        true
                    } else {
                        false
                    }
                };
                if reverted {
                    continue;
                }
            }
            let task = match op.head_task() {
                Some(task) => task,
                None => continue,
            };
            match task.status() {
                TaskStatus::Failed => {
                    tracing::warn!(
                        "task {} failed, op {} op_id[{}] terminates",
                        task.task_type,
                        op.info().op_type,
                        op.op_id
                    );
                }
                TaskStatus::Inited => {
                    tracing::debug!(
                        "run task {} of op op_id[{}]",
                        task.task_type,
                        op.op_id
                    );
                    task.tracker.set_status(TaskStatus::Doing);
                    let this = self.clone();
                    let op = op.clone();
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        let permit = match pool.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let notify_this = this.clone();
                        this.execute_task(op, task).await;
                        drop(permit);
                        notify_this.notify.notify_one();
                    });
                    scheduled = true;
                }
                TaskStatus::Doing => {
                    let info = op.info.lock().unwrap();
                    let elapsed = timestamp_now().saturating_sub(info.start_time);
                    if elapsed * 1000 > self.cfg.op_execute_timeout_ms {
                        tracing::warn!(
                            "op {} op_id[{}] still running task {} after {}s",
                            info.op_type,
                            info.op_id,
                            task.task_type,
                            elapsed
                        );
                    }
                }
                _ => {}
            }
        }
        scheduled
    }

    /// For each head op with a completed head task, advance the durable
    /// progress cursor; only a successful persist pops the task.
    pub(crate) fn store_status_pass(&self) -> bool {
        let mut advanced = false;
        let st = self.lock_state();
        for queue in &st.queues {
            let op = match queue.front() {
                Some(op) => op.clone(),
                None => continue,
            };
            let task = match op.head_task() {
                Some(task) => task,
                None => continue,
            };
            if task.status() != TaskStatus::Done {
                continue;
            }
            let snapshot = {
                let mut info = op.info.lock().unwrap();
                info.task_index += 1;
                info.clone()
            };
            if let Err(e) = self.store.save_record(&paths::op_node(op.op_id), &snapshot) {
                op.info.lock().unwrap().task_index -= 1;
                tracing::warn!(
                    "persist progress of op op_id[{}] task_index[{}] failed: {}",
                    op.op_id,
                    snapshot.task_index,
                    e
                );
                continue;
            }
            op.tasks.lock().unwrap().pop_front();
            advanced = true;
        }
        advanced
    }

    /// Move finished head ops out of the queues. Every healthy worker is
    /// told to forget the op ids first; any worker error retains the ops
    /// for the next cycle.
    pub(crate) async fn reaper_pass(&self) -> bool {
        let (done_ids, clients) = {
            let st = self.lock_state();
            let mut done_ids = Vec::new();
            for queue in &st.queues {
                let op = match queue.front() {
                    Some(op) => op,
                    None => continue,
                };
                if op.task_count() == 0 {
                    done_ids.push(op.op_id);
                } else if let Some(task) = op.head_task() {
                    if task.status() == TaskStatus::Failed || op.status() == TaskStatus::Canceled {
                        done_ids.push(op.op_id);
                    }
                }
            }
            if done_ids.is_empty() {
                return false;
            }
            let clients: Vec<_> = st
                .workers
                .iter()
                .filter(|(_, worker)| worker.is_healthy())
                .map(|(endpoint, worker)| (endpoint.clone(), worker.rpc.clone()))
                .collect();
            (done_ids, clients)
        };
        for (endpoint, rpc) in clients {
            if let Err(e) = rpc.delete_op_tasks(&done_ids).await {
                tracing::warn!("worker {} delete op tasks failed: {}", endpoint, e);
                return false;
            }
        }
        let mut st = self.lock_state();
        let mut reaped = false;
        for op_id in done_ids {
            let position = st.queues.iter().position(|queue| {
                queue
                    .front()
                    .map(|op| op.op_id == op_id)
                    .unwrap_or(false)
            });
            let queue_idx = match position {
                Some(idx) => idx,
                None => {
                    tracing::warn!("op {} no longer at a queue head", op_id);
                    continue;
                }
            };
            let op = match st.queues[queue_idx].front().cloned() {
                Some(op) => op,
                None => continue,
            };
            let head_failed = op
                .head_task()
                .map(|task| task.status() == TaskStatus::Failed)
                .unwrap_or(false);
            if head_failed {
                let snapshot = {
                    let mut info = op.info.lock().unwrap();
                    info.status = TaskStatus::Failed;
                    info.end_time = timestamp_now();
                    info.clone()
                };
                tracing::warn!("op {} op_id[{}] failed", snapshot.op_type, op_id);
                if let Err(e) = self.store.save_record(&paths::op_node(op_id), &snapshot) {
                    tracing::warn!("persist failed op {} failed: {}", op_id, e);
                }
            } else {
                if let Err(e) = self.store.delete(&paths::op_node(op_id)) {
                    tracing::warn!("delete op node {} failed: {}", op_id, e);
                    continue;
                }
                let final_status = {
                    let mut info = op.info.lock().unwrap();
                    info.end_time = timestamp_now();
                    if info.status == TaskStatus::Doing {
                        info.status = TaskStatus::Done;
                    }
                    info.status
                };
                if final_status == TaskStatus::Done {
                    op.tasks.lock().unwrap().clear();
                }
                tracing::info!("op op_id[{}] finished as {}", op_id, final_status);
            }
            st.done_ops.push_back(op);
            st.queues[queue_idx].pop_front();
            reaped = true;
        }
        self.trim_done_ops(&mut st);
        reaped
    }

    /// Progress poller loop; mirrors worker-side task state into the
    /// local queues.
    pub(crate) async fn run_task_status_poller(self: Arc<Self>) {
        tracing::info!("task status poller started");
        while self.is_running() {
            self.poll_task_status_once(false).await;
            tokio::time::sleep(Duration::from_millis(self.cfg.get_task_status_interval_ms)).await;
        }
        tracing::info!("task status poller stopped");
    }

    /// One polling pass. With `is_recover` even tasks that were never
    /// observed as sent are failed when the worker has no record of
    /// them, because the send may have happened before the restart.
    pub(crate) async fn poll_task_status_once(&self, is_recover: bool) {
        let last_version = self.current_task_rpc_version();
        let clients = {
            let st = self.lock_state();
            let now = timestamp_now_millis();
            for (endpoint, worker) in &st.workers {
                if worker.is_healthy() {
                    continue;
                }
                if now < worker.ctime_ms + self.cfg.heartbeat_timeout_ms {
                    continue;
                }
                // silence past the heartbeat timeout fails in-flight tasks
                for queue in &st.queues {
                    let op = match queue.front() {
                        Some(op) => op,
                        None => continue,
                    };
                    let task = match op.head_task() {
                        Some(task) => task,
                        None => continue,
                    };
                    if task.status() != TaskStatus::Doing {
                        continue;
                    }
                    if task.endpoint.as_deref() == Some(endpoint.as_str()) {
                        tracing::warn!(
                            "worker {} is offline, failing task {} of op op_id[{}]",
                            endpoint,
                            task.task_type,
                            op.op_id
                        );
                        task.tracker.fail();
                    }
                }
            }
            st.workers
                .iter()
                .filter(|(_, worker)| worker.is_healthy())
                .map(|(endpoint, worker)| (endpoint.clone(), worker.rpc.clone()))
                .collect::<Vec<_>>()
        };
        for (endpoint, rpc) in clients {
            let reports = match rpc.get_task_status().await {
                Ok(reports) => reports,
                Err(e) => {
                    tracing::debug!("get task status from {} failed: {}", endpoint, e);
                    continue;
                }
            };
            let st = self.lock_state();
            if last_version != self.current_task_rpc_version() {
                // queues changed under us, the snapshot premises are stale
                break;
            }
            for queue in &st.queues {
                let op = match queue.front() {
                    Some(op) => op,
                    None => continue,
                };
                let task = match op.head_task() {
                    Some(task) => task,
                    None => continue,
                };
                if task.status() != TaskStatus::Doing {
                    continue;
                }
                let report = reports
                    .iter()
                    .find(|r| r.op_id == op.op_id && r.task_type == task.task_type);
                match report {
                    Some(report) => {
                        if report.status != TaskStatus::Inited && task.status() != report.status {
                            tracing::info!(
                                "task {} of op op_id[{}] reported {} by {}",
                                task.task_type,
                                op.op_id,
                                report.status,
                                endpoint
                            );
                            task.tracker.set_status(report.status);
                        }
                    }
                    None => {
                        if (is_recover || task.tracker.rpc_sent())
                            && task.endpoint.as_deref() == Some(endpoint.as_str())
                        {
                            tracing::warn!(
                                "worker {} has no record of op op_id[{}] task {}, failing it",
                                endpoint,
                                op.op_id,
                                task.task_type
                            );
                            task.tracker.fail();
                        }
                    }
                }
            }
        }
        self.notify.notify_one();
    }

    /// Rebuild the queues from persisted op headers. Completed tasks are
    /// skipped via the durable progress cursor and each queue is sorted
    /// so children directly follow their parents.
    pub(crate) fn recover_ops(&self, st: &mut State) -> Result<()> {
        for queue in st.queues.iter_mut() {
            queue.clear();
        }
        st.done_ops.clear();
        let entries = self.store.children(paths::OP_DATA)?;
        tracing::info!("recovering {} ops", entries.len());
        for entry in entries {
            let op_id: u64 = match entry.parse() {
                Ok(op_id) => op_id,
                Err(_) => {
                    tracing::warn!("skipping malformed op node {}", entry);
                    continue;
                }
            };
            let info = match self.store.load_record::<OpInfo>(&paths::op_node(op_id))? {
                Some(info) => info,
                None => continue,
            };
            if info.status == TaskStatus::Done {
                continue;
            }
            let tasks = match builders::build_task_list(st, &info) {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!("recover op {} op_id[{}] failed: {}", info.op_type, op_id, e);
                    continue;
                }
            };
            let vec_idx = if (info.vec_idx as usize) < st.queues.len() {
                info.vec_idx as usize
            } else {
                (info.pid as usize) % st.queues.len()
            };
            let op = Arc::new(OpData::new(info));
            *op.tasks.lock().unwrap() = tasks;
            if !Self::skip_done_tasks(&op) {
                continue;
            }
            let status = op.status();
            tracing::info!(
                "recovered op {} op_id[{}] status {}",
                op.info().op_type,
                op_id,
                status
            );
            if status == TaskStatus::Failed || status == TaskStatus::Canceled {
                st.done_ops.push_back(op);
            } else {
                st.queues[vec_idx].push_back(op);
            }
        }
        for queue in st.queues.iter_mut() {
            let mut ops: Vec<_> = queue.drain(..).collect();
            ops.sort_by_key(|op| {
                let info = op.info.lock().unwrap();
                (info.parent_id, info.op_id)
            });
            queue.extend(ops);
        }
        Ok(())
    }

    /// Drop the completed prefix of a recovered op's task list and put
    /// the new head into the right resume state.
    fn skip_done_tasks(op: &OpData) -> bool {
        let info = op.info();
        if info.status == TaskStatus::Inited {
            return true;
        }
        let mut tasks = op.tasks.lock().unwrap();
        if tasks.is_empty() {
            tracing::warn!("op op_id[{}] has an empty task list", info.op_id);
            return false;
        }
        if info.task_index as usize > tasks.len() - 1 {
            tracing::warn!(
                "op op_id[{}] task_index[{}] out of range",
                info.op_id,
                info.task_index
            );
            return false;
        }
        for _ in 0..info.task_index {
            tasks.pop_front();
        }
        if let Some(head) = tasks.front() {
            if info.status == TaskStatus::Failed {
                head.tracker.fail();
                return true;
            }
            if head.task_type.reinit_on_recovery() {
                head.tracker.set_status(TaskStatus::Inited);
            } else {
                head.tracker.set_status(TaskStatus::Doing);
            }
        }
        true
    }

    /// Ops visible to status queries: everything queued plus the recent
    /// done list, oldest first.
    pub(crate) fn snapshot_ops(&self, name: Option<&str>, pid: Option<u32>) -> Vec<OpView> {
        let st = self.lock_state();
        let mut views: Vec<OpView> = Vec::new();
        let matches = |info: &OpInfo| {
            name.map(|n| info.name == n).unwrap_or(true)
                && pid.map(|p| info.pid == p).unwrap_or(true)
        };
        for op in st
            .done_ops
            .iter()
            .chain(st.queues.iter().flat_map(|queue| queue.iter()))
        {
            let info = op.info();
            if !matches(&info) {
                continue;
            }
            let task_type = if info.status == TaskStatus::Inited {
                None
            } else {
                op.head_task().map(|task| task.task_type)
            };
            views.push(OpView {
                op_id: info.op_id,
                op_type: info.op_type,
                name: info.name,
                pid: info.pid,
                status: info.status,
                task_type,
                start_time: info.start_time,
                end_time: info.end_time,
            });
        }
        views.sort_by_key(|view| view.op_id);
        views.dedup_by_key(|view| view.op_id);
        views
    }
}

/// Status-query projection of one op.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OpView {
    pub op_id: u64,
    pub op_type: OpType,
    pub name: String,
    pub pid: u32,
    pub status: TaskStatus,
    /// Current head task, `None` while the op has not started.
    pub task_type: Option<TaskType>,
    pub start_time: u64,
    pub end_time: u64,
}
