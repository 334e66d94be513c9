//! Task execution bodies
//!
//! RPC tasks issue their call, flag the send and leave the rest to the
//! worker plus the progress poller. Local tasks mutate the catalog (or
//! probe workers) and set their own terminal status. No task body holds
//! the state lock across an RPC.

use crate::common::Result;
use crate::coordinator::Coordinator;
use crate::engine::builders::{decode_payload, encode_payload, ChangeLeaderData};
use crate::engine::op::OpData;
use crate::engine::task::{Task, TaskSpec, TaskStatus};
use crate::store::{paths, MetaStoreExt};
use crate::worker::{TaskRef, WorkerRpc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

impl Coordinator {
    /// Entry point for every scheduled task.
    pub(crate) async fn execute_task(self: Arc<Self>, op: Arc<OpData>, task: Task) {
        match task.spec.clone() {
            TaskSpec::AddTableInfo {
                name,
                pid,
                endpoint,
            } => self.run_add_table_info(&task, &name, pid, &endpoint),
            TaskSpec::DelTableInfo {
                name,
                pid,
                endpoint,
            } => self.run_del_table_info(&task, &name, pid, &endpoint),
            TaskSpec::UpdateTableInfo {
                name,
                pid,
                src,
                dest,
            } => self.run_update_table_info(&task, &name, pid, &src, &dest),
            TaskSpec::UpdatePartitionStatus {
                name,
                pid,
                endpoint,
                is_leader,
                is_alive,
            } => self.run_update_partition_status(&task, &name, pid, &endpoint, is_leader, is_alive),
            TaskSpec::SelectLeader {
                name,
                tid,
                pid,
                followers,
            } => self.run_select_leader(&op, &task, &name, tid, pid, followers).await,
            TaskSpec::ChangeLeader { name, pid } => {
                self.run_change_leader(&op, &task, &name, pid).await
            }
            TaskSpec::UpdateLeaderInfo { name, pid } => {
                self.run_update_leader_info(&op, &task, &name, pid)
            }
            TaskSpec::CheckBinlogSyncProgress {
                name,
                pid,
                follower,
                offset_delta,
            } => self.run_check_binlog_sync(&op, &task, &name, pid, &follower, offset_delta),
            TaskSpec::RecoverTable {
                name,
                pid,
                endpoint,
                offset_delta,
                concurrency,
            } => {
                self.run_recover_table(&op, &task, &name, pid, &endpoint, offset_delta, concurrency)
                    .await
            }
            _ => self.run_rpc_task(&op, &task).await,
        }
    }

    pub(crate) fn worker_rpc(&self, endpoint: &str) -> Result<Arc<dyn WorkerRpc>> {
        self.lock_state().healthy_worker(endpoint)
    }

    /// Issue the worker call of an RPC task. A transport failure fails
    /// the task; success leaves it in-flight until the worker reports a
    /// terminal status. Either way the send is flagged so the poller can
    /// tell "never sent" from "sent and lost".
    async fn run_rpc_task(&self, op: &OpData, task: &Task) {
        if let Err(e) = self.dispatch_rpc(op.op_id, task).await {
            tracing::warn!(
                "task {} of op op_id[{}] failed: {}",
                task.task_type,
                op.op_id,
                e
            );
            task.tracker.fail();
        }
        self.bump_task_rpc_version();
        task.tracker.mark_rpc_sent();
    }

    async fn dispatch_rpc(&self, op_id: u64, task: &Task) -> Result<()> {
        let task_ref = TaskRef {
            op_id,
            task_type: task.task_type,
        };
        match &task.spec {
            TaskSpec::MakeSnapshot { endpoint, tid, pid } => {
                self.worker_rpc(endpoint)?
                    .make_snapshot(*tid, *pid, task_ref)
                    .await
            }
            TaskSpec::PauseSnapshot { endpoint, tid, pid } => {
                self.worker_rpc(endpoint)?
                    .pause_snapshot(*tid, *pid, task_ref)
                    .await
            }
            TaskSpec::RecoverSnapshot { endpoint, tid, pid } => {
                self.worker_rpc(endpoint)?
                    .recover_snapshot(*tid, *pid, task_ref)
                    .await
            }
            TaskSpec::SendSnapshot {
                endpoint,
                tid,
                pid,
                dest,
            } => {
                self.worker_rpc(endpoint)?
                    .send_snapshot(*tid, *pid, dest, task_ref)
                    .await
            }
            TaskSpec::LoadTable { endpoint, meta } => {
                self.worker_rpc(endpoint)?.load_table(meta, task_ref).await
            }
            TaskSpec::AddReplica {
                endpoint,
                tid,
                pid,
                dest,
            } => {
                self.worker_rpc(endpoint)?
                    .add_replica(*tid, *pid, dest, task_ref)
                    .await
            }
            TaskSpec::DelReplica {
                endpoint,
                tid,
                pid,
                dest,
            } => {
                self.worker_rpc(endpoint)?
                    .del_replica(*tid, *pid, dest, task_ref)
                    .await
            }
            TaskSpec::DropTable { endpoint, tid, pid } => {
                self.worker_rpc(endpoint)?
                    .drop_table(*tid, *pid, task_ref)
                    .await
            }
            spec => Err(crate::Error::Other(format!(
                "task spec {:?} is not an rpc task",
                spec
            ))),
        }
    }

    fn run_add_table_info(&self, task: &Task, name: &str, pid: u32, endpoint: &str) {
        let mut st = self.lock_state();
        let result = st
            .table(name)
            .and_then(|table| table.with_added_replica(pid, endpoint))
            .and_then(|table| self.persist_table(&mut st, table));
        match result {
            Ok(()) => {
                tracing::info!("added replica meta {} to {} pid[{}]", endpoint, name, pid);
                task.tracker.set_status(TaskStatus::Done);
            }
            Err(e) => {
                tracing::warn!(
                    "add replica meta {} to {} pid[{}] failed: {}",
                    endpoint,
                    name,
                    pid,
                    e
                );
                task.tracker.fail();
            }
        }
    }

    fn run_del_table_info(&self, task: &Task, name: &str, pid: u32, endpoint: &str) {
        if !self.is_running() {
            return;
        }
        let mut st = self.lock_state();
        let result = st
            .table(name)
            .and_then(|table| table.with_removed_replica(pid, endpoint))
            .and_then(|table| self.persist_table(&mut st, table));
        match result {
            Ok(()) => {
                tracing::info!("removed replica meta {} of {} pid[{}]", endpoint, name, pid);
                task.tracker.set_status(TaskStatus::Done);
            }
            Err(e) => {
                tracing::warn!(
                    "remove replica meta {} of {} pid[{}] failed: {}",
                    endpoint,
                    name,
                    pid,
                    e
                );
                task.tracker.fail();
            }
        }
    }

    fn run_update_table_info(&self, task: &Task, name: &str, pid: u32, src: &str, dest: &str) {
        let mut st = self.lock_state();
        let result = st.table(name).and_then(|table| {
            // the dest meta may already exist, then the src meta is dropped;
            // otherwise the src meta is rewritten in place
            let updated = if table.meta_of(pid, dest).is_some() {
                table
                    .with_replica_status(pid, dest, false, true)
                    .and_then(|t| t.with_removed_replica(pid, src))?
            } else {
                table.with_replica_endpoint(pid, src, dest)?
            };
            self.persist_table(&mut st, updated)
        });
        match result {
            Ok(()) => {
                tracing::info!(
                    "moved replica meta of {} pid[{}] from {} to {}",
                    name,
                    pid,
                    src,
                    dest
                );
                task.tracker.set_status(TaskStatus::Done);
            }
            Err(e) => {
                tracing::warn!(
                    "move replica meta of {} pid[{}] from {} to {} failed: {}",
                    name,
                    pid,
                    src,
                    dest,
                    e
                );
                task.tracker.fail();
            }
        }
    }

    fn run_update_partition_status(
        &self,
        task: &Task,
        name: &str,
        pid: u32,
        endpoint: &str,
        is_leader: bool,
        is_alive: bool,
    ) {
        if !self.is_running() {
            return;
        }
        let mut st = self.lock_state();
        let result = st
            .table(name)
            .and_then(|table| table.with_replica_status(pid, endpoint, is_leader, is_alive))
            .and_then(|table| self.persist_table(&mut st, table));
        match result {
            Ok(()) => {
                tracing::info!(
                    "partition status of {} pid[{}] at {} set leader[{}] alive[{}]",
                    name,
                    pid,
                    endpoint,
                    is_leader,
                    is_alive
                );
                task.tracker.set_status(TaskStatus::Done);
            }
            Err(e) => {
                tracing::warn!(
                    "partition status update of {} pid[{}] at {} failed: {}",
                    name,
                    pid,
                    endpoint,
                    e
                );
                task.tracker.fail();
            }
        }
    }

    /// Pick the new leader among the candidate followers: allocate a new
    /// term, detach every candidate from its old leader and take the one
    /// with the highest applied offset.
    async fn run_select_leader(
        &self,
        op: &Arc<OpData>,
        task: &Task,
        name: &str,
        tid: u32,
        pid: u32,
        followers: Vec<String>,
    ) {
        let cur_term;
        {
            let mut st = self.lock_state();
            if self.auto_failover() {
                match st.tables.get(name) {
                    Some(table) => {
                        if table.leader_of(pid).is_some() {
                            tracing::warn!(
                                "leader of {} pid[{}] is alive, no leader change needed",
                                name,
                                pid
                            );
                            task.tracker.fail();
                            return;
                        }
                    }
                    None => {
                        tracing::warn!("table {} not found. op_id[{}]", name, op.op_id);
                        task.tracker.fail();
                        return;
                    }
                }
            }
            if let Err(e) = self.store.write_counter(paths::TERM, st.term + 2) {
                tracing::warn!("bump term node failed: {}", e);
                task.tracker.fail();
                return;
            }
            st.term += 2;
            cur_term = st.term - 1;
        }
        let mut max_offset = 0u64;
        let mut candidates: Vec<String> = Vec::new();
        for endpoint in &followers {
            let rpc = match self.worker_rpc(endpoint) {
                Ok(rpc) => rpc,
                Err(e) => {
                    tracing::warn!("candidate {} unavailable: {}. op_id[{}]", endpoint, e, op.op_id);
                    task.tracker.fail();
                    return;
                }
            };
            let offset = match rpc.follow_of_no_one(tid, pid, cur_term).await {
                Ok(offset) => offset,
                Err(e) => {
                    tracing::warn!(
                        "follow_of_no_one on {} failed: {}. op_id[{}]",
                        endpoint,
                        e,
                        op.op_id
                    );
                    task.tracker.fail();
                    return;
                }
            };
            tracing::info!(
                "candidate {} of {} pid[{}] reports offset {} for term {}",
                endpoint,
                name,
                pid,
                offset,
                cur_term
            );
            if offset > max_offset || candidates.is_empty() {
                max_offset = offset;
                candidates.clear();
                candidates.push(endpoint.clone());
            } else if offset == max_offset {
                candidates.push(endpoint.clone());
            }
        }
        let mut payload: ChangeLeaderData = match decode_payload(&op.info().data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("decode leader change payload failed: {}. op_id[{}]", e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let leader = match &payload.candidate {
            Some(candidate) => {
                if candidates.iter().any(|ep| ep == candidate) {
                    candidate.clone()
                } else {
                    tracing::warn!(
                        "candidate {} is not among the max offset followers. op_id[{}]",
                        candidate,
                        op.op_id
                    );
                    task.tracker.fail();
                    return;
                }
            }
            None => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates[idx].clone()
            }
        };
        payload.leader = Some(leader.clone());
        payload.offset = Some(max_offset);
        payload.term = Some(cur_term + 1);
        match encode_payload(&payload) {
            Ok(raw) => op.set_data(raw),
            Err(e) => {
                tracing::warn!("encode leader change payload failed: {}. op_id[{}]", e, op.op_id);
                task.tracker.fail();
                return;
            }
        }
        tracing::info!(
            "selected {} as new leader of {} pid[{}] at offset {}",
            leader,
            name,
            pid,
            max_offset
        );
        task.tracker.set_status(TaskStatus::Done);
    }

    /// Promote the selected leader on its worker.
    async fn run_change_leader(&self, op: &Arc<OpData>, task: &Task, name: &str, pid: u32) {
        let payload: ChangeLeaderData = match decode_payload(&op.info().data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("decode leader change payload failed: {}. op_id[{}]", e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let (leader, term) = match (&payload.leader, payload.term) {
            (Some(leader), Some(term)) => (leader.clone(), term),
            _ => {
                tracing::warn!("leader change payload incomplete. op_id[{}]", op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let followers: Vec<String> = payload
            .followers
            .iter()
            .filter(|ep| **ep != leader)
            .cloned()
            .collect();
        let rpc = match self.worker_rpc(&leader) {
            Ok(rpc) => rpc,
            Err(e) => {
                tracing::warn!("new leader {} unavailable: {}. op_id[{}]", leader, e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        if let Err(e) = rpc
            .change_role(payload.tid, pid, true, &followers, term)
            .await
        {
            tracing::warn!(
                "change role of {} pid[{}] on {} failed: {}. op_id[{}]",
                name,
                pid,
                leader,
                e,
                op.op_id
            );
            task.tracker.fail();
            return;
        }
        tracing::info!(
            "promoted {} to leader of {} pid[{}] term {}",
            leader,
            name,
            pid,
            term
        );
        task.tracker.set_status(TaskStatus::Done);
    }

    /// Record the leadership change in the catalog: demote the old alive
    /// leader, mark the new one leader and alive, and append the epoch.
    fn run_update_leader_info(&self, op: &Arc<OpData>, task: &Task, name: &str, pid: u32) {
        let payload: ChangeLeaderData = match decode_payload(&op.info().data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("decode leader change payload failed: {}. op_id[{}]", e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let (leader, term, offset) = match (&payload.leader, payload.term, payload.offset) {
            (Some(leader), Some(term), Some(offset)) => (leader.clone(), term, offset),
            _ => {
                tracing::warn!("leader change payload incomplete. op_id[{}]", op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let mut st = self.lock_state();
        let result = st.table(name).and_then(|table| {
            let mut updated = (*table).clone();
            let partition = updated
                .table_partition
                .iter_mut()
                .find(|p| p.pid == pid)
                .ok_or_else(|| crate::Error::PartitionMissing {
                    name: name.to_string(),
                    pid,
                })?;
            let mut found_new = false;
            for meta in partition.partition_meta.iter_mut() {
                if meta.is_leader && meta.is_alive && meta.endpoint != leader {
                    meta.is_alive = false;
                } else if meta.endpoint == leader {
                    meta.is_leader = true;
                    meta.is_alive = true;
                    found_new = true;
                }
            }
            if !found_new {
                return Err(crate::Error::InvalidArg(format!(
                    "new leader {} has no meta in {} pid[{}]",
                    leader, name, pid
                )));
            }
            updated = updated.with_term_offset(pid, term, offset + 1)?;
            self.persist_table(&mut st, updated)
        });
        match result {
            Ok(()) => {
                tracing::info!("leader of {} pid[{}] is now {}", name, pid, leader);
                task.tracker.set_status(TaskStatus::Done);
            }
            Err(e) => {
                tracing::warn!(
                    "record leader change of {} pid[{}] failed: {}. op_id[{}]",
                    name,
                    pid,
                    e,
                    op.op_id
                );
                task.tracker.fail();
            }
        }
    }

    /// Completes once the follower has caught up with the leader within
    /// `offset_delta`, rescheduling itself until then. A follower whose
    /// worker no longer holds the partition completes immediately.
    fn run_check_binlog_sync(
        self: Arc<Self>,
        op: &Arc<OpData>,
        task: &Task,
        name: &str,
        pid: u32,
        follower: &str,
        offset_delta: u64,
    ) {
        {
            let st = self.lock_state();
            if task.tracker.status() != TaskStatus::Doing {
                tracing::warn!(
                    "binlog sync check is {}, aborting. op_id[{}]",
                    task.tracker.status(),
                    op.op_id
                );
                return;
            }
            let table = match st.tables.get(name) {
                Some(table) => table.clone(),
                None => {
                    tracing::warn!("table {} not found. op_id[{}]", name, op.op_id);
                    task.tracker.fail();
                    return;
                }
            };
            let partition = match table.partition(pid) {
                Some(partition) => partition,
                None => {
                    tracing::warn!("partition {} pid[{}] not found. op_id[{}]", name, pid, op.op_id);
                    task.tracker.fail();
                    return;
                }
            };
            if let Some(meta) = partition.partition_meta.iter().find(|m| m.endpoint == follower) {
                if !meta.tablet_has_partition {
                    tracing::warn!(
                        "worker {} no longer holds {} pid[{}], completing sync check. op_id[{}]",
                        follower,
                        name,
                        pid,
                        op.op_id
                    );
                    task.tracker.set_status(TaskStatus::Done);
                    return;
                }
            }
            let mut leader_offset = 0u64;
            let mut follower_offset = 0u64;
            for meta in &partition.partition_meta {
                let offset = match meta.offset {
                    Some(offset) => offset,
                    None => continue,
                };
                if meta.is_leader && meta.is_alive {
                    leader_offset = offset;
                } else if meta.endpoint == follower {
                    follower_offset = offset;
                }
            }
            if leader_offset <= follower_offset + offset_delta {
                tracing::info!(
                    "follower {} of {} pid[{}] caught up, leader[{}] follower[{}]",
                    follower,
                    name,
                    pid,
                    leader_offset,
                    follower_offset
                );
                task.tracker.set_status(TaskStatus::Done);
                return;
            }
            tracing::info!(
                "follower {} of {} pid[{}] still behind, leader[{}] follower[{}] delta[{}]",
                follower,
                name,
                pid,
                leader_offset,
                follower_offset,
                offset_delta
            );
        }
        if !self.is_running() {
            return;
        }
        let this = self.clone();
        let op = op.clone();
        let task = task.clone();
        let interval = Duration::from_millis(self.cfg.get_table_status_interval_ms);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if !this.is_running() {
                return;
            }
            this.clone().execute_task(op, task).await;
            this.notify.notify_one();
        });
    }
}
