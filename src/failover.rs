//! Failover controller
//!
//! Turns worker online/offline edges (and the manual endpoint RPCs) into
//! ops that restore the placement invariants: leaderless partitions get a
//! leader change, lost followers are taken offline, recovered endpoints
//! are re-added through whichever re-add variant their local state allows.

use crate::common::{Error, Result};
use crate::coordinator::{Coordinator, State};
use crate::engine::op::{OpData, OpType};
use crate::engine::task::{Task, TaskStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Marker endpoint: resolved to the currently-recorded leader endpoint
/// of the partition when the recover-table task starts.
pub const OFFLINE_LEADER_ENDPOINT: &str = "OFFLINE_LEADER_ENDPOINT";

impl Coordinator {
    /// Mark every replica of `endpoint` alive or dead in the catalog.
    pub(crate) fn set_endpoint_replicas_alive(
        &self,
        st: &mut State,
        endpoint: &str,
        is_alive: bool,
    ) {
        let tables: Vec<_> = st.tables.values().cloned().collect();
        for table in tables {
            if !table
                .table_partition
                .iter()
                .any(|p| p.partition_meta.iter().any(|m| m.endpoint == endpoint))
            {
                continue;
            }
            let mut updated = (*table).clone();
            for partition in updated.table_partition.iter_mut() {
                for meta in partition.partition_meta.iter_mut() {
                    if meta.endpoint == endpoint {
                        meta.is_alive = is_alive;
                    }
                }
            }
            if let Err(e) = self.persist_table(st, updated) {
                tracing::warn!(
                    "marking replicas of {} alive[{}] failed for table {}: {}",
                    endpoint,
                    is_alive,
                    table.name,
                    e
                );
            }
        }
    }

    /// Take every replica placed on `endpoint` out of service. Partitions
    /// led by the endpoint (or left leaderless) get a leader change;
    /// single-replica partitions are only marked dead.
    pub(crate) fn offline_endpoint_internal(
        &self,
        st: &mut State,
        endpoint: &str,
        concurrency: u32,
    ) {
        let tables: Vec<_> = st.tables.values().cloned().collect();
        for table in tables {
            for partition in &table.table_partition {
                let pid = partition.pid;
                if partition.partition_meta.len() == 1
                    && partition.partition_meta[0].endpoint == endpoint
                {
                    tracing::info!("table {} pid[{}] has no followers", table.name, pid);
                    if let Err(e) = self.create_update_partition_status_op(
                        st,
                        &table.name,
                        pid,
                        endpoint,
                        true,
                        false,
                        None,
                        concurrency,
                    ) {
                        tracing::warn!(
                            "offline status op for {} pid[{}] failed: {}",
                            table.name,
                            pid,
                            e
                        );
                    }
                    continue;
                }
                let alive_leader = partition
                    .partition_meta
                    .iter()
                    .find(|m| m.is_leader && m.is_alive)
                    .map(|m| m.endpoint.clone());
                let meta = match partition.partition_meta.iter().find(|m| m.endpoint == endpoint) {
                    Some(meta) => meta,
                    None => continue,
                };
                if meta.is_leader || alive_leader.is_none() {
                    if alive_leader.is_none() || alive_leader.as_deref() == Some(endpoint) {
                        tracing::info!("table {} pid[{}] needs a new leader", table.name, pid);
                        if let Err(e) = self.create_change_leader_op(
                            st,
                            &table.name,
                            pid,
                            None,
                            false,
                            concurrency,
                        ) {
                            tracing::warn!(
                                "leader change op for {} pid[{}] failed: {}",
                                table.name,
                                pid,
                                e
                            );
                        }
                    } else {
                        tracing::info!(
                            "table {} pid[{}] still has an alive leader, no change",
                            table.name,
                            pid
                        );
                    }
                } else if let Err(e) =
                    self.create_offline_replica_op(st, &table.name, pid, endpoint, concurrency)
                {
                    tracing::warn!(
                        "offline replica op for {} pid[{}] failed: {}",
                        table.name,
                        pid,
                        e
                    );
                }
            }
        }
    }

    /// Re-attach every dead replica of `endpoint`. With `need_restore` a
    /// formerly-leading replica is also handed leadership back, and the
    /// displaced leader is recovered in turn through the marker endpoint.
    pub(crate) fn recover_endpoint_internal(
        &self,
        st: &mut State,
        endpoint: &str,
        need_restore: bool,
        concurrency: u32,
    ) {
        let tables: Vec<_> = st.tables.values().cloned().collect();
        for table in tables {
            for partition in &table.table_partition {
                let pid = partition.pid;
                let meta = match partition.partition_meta.iter().find(|m| m.endpoint == endpoint) {
                    Some(meta) => meta,
                    None => continue,
                };
                if meta.is_alive && partition.partition_meta.len() > 1 {
                    tracing::info!(
                        "table {} pid[{}] replica at {} is alive, no recovery",
                        table.name,
                        pid,
                        endpoint
                    );
                    continue;
                }
                tracing::info!("recovering table {} pid[{}] at {}", table.name, pid, endpoint);
                let is_leader = meta.is_leader;
                let offset_delta = if need_restore { 0 } else { self.cfg.offset_delta };
                if let Err(e) = self.create_recover_table_op(
                    st,
                    &table.name,
                    pid,
                    endpoint,
                    is_leader,
                    offset_delta,
                    concurrency,
                ) {
                    tracing::warn!(
                        "recover table op for {} pid[{}] failed: {}",
                        table.name,
                        pid,
                        e
                    );
                    continue;
                }
                if need_restore && is_leader {
                    tracing::info!(
                        "restoring leadership of table {} pid[{}] to {}",
                        table.name,
                        pid,
                        endpoint
                    );
                    if let Err(e) = self.create_change_leader_op(
                        st,
                        &table.name,
                        pid,
                        Some(endpoint),
                        true,
                        concurrency,
                    ) {
                        tracing::warn!(
                            "restore leader op for {} pid[{}] failed: {}",
                            table.name,
                            pid,
                            e
                        );
                    }
                    if let Err(e) = self.create_recover_table_op(
                        st,
                        &table.name,
                        pid,
                        OFFLINE_LEADER_ENDPOINT,
                        true,
                        self.cfg.offset_delta,
                        concurrency,
                    ) {
                        tracing::warn!(
                            "displaced leader recovery op for {} pid[{}] failed: {}",
                            table.name,
                            pid,
                            e
                        );
                    }
                }
            }
        }
    }

    /// Body of the recover-table task. Probes the target worker's local
    /// replica state and dispatches the matching child op; every decision
    /// point leaves durable state so a coordinator restart resumes here.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_recover_table(
        &self,
        op: &Arc<OpData>,
        task: &Task,
        name: &str,
        pid: u32,
        endpoint: &str,
        offset_delta: u64,
        concurrency: u32,
    ) {
        if !self.is_running() {
            tracing::warn!("not the active coordinator, recover table aborted");
            return;
        }
        let tid;
        let target;
        let leader_endpoint;
        let has_follower;
        {
            let st = self.lock_state();
            let table = match st.tables.get(name) {
                Some(table) => table.clone(),
                None => {
                    tracing::warn!("table {} not found. op_id[{}]", name, op.op_id);
                    task.tracker.fail();
                    return;
                }
            };
            tid = table.tid;
            let partition = match table.partition(pid) {
                Some(partition) => partition,
                None => {
                    tracing::warn!("partition {} pid[{}] not found. op_id[{}]", name, pid, op.op_id);
                    task.tracker.fail();
                    return;
                }
            };
            let mut resolved = endpoint.to_string();
            let mut alive_leader = None;
            for meta in &partition.partition_meta {
                if meta.is_leader {
                    if meta.is_alive {
                        alive_leader = Some(meta.endpoint.clone());
                    } else if resolved == OFFLINE_LEADER_ENDPOINT {
                        tracing::info!(
                            "resolved offline leader marker to {} for {} pid[{}]",
                            meta.endpoint,
                            name,
                            pid
                        );
                        resolved = meta.endpoint.clone();
                    }
                }
            }
            let meta = match partition.partition_meta.iter().find(|m| m.endpoint == resolved) {
                Some(meta) => meta,
                None => {
                    tracing::warn!(
                        "no replica of {} pid[{}] at {}. op_id[{}]",
                        name,
                        pid,
                        resolved,
                        op.op_id
                    );
                    task.tracker.fail();
                    return;
                }
            };
            if meta.is_alive {
                tracing::info!(
                    "replica of {} pid[{}] at {} is alive, no recovery needed",
                    name,
                    pid,
                    resolved
                );
                task.tracker.set_status(TaskStatus::Done);
                return;
            }
            has_follower = partition.partition_meta.len() > 1;
            if has_follower {
                match &alive_leader {
                    Some(leader) if st.is_worker_healthy(leader) => {}
                    Some(leader) => {
                        tracing::warn!("leader {} is offline. op_id[{}]", leader, op.op_id);
                        task.tracker.fail();
                        return;
                    }
                    None => {
                        tracing::warn!(
                            "no alive leader for {} pid[{}]. op_id[{}]",
                            name,
                            pid,
                            op.op_id
                        );
                        task.tracker.fail();
                        return;
                    }
                }
            }
            if !st.is_worker_healthy(&resolved) {
                tracing::warn!("endpoint {} is offline. op_id[{}]", resolved, op.op_id);
                task.tracker.fail();
                return;
            }
            target = resolved;
            leader_endpoint = alive_leader;
        }
        let rpc = match self.worker_rpc(&target) {
            Ok(rpc) => rpc,
            Err(e) => {
                tracing::warn!("worker {} unavailable: {}. op_id[{}]", target, e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let pair = match rpc.get_term_pair(tid, pid).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("get term pair from {} failed: {}. op_id[{}]", target, e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        if !has_follower {
            let mut st = self.lock_state();
            let result = if pair.has_table {
                self.create_update_partition_status_op(
                    &mut st,
                    name,
                    pid,
                    &target,
                    true,
                    true,
                    Some(op.op_id),
                    concurrency,
                )
            } else {
                self.create_re_load_table_op(&mut st, name, pid, &target, op.op_id, concurrency)
            };
            match result {
                Ok(_) => task.tracker.set_status(TaskStatus::Done),
                Err(e) => {
                    tracing::warn!(
                        "single replica recovery of {} pid[{}] failed: {}. op_id[{}]",
                        name,
                        pid,
                        e,
                        op.op_id
                    );
                    task.tracker.fail();
                }
            }
            return;
        }
        if pair.has_table && pair.is_leader {
            if let Err(e) = rpc.change_role(tid, pid, false, &[], 0).await {
                tracing::warn!(
                    "demote {} for {} pid[{}] failed: {}. op_id[{}]",
                    target,
                    name,
                    pid,
                    e,
                    op.op_id
                );
                task.tracker.fail();
                return;
            }
            tracing::info!("demoted {} to follower for {} pid[{}]", target, name, pid);
        }
        if !pair.has_table {
            if let Err(e) = rpc.delete_binlog(tid, pid).await {
                tracing::warn!(
                    "delete binlog on {} for {} pid[{}] failed: {}. op_id[{}]",
                    target,
                    name,
                    pid,
                    e,
                    op.op_id
                );
                task.tracker.fail();
                return;
            }
            tracing::info!("deleted stale binlog on {} for {} pid[{}]", target, name, pid);
        }
        let matched = {
            let st = self.lock_state();
            match self.match_term_offset(&st, name, pid, pair.has_table, pair.term, pair.offset) {
                Ok(matched) => matched,
                Err(e) => {
                    tracing::warn!(
                        "term match for {} pid[{}] failed: {}. op_id[{}]",
                        name,
                        pid,
                        e,
                        op.op_id
                    );
                    task.tracker.fail();
                    return;
                }
            }
        };
        let leader = match leader_endpoint {
            Some(leader) => leader,
            None => {
                task.tracker.fail();
                return;
            }
        };
        let leader_rpc = match self.worker_rpc(&leader) {
            Ok(rpc) => rpc,
            Err(e) => {
                tracing::warn!("leader {} unavailable: {}. op_id[{}]", leader, e, op.op_id);
                task.tracker.fail();
                return;
            }
        };
        let manifest = match leader_rpc.get_manifest(tid, pid).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(
                    "get manifest from {} failed: {}. op_id[{}]",
                    leader,
                    e,
                    op.op_id
                );
                task.tracker.fail();
                return;
            }
        };
        let mut st = self.lock_state();
        tracing::info!(
            "recover decision for {} pid[{}]: worker offset {} manifest offset {} matched[{}] has_table[{}]",
            name,
            pid,
            pair.offset,
            manifest.offset,
            matched,
            pair.has_table
        );
        let caught_up = matched && pair.offset >= manifest.offset;
        let op_type = match (pair.has_table, caught_up) {
            (true, true) => OpType::ReAddReplicaSimplifyOp,
            (true, false) => OpType::ReAddReplicaWithDropOp,
            (false, true) => OpType::ReAddReplicaNoSendOp,
            (false, false) => OpType::ReAddReplicaOp,
        };
        match self.create_re_add_replica_op(
            &mut st,
            op_type,
            name,
            pid,
            &target,
            offset_delta,
            op.op_id,
            concurrency,
        ) {
            Ok(child) => {
                tracing::info!(
                    "dispatched {} op_id[{}] for {} pid[{}]",
                    op_type,
                    child,
                    name,
                    pid
                );
                task.tracker.set_status(TaskStatus::Done);
            }
            Err(e) => {
                tracing::warn!(
                    "dispatch of {} for {} pid[{}] failed: {}. op_id[{}]",
                    op_type,
                    name,
                    pid,
                    e,
                    op.op_id
                );
                task.tracker.fail();
            }
        }
    }

    /// Does the (term, offset) a worker reports fit this partition's
    /// recorded epoch history? A mismatch means the replica needs a fresh
    /// snapshot instead of binlog catch-up.
    pub(crate) fn match_term_offset(
        &self,
        st: &State,
        name: &str,
        pid: u32,
        has_table: bool,
        term: u64,
        offset: u64,
    ) -> Result<bool> {
        if !has_table && offset == 0 {
            tracing::info!("{} pid[{}] has no table and no offset", name, pid);
            return Ok(false);
        }
        let table = st.table(name)?;
        let partition = table.partition(pid).ok_or_else(|| Error::PartitionMissing {
            name: name.to_string(),
            pid,
        })?;
        let term_map: BTreeMap<u64, u64> = partition
            .term_offset
            .iter()
            .map(|pair| (pair.term, pair.offset))
            .collect();
        let start = match term_map.get(&term) {
            Some(start) => *start,
            None => {
                tracing::info!("term {} of {} pid[{}] is not recorded", term, name, pid);
                return Ok(false);
            }
        };
        if start > offset {
            // the replica stopped right before this epoch opened
            let caught_up = term_map
                .values()
                .next_back()
                .map(|last| *last == offset + 1)
                .unwrap_or(false);
            return Ok(caught_up);
        }
        match term_map.range((term + 1)..).next() {
            None => Ok(true),
            Some((_, next_start)) if *next_start <= offset => {
                tracing::info!(
                    "offset {} of {} pid[{}] runs past term {}",
                    offset,
                    name,
                    pid,
                    term
                );
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }
}
