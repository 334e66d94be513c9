//! Worker registry
//!
//! Tracks live workers from the store's ephemeral `/nodes` children. A
//! worker that disappears is marked offline and confirmed after a grace
//! period; one that reappears triggers recovery unless the outage was
//! shorter than the heartbeat timeout. A registration value prefixed
//! `startup_` marks a fresh restart, which runs the offline flow first.

use crate::common::timestamp_now_millis;
use crate::coordinator::{Coordinator, State};
use crate::store::paths;
use crate::worker::WorkerRpc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Healthy,
    Offline,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Healthy => write!(f, "healthy"),
            WorkerState::Offline => write!(f, "offline"),
        }
    }
}

/// Registry entry for one worker node. The RPC stub lives exactly as
/// long as this entry.
pub struct Worker {
    pub endpoint: String,
    pub state: WorkerState,
    /// Time (ms) of the last state change.
    pub ctime_ms: u64,
    pub rpc: Arc<dyn WorkerRpc>,
}

impl Worker {
    pub fn is_healthy(&self) -> bool {
        self.state == WorkerState::Healthy
    }
}

/// Edges produced by a registry update, handled outside the state lock.
#[derive(Default)]
pub(crate) struct WorkerEvents {
    pub online: Vec<String>,
    pub offline_confirm: Vec<String>,
}

impl Coordinator {
    /// Store watch entry point: the children of `/nodes` changed.
    pub(crate) fn handle_nodes_changed(self: Arc<Self>, endpoints: Vec<String>) {
        let events = {
            let mut st = self.lock_state();
            self.update_workers(&mut st, &endpoints)
        };
        for endpoint in events.online {
            let this = self.clone();
            tokio::spawn(async move {
                this.on_worker_online(endpoint).await;
            });
        }
        for endpoint in events.offline_confirm {
            self.clone().schedule_offline_confirm(endpoint);
        }
    }

    /// Diff the reported children against the registry. New endpoints get
    /// a stub and start healthy; a failed stub init skips the endpoint.
    /// Known offline endpoints turning up again emit an online edge;
    /// healthy ones that vanished flip offline and get a delayed confirm.
    pub(crate) fn update_workers(&self, st: &mut State, endpoints: &[String]) -> WorkerEvents {
        let mut events = WorkerEvents::default();
        let now = timestamp_now_millis();
        for endpoint in endpoints {
            match st.workers.get_mut(endpoint) {
                None => {
                    let rpc = match self.connector.connect(endpoint) {
                        Ok(rpc) => rpc,
                        Err(e) => {
                            tracing::warn!("worker stub init failed for {}: {}", endpoint, e);
                            continue;
                        }
                    };
                    st.workers.insert(
                        endpoint.clone(),
                        Worker {
                            endpoint: endpoint.clone(),
                            state: WorkerState::Healthy,
                            ctime_ms: now,
                            rpc,
                        },
                    );
                    tracing::info!("registered worker {}", endpoint);
                }
                Some(worker) => {
                    if worker.state != WorkerState::Healthy {
                        worker.state = WorkerState::Healthy;
                        worker.ctime_ms = now;
                        tracing::info!("worker {} is back online", endpoint);
                        events.online.push(endpoint.clone());
                    }
                }
            }
        }
        for (endpoint, worker) in st.workers.iter_mut() {
            if endpoints.iter().any(|ep| ep == endpoint) {
                continue;
            }
            if worker.state != WorkerState::Healthy {
                continue;
            }
            worker.state = WorkerState::Offline;
            worker.ctime_ms = now;
            tracing::info!("worker {} went offline", endpoint);
            let newly_offline = st
                .offline_endpoint_map
                .insert(endpoint.clone(), now)
                .is_none();
            if newly_offline && self.is_running() {
                events.offline_confirm.push(endpoint.clone());
            }
        }
        events
    }

    /// Arm the delayed offline confirmation for an endpoint.
    pub(crate) fn schedule_offline_confirm(self: Arc<Self>, endpoint: String) {
        let delay = Duration::from_millis(self.cfg.offline_check_interval_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.on_worker_offline(endpoint, false).await;
        });
    }

    /// Confirmed-offline flow. Waits out the heartbeat timeout (re-checking
    /// the registry each round), then marks the worker's replicas dead and
    /// synthesizes failover ops when auto-failover is on. With
    /// `startup_flag` the wait is skipped: the worker told us it restarted.
    pub(crate) async fn on_worker_offline(self: Arc<Self>, endpoint: String, startup_flag: bool) {
        if !self.is_running() {
            tracing::warn!("not the active coordinator, ignoring offline of {}", endpoint);
            return;
        }
        loop {
            {
                let st = self.lock_state();
                let worker = match st.workers.get(&endpoint) {
                    Some(worker) => worker,
                    None => {
                        tracing::warn!("offline endpoint {} is not registered", endpoint);
                        return;
                    }
                };
                let offline_since = match st.offline_endpoint_map.get(&endpoint) {
                    Some(since) => *since,
                    None => {
                        tracing::warn!("endpoint {} is not in the offline map", endpoint);
                        return;
                    }
                };
                if !startup_flag && worker.is_healthy() {
                    tracing::info!("endpoint {} is healthy again, no offline flow", endpoint);
                    return;
                }
                if st.tables.is_empty() {
                    tracing::info!("no tables, nothing to fail over for {}", endpoint);
                    return;
                }
                let now = timestamp_now_millis();
                if startup_flag || now >= offline_since + self.cfg.heartbeat_timeout_ms {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.offline_check_interval_ms)).await;
            if !self.is_running() {
                return;
            }
        }
        if self.auto_failover() {
            tracing::info!("running offline flow for endpoint {}", endpoint);
            let mut st = self.lock_state();
            self.set_endpoint_replicas_alive(&mut st, &endpoint, false);
            self.offline_endpoint_internal(&mut st, &endpoint, self.cfg.task_concurrency);
        }
    }

    /// Online-edge flow. A `startup_`-flagged registration runs the
    /// offline flow first (the worker lost its state); an outage shorter
    /// than the heartbeat timeout is dropped as a flap.
    pub(crate) async fn on_worker_online(self: Arc<Self>, endpoint: String) {
        if !self.is_running() {
            tracing::warn!("not the active coordinator, ignoring online of {}", endpoint);
            return;
        }
        if !self.auto_failover() {
            self.lock_state().offline_endpoint_map.remove(&endpoint);
            return;
        }
        let value = match self.store.get(&paths::node_entry(&endpoint)) {
            Ok(Some(raw)) => String::from_utf8_lossy(&raw).into_owned(),
            _ => {
                tracing::warn!("registration value of {} unavailable", endpoint);
                self.lock_state().offline_endpoint_map.remove(&endpoint);
                return;
            }
        };
        let startup = value.starts_with(paths::STARTUP_PREFIX);
        {
            let mut st = self.lock_state();
            let offline_since = match st.offline_endpoint_map.get(&endpoint) {
                Some(since) => *since,
                None => {
                    tracing::warn!("endpoint {} was never confirmed offline, no recovery", endpoint);
                    return;
                }
            };
            if st.tables.is_empty() {
                st.offline_endpoint_map.remove(&endpoint);
                return;
            }
            if !startup {
                let now = timestamp_now_millis();
                if now < offline_since + self.cfg.heartbeat_timeout_ms {
                    tracing::info!(
                        "endpoint {} outage was shorter than the heartbeat timeout, no recovery",
                        endpoint
                    );
                    st.offline_endpoint_map.remove(&endpoint);
                    return;
                }
            }
        }
        if startup {
            tracing::info!("endpoint {} reports a fresh restart, failing it over first", endpoint);
            self.clone().on_worker_offline(endpoint.clone(), true).await;
        }
        tracing::info!("running recovery for endpoint {}", endpoint);
        let mut st = self.lock_state();
        self.recover_endpoint_internal(&mut st, &endpoint, false, self.cfg.task_concurrency);
        st.offline_endpoint_map.remove(&endpoint);
    }

    /// Rebuild the offline map from the registry after leader acquisition.
    /// Returns the endpoints whose confirmation must be re-armed.
    pub(crate) fn rebuild_offline_map(&self, st: &mut State) -> Vec<String> {
        st.offline_endpoint_map.clear();
        let mut confirm = Vec::new();
        for (endpoint, worker) in &st.workers {
            if !worker.is_healthy() {
                st.offline_endpoint_map
                    .insert(endpoint.clone(), worker.ctime_ms);
                confirm.push(endpoint.clone());
                tracing::info!("recovered offline endpoint {}", endpoint);
            }
        }
        confirm
    }
}
