//! Zone federation
//!
//! A leader zone can register follower zones that replicate its catalog.
//! Only the two handshake calls are modeled: a leader registers a remote
//! cluster, and a coordinator accepts the follower role when the
//! incoming zone term is newer than its own.

use crate::api::{code, ApiError, ApiResult};
use crate::common::Result;
use crate::coordinator::Coordinator;
use crate::store::{paths, MetaStoreExt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coordinates of a remote coordinator cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAddress {
    /// Coordination store endpoints of the remote cluster.
    pub store_endpoints: String,
    /// Root path of the remote cluster on its store.
    pub path: String,
}

/// Outcome of a follower-role handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
}

/// Client of a remote coordinator cluster's leader.
#[async_trait]
pub trait RemoteCoordinator: Send + Sync {
    /// Number of tables the remote cluster currently holds.
    async fn table_count(&self) -> Result<usize>;

    /// Ask the remote cluster to become a follower of this zone.
    async fn make_replica_cluster(&self, zone_name: &str, zone_term: u64) -> Result<()>;
}

/// Creates clients for remote coordinator clusters.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, address: &ClusterAddress) -> Result<Arc<dyn RemoteCoordinator>>;
}

impl Coordinator {
    /// Register a remote cluster as a follower zone. The remote cluster
    /// must be empty; the descriptor is persisted before the handshake.
    pub async fn add_replica_cluster(&self, alias: &str, address: ClusterAddress) -> ApiResult<()> {
        if !self.is_running() || self.is_follower() {
            return Err(ApiError::new(code::NOT_LEADER, "coordinator is not leader"));
        }
        if address.store_endpoints.is_empty() {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                "remote store endpoints are empty",
            ));
        }
        {
            let st = self.lock_state();
            if st.replica_clusters.contains_key(alias) {
                return Err(ApiError::new(
                    code::INVALID_PARAMETER,
                    format!("cluster alias {} is already registered", alias),
                ));
            }
        }
        let connector = self
            .remote_connector
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                ApiError::new(code::INVALID_PARAMETER, "no remote cluster connector installed")
            })?;
        let remote = connector
            .connect(&address)
            .map_err(|e| ApiError::new(code::INVALID_PARAMETER, e.to_string()))?;
        let tables = remote
            .table_count()
            .await
            .map_err(|e| ApiError::new(code::INVALID_PARAMETER, e.to_string()))?;
        if tables > 0 {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                "remote cluster already has tables",
            ));
        }
        self.store
            .create_record(&paths::replica_cluster_node(alias), &address)
            .map_err(|e| ApiError::new(code::STORE_WRITE_FAILED, e.to_string()))?;
        let (zone_name, zone_term) = {
            let mut st = self.lock_state();
            st.replica_clusters
                .insert(alias.to_string(), address.clone());
            (st.zone.name.clone(), st.zone.term)
        };
        remote
            .make_replica_cluster(&zone_name, zone_term)
            .await
            .map_err(|e| ApiError::new(code::INVALID_PARAMETER, e.to_string()))?;
        tracing::info!("registered replica cluster {} at {}", alias, address.path);
        Ok(())
    }

    /// Accept the follower role for a leader zone. Requires the incoming
    /// zone term to be newer than the local one; an equal term means the
    /// handshake already happened.
    pub fn make_replica_cluster(&self, zone_name: &str, zone_term: u64) -> ApiResult<JoinOutcome> {
        if !self.is_running() || self.is_follower() {
            return Err(ApiError::new(code::NOT_LEADER, "coordinator is not leader"));
        }
        let mut st = self.lock_state();
        if zone_term < st.zone.term {
            return Err(ApiError::new(
                code::INVALID_PARAMETER,
                format!("zone term {} is older than local {}", zone_term, st.zone.term),
            ));
        }
        if zone_term == st.zone.term {
            return Ok(JoinOutcome::AlreadyJoined);
        }
        self.store
            .put(paths::CLUSTER_NAME, zone_name.as_bytes())
            .and_then(|_| self.store.write_counter(paths::CLUSTER_TERM, zone_term))
            .and_then(|_| self.store.write_flag(paths::CLUSTER_FOLLOWER, true))
            .map_err(|e| ApiError::new(code::STORE_WRITE_FAILED, e.to_string()))?;
        st.zone.name = zone_name.to_string();
        st.zone.term = zone_term;
        self.set_follower(true);
        tracing::info!("joined zone {} at term {} as follower", zone_name, zone_term);
        Ok(JoinOutcome::Joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaStoreExt;
    use crate::testutil::TestCluster;
    use std::sync::Mutex;

    struct ScriptedRemote {
        tables: usize,
        joins: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl RemoteCoordinator for ScriptedRemote {
        async fn table_count(&self) -> Result<usize> {
            Ok(self.tables)
        }

        async fn make_replica_cluster(&self, zone_name: &str, zone_term: u64) -> Result<()> {
            self.joins
                .lock()
                .unwrap()
                .push((zone_name.to_string(), zone_term));
            Ok(())
        }
    }

    struct ScriptedConnector {
        remote: Arc<ScriptedRemote>,
    }

    impl RemoteConnector for ScriptedConnector {
        fn connect(&self, _address: &ClusterAddress) -> Result<Arc<dyn RemoteCoordinator>> {
            Ok(self.remote.clone())
        }
    }

    #[tokio::test]
    async fn test_add_replica_cluster() {
        let tc = TestCluster::start(&["a:1"]).await;
        let remote = Arc::new(ScriptedRemote {
            tables: 0,
            joins: Mutex::new(Vec::new()),
        });
        tc.coordinator.set_remote_connector(Arc::new(ScriptedConnector {
            remote: remote.clone(),
        }));

        let address = ClusterAddress {
            store_endpoints: "remote:2181".to_string(),
            path: "/remote".to_string(),
        };
        tc.coordinator
            .add_replica_cluster("east", address.clone())
            .await
            .unwrap();
        // the handshake carried the local zone identity
        assert_eq!(
            remote.joins.lock().unwrap().as_slice(),
            &[("zone-a".to_string(), 1)]
        );
        // the descriptor is durable
        let stored: ClusterAddress = tc
            .store
            .load_record(&paths::replica_cluster_node("east"))
            .unwrap()
            .unwrap();
        assert_eq!(stored, address);
        // a duplicate alias is rejected
        let err = tc
            .coordinator
            .add_replica_cluster("east", address)
            .await
            .unwrap_err();
        assert_eq!(err.code, code::INVALID_PARAMETER);
    }

    #[tokio::test]
    async fn test_add_replica_cluster_requires_empty_remote() {
        let tc = TestCluster::start(&["a:1"]).await;
        let remote = Arc::new(ScriptedRemote {
            tables: 3,
            joins: Mutex::new(Vec::new()),
        });
        tc.coordinator.set_remote_connector(Arc::new(ScriptedConnector {
            remote,
        }));
        let err = tc
            .coordinator
            .add_replica_cluster(
                "east",
                ClusterAddress {
                    store_endpoints: "remote:2181".to_string(),
                    path: "/remote".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, code::INVALID_PARAMETER);
    }

    #[tokio::test]
    async fn test_make_replica_cluster_term_guard() {
        let tc = TestCluster::start(&["a:1"]).await;
        // local zone term starts at 1; an older handshake is refused
        let err = tc
            .coordinator
            .make_replica_cluster("west", 0)
            .unwrap_err();
        assert_eq!(err.code, code::INVALID_PARAMETER);
        // an equal term means the join already happened
        assert_eq!(
            tc.coordinator.make_replica_cluster("west", 1).unwrap(),
            JoinOutcome::AlreadyJoined
        );
        // a newer term flips this zone to follower
        assert_eq!(
            tc.coordinator.make_replica_cluster("west", 2).unwrap(),
            JoinOutcome::Joined
        );
        assert!(tc.coordinator.is_follower());
        assert_eq!(
            tc.store.read_flag(paths::CLUSTER_FOLLOWER).unwrap(),
            Some(true)
        );
        assert_eq!(
            tc.store.read_counter(paths::CLUSTER_TERM).unwrap(),
            Some(2)
        );
        // the mutating surface is gone in follower mode
        let err = tc.coordinator.show_table(None).unwrap_err();
        assert_eq!(err.code, code::NOT_LEADER);
        // so is the handshake itself
        let err = tc
            .coordinator
            .make_replica_cluster("west", 3)
            .unwrap_err();
        assert_eq!(err.code, code::NOT_LEADER);
    }
}
