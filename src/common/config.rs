//! Configuration for the coordinator

use serde::{Deserialize, Serialize};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Zone name of this coordinator cluster
    #[serde(default)]
    pub zone_name: String,

    /// Number of parallel op queues
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Size of the task worker pool
    #[serde(default = "default_task_pool_size")]
    pub task_pool_size: usize,

    /// Driver wait time when no queue has work (ms)
    #[serde(default = "default_task_wait_time")]
    pub task_wait_time_ms: u64,

    /// Warn when an op has been running longer than this (ms)
    #[serde(default = "default_op_execute_timeout")]
    pub op_execute_timeout_ms: u64,

    /// Interval between worker task status polls (ms)
    #[serde(default = "default_get_task_status_interval")]
    pub get_task_status_interval_ms: u64,

    /// Interval between worker table status polls (ms)
    #[serde(default = "default_get_table_status_interval")]
    pub get_table_status_interval_ms: u64,

    /// Delay before a disappeared worker is checked for confirmed offline (ms)
    #[serde(default = "default_offline_check_interval")]
    pub offline_check_interval_ms: u64,

    /// Worker silence longer than this converts to failure (ms)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Retained done-op history bound
    #[serde(default = "default_max_op_num")]
    pub max_op_num: usize,

    /// Acceptable leader/follower offset gap when checking sync progress
    #[serde(default = "default_offset_delta")]
    pub offset_delta: u64,

    /// Default queue fan-out for failover-synthesized ops
    #[serde(default = "default_task_concurrency")]
    pub task_concurrency: u32,

    /// Default partition count for new tables
    #[serde(default = "default_partition_num")]
    pub partition_num: u32,

    /// Default replica count for new tables
    #[serde(default = "default_replica_num")]
    pub replica_num: u32,
}

fn default_max_concurrency() -> u32 {
    8
}
fn default_task_pool_size() -> usize {
    8
}
fn default_task_wait_time() -> u64 {
    1000
}
fn default_op_execute_timeout() -> u64 {
    3_600_000
}
fn default_get_task_status_interval() -> u64 {
    2000
}
fn default_get_table_status_interval() -> u64 {
    2000
}
fn default_offline_check_interval() -> u64 {
    1000
}
fn default_heartbeat_timeout() -> u64 {
    20_000
}
fn default_max_op_num() -> usize {
    10_000
}
fn default_offset_delta() -> u64 {
    50_000
}
fn default_task_concurrency() -> u32 {
    2
}
fn default_partition_num() -> u32 {
    8
}
fn default_replica_num() -> u32 {
    3
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            zone_name: String::new(),
            max_concurrency: default_max_concurrency(),
            task_pool_size: default_task_pool_size(),
            task_wait_time_ms: default_task_wait_time(),
            op_execute_timeout_ms: default_op_execute_timeout(),
            get_task_status_interval_ms: default_get_task_status_interval(),
            get_table_status_interval_ms: default_get_table_status_interval(),
            offline_check_interval_ms: default_offline_check_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            max_op_num: default_max_op_num(),
            offset_delta: default_offset_delta(),
            task_concurrency: default_task_concurrency(),
            partition_num: default_partition_num(),
            replica_num: default_replica_num(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoordinatorConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_concurrency == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_concurrency must be positive".into(),
            ));
        }
        if self.task_pool_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "task_pool_size must be positive".into(),
            ));
        }
        if self.partition_num == 0 || self.replica_num == 0 {
            return Err(crate::Error::InvalidConfig(
                "partition_num and replica_num must be positive".into(),
            ));
        }
        if self.task_concurrency > self.max_concurrency {
            return Err(crate::Error::InvalidConfig(
                "task_concurrency cannot exceed max_concurrency".into(),
            ));
        }
        Ok(())
    }
}
