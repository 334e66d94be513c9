//! Persistent namespace layout on the coordination store

/// Ephemeral worker registrations.
pub const NODES: &str = "/nodes";

/// Distributed-lock children for coordinator election.
pub const LEADER: &str = "/leader";

/// Last allocated table id.
pub const TABLE_INDEX: &str = "/table/table_index";

/// Last allocated leadership term.
pub const TERM: &str = "/table/term";

/// Monotone counter bumped on any catalog change.
pub const NOTIFY: &str = "/table/notify";

/// Serialized tables live under here, one child per table name.
pub const TABLE_DATA: &str = "/table/table_data";

/// Last allocated op id.
pub const OP_INDEX: &str = "/op/op_index";

/// Serialized op headers live under here, one child per op id.
pub const OP_DATA: &str = "/op/op_data";

/// Auto-failover flag, "true" or "false".
pub const AUTO_FAILOVER: &str = "/config/auto_failover";

/// Zone identity nodes.
pub const CLUSTER_TERM: &str = "/cluster/term";
pub const CLUSTER_NAME: &str = "/cluster/name";
pub const CLUSTER_FOLLOWER: &str = "/cluster/follower";

/// Remote replica-cluster descriptors, one child per alias.
pub const CLUSTER_REPLICA: &str = "/cluster/replica";

/// Worker registration values carrying this prefix mark a fresh restart.
pub const STARTUP_PREFIX: &str = "startup_";

pub fn node_entry(endpoint: &str) -> String {
    format!("{}/{}", NODES, endpoint)
}

pub fn table_node(name: &str) -> String {
    format!("{}/{}", TABLE_DATA, name)
}

pub fn op_node(op_id: u64) -> String {
    format!("{}/{}", OP_DATA, op_id)
}

pub fn replica_cluster_node(alias: &str) -> String {
    format!("{}/{}", CLUSTER_REPLICA, alias)
}
