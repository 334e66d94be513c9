//! Error types for tscoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination store errors ===
    #[error("store error: {0}")]
    Store(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NodeMissing(String),

    #[error("codec error: {0}")]
    Codec(String),

    // === Worker errors ===
    #[error("worker {endpoint} rpc failed: {msg}")]
    Worker { endpoint: String, msg: String },

    #[error("worker stub init failed: {0}")]
    WorkerInit(String),

    #[error("worker not found: {0}")]
    WorkerMissing(String),

    #[error("worker is offline: {0}")]
    WorkerOffline(String),

    // === Catalog errors ===
    #[error("table not found: {0}")]
    TableMissing(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("partition not found: {name} pid[{pid}]")]
    PartitionMissing { name: String, pid: u32 },

    #[error("no leader for table {name} pid[{pid}]")]
    LeaderMissing { name: String, pid: u32 },

    // === Op engine errors ===
    #[error("op build failed: {0}")]
    OpBuild(String),

    #[error("op add failed: {0}")]
    OpAdd(String),

    #[error("op not found: {0}")]
    OpMissing(u64),

    // === Config errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    // === Generic ===
    #[error("not leader")]
    NotLeader,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient error worth retrying?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Worker { .. } | Error::Io(_))
    }

    pub(crate) fn worker(endpoint: &str, msg: impl Into<String>) -> Error {
        Error::Worker {
            endpoint: endpoint.to_string(),
            msg: msg.into(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
