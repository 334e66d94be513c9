//! # tscoord
//!
//! Control plane of a replicated, sharded time-series table store:
//! - single active coordinator elected through a distributed lock
//! - authoritative cluster metadata kept in a coordination store
//! - compound multi-step ops (replica placement, leadership, table
//!   state) driven across worker nodes under partial failure
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │             Coordinator                   │
//! │  lifecycle ── leader lock, recovery       │
//! │  registry ─── live workers + RPC stubs    │
//! │  catalog ──── tables / partitions / metas │
//! │  engine ───── sharded op queues + driver  │
//! │  failover ─── offline/recover planning    │
//! └───────┬───────────────────┬───────────────┘
//!         │ coordination store│ worker RPC
//!   ┌─────▼─────┐       ┌─────▼─────┐
//!   │ MetaStore │       │ WorkerRpc │
//!   └───────────┘       └───────────┘
//! ```
//!
//! External collaborators (the coordination service, the distributed
//! lock, worker transports, remote zones) appear as traits; the crate
//! ships an in-memory store and a self-driven lock for tests and
//! single-process deployments.

pub mod api;
pub mod catalog;
pub mod cluster;
pub mod common;
pub mod coordinator;
pub mod engine;
pub mod failover;
pub mod lifecycle;
pub mod registry;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use common::{CoordinatorConfig, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
