//! Table catalog
//!
//! Authoritative in-memory view of tables, partitions and replica
//! placement. Tables are held as immutable snapshots behind `Arc`;
//! every mutation builds an updated copy, persists it to the store and
//! only then swaps the in-memory pointer and bumps the notify counter.
//! A failed persist leaves the in-memory state untouched.

use crate::common::{Error, Result};
use crate::coordinator::{Coordinator, State};
use crate::store::paths;
use crate::store::MetaStoreExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Append-only schema evolution bound.
pub const MAX_ADDED_COLUMNS: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Timestamp,
    Date,
    String,
}

impl ColumnKind {
    /// Float and double columns can never back an index.
    pub fn indexable(&self) -> bool {
        !matches!(self, ColumnKind::Float | ColumnKind::Double)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub is_index: bool,
    #[serde(default)]
    pub is_ts: bool,
}

/// Secondary index key over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnKey {
    pub index_name: String,
    #[serde(default)]
    pub col_names: Vec<String>,
    #[serde(default)]
    pub ts_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlKind {
    AbsoluteTime,
    LatestCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlSpec {
    pub kind: TtlKind,
    pub value: u64,
}

impl Default for TtlSpec {
    fn default() -> Self {
        Self {
            kind: TtlKind::AbsoluteTime,
            value: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Memory,
    Ssd,
    Hdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressMode {
    None,
    Snappy,
}

/// One leadership epoch: the term and the log offset it started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermOffset {
    pub term: u64,
    pub offset: u64,
}

/// Replica placement record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub endpoint: String,
    pub is_leader: bool,
    pub is_alive: bool,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub record_cnt: Option<u64>,
    #[serde(default)]
    pub record_byte_size: Option<u64>,
    #[serde(default = "default_has_partition")]
    pub tablet_has_partition: bool,
}

fn default_has_partition() -> bool {
    true
}

impl PartitionMeta {
    pub fn new(endpoint: &str, is_leader: bool) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            is_leader,
            is_alive: true,
            offset: None,
            record_cnt: None,
            record_byte_size: None,
            tablet_has_partition: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub pid: u32,
    #[serde(default)]
    pub record_cnt: u64,
    #[serde(default)]
    pub record_byte_size: u64,
    pub partition_meta: Vec<PartitionMeta>,
    #[serde(default)]
    pub term_offset: Vec<TermOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub tid: u32,
    pub partition_num: u32,
    pub replica_num: u32,
    #[serde(default = "default_seg_cnt")]
    pub seg_cnt: u32,
    #[serde(default)]
    pub ttl: TtlSpec,
    #[serde(default = "default_compress")]
    pub compress: CompressMode,
    #[serde(default = "default_storage")]
    pub storage: StorageMode,
    #[serde(default)]
    pub key_entry_max_height: Option<u32>,
    #[serde(default)]
    pub columns: Vec<ColumnDesc>,
    #[serde(default)]
    pub column_keys: Vec<ColumnKey>,
    #[serde(default)]
    pub added_columns: Vec<ColumnDesc>,
    pub table_partition: Vec<Partition>,
}

fn default_seg_cnt() -> u32 {
    8
}
fn default_compress() -> CompressMode {
    CompressMode::None
}
fn default_storage() -> StorageMode {
    StorageMode::Memory
}

impl TableInfo {
    pub fn partition(&self, pid: u32) -> Option<&Partition> {
        self.table_partition.iter().find(|p| p.pid == pid)
    }

    fn partition_mut(&mut self, pid: u32) -> Option<&mut Partition> {
        self.table_partition.iter_mut().find(|p| p.pid == pid)
    }

    /// The alive leader meta of a partition, if any.
    pub fn leader_of(&self, pid: u32) -> Option<&PartitionMeta> {
        self.partition(pid)?
            .partition_meta
            .iter()
            .find(|m| m.is_leader && m.is_alive)
    }

    pub fn meta_of(&self, pid: u32, endpoint: &str) -> Option<&PartitionMeta> {
        self.partition(pid)?
            .partition_meta
            .iter()
            .find(|m| m.endpoint == endpoint)
    }

    /// All columns including appended ones, in order.
    pub fn all_columns(&self) -> impl Iterator<Item = &ColumnDesc> {
        self.columns.iter().chain(self.added_columns.iter())
    }

    fn missing_partition(&self, pid: u32) -> Error {
        Error::PartitionMissing {
            name: self.name.clone(),
            pid,
        }
    }

    /// Copy with one partition fully replaced.
    pub fn with_partition(&self, pid: u32, partition: Partition) -> Result<TableInfo> {
        let mut table = self.clone();
        let slot = table
            .partition_mut(pid)
            .ok_or_else(|| self.missing_partition(pid))?;
        *slot = partition;
        slot.pid = pid;
        Ok(table)
    }

    /// Copy with a follower meta appended to a partition. The new meta
    /// starts not-alive; a later status update flips it once the replica
    /// has caught up.
    pub fn with_added_replica(&self, pid: u32, endpoint: &str) -> Result<TableInfo> {
        if self.meta_of(pid, endpoint).is_some() {
            return Err(Error::InvalidArg(format!(
                "replica {} already at {} pid[{}]",
                endpoint, self.name, pid
            )));
        }
        let mut table = self.clone();
        let partition = table
            .partition_mut(pid)
            .ok_or_else(|| self.missing_partition(pid))?;
        let mut meta = PartitionMeta::new(endpoint, false);
        meta.is_alive = false;
        partition.partition_meta.push(meta);
        Ok(table)
    }

    /// Copy with a replica meta removed from a partition.
    pub fn with_removed_replica(&self, pid: u32, endpoint: &str) -> Result<TableInfo> {
        let mut table = self.clone();
        let partition = table
            .partition_mut(pid)
            .ok_or_else(|| self.missing_partition(pid))?;
        let before = partition.partition_meta.len();
        partition.partition_meta.retain(|m| m.endpoint != endpoint);
        if partition.partition_meta.len() == before {
            return Err(Error::InvalidArg(format!(
                "no replica {} at {} pid[{}]",
                endpoint, self.name, pid
            )));
        }
        Ok(table)
    }

    /// Copy with one replica's leader/alive flags updated.
    pub fn with_replica_status(
        &self,
        pid: u32,
        endpoint: &str,
        is_leader: bool,
        is_alive: bool,
    ) -> Result<TableInfo> {
        let mut table = self.clone();
        let partition = table
            .partition_mut(pid)
            .ok_or_else(|| self.missing_partition(pid))?;
        let meta = partition
            .partition_meta
            .iter_mut()
            .find(|m| m.endpoint == endpoint)
            .ok_or_else(|| Error::InvalidArg(format!(
                "no replica {} at {} pid[{}]",
                endpoint, self.name, pid
            )))?;
        meta.is_leader = is_leader;
        meta.is_alive = is_alive;
        Ok(table)
    }

    /// Copy with one replica moved to another endpoint.
    pub fn with_replica_endpoint(&self, pid: u32, from: &str, to: &str) -> Result<TableInfo> {
        let mut table = self.clone();
        let partition = table
            .partition_mut(pid)
            .ok_or_else(|| self.missing_partition(pid))?;
        let meta = partition
            .partition_meta
            .iter_mut()
            .find(|m| m.endpoint == from)
            .ok_or_else(|| Error::InvalidArg(format!(
                "no replica {} at {} pid[{}]",
                from, self.name, pid
            )))?;
        meta.endpoint = to.to_string();
        meta.is_alive = true;
        Ok(table)
    }

    /// Copy with a (term, offset) pair appended to a partition's history.
    /// Terms must be strictly increasing.
    pub fn with_term_offset(&self, pid: u32, term: u64, offset: u64) -> Result<TableInfo> {
        let mut table = self.clone();
        let partition = table
            .partition_mut(pid)
            .ok_or_else(|| self.missing_partition(pid))?;
        if let Some(last) = partition.term_offset.last() {
            if term <= last.term {
                return Err(Error::InvalidArg(format!(
                    "term {} not greater than recorded {} for {} pid[{}]",
                    term, last.term, self.name, pid
                )));
            }
        }
        partition.term_offset.push(TermOffset { term, offset });
        Ok(table)
    }

    /// Copy with an appended column. Enforces the append-only bound and
    /// name uniqueness.
    pub fn with_added_column(&self, column: ColumnDesc) -> Result<TableInfo> {
        if self.added_columns.len() >= MAX_ADDED_COLUMNS {
            return Err(Error::InvalidArg(format!(
                "added columns of {} exceed {}",
                self.name, MAX_ADDED_COLUMNS
            )));
        }
        if self.all_columns().any(|c| c.name == column.name) {
            return Err(Error::InvalidArg(format!(
                "duplicate column {} in {}",
                column.name, self.name
            )));
        }
        let mut table = self.clone();
        table.added_columns.push(column);
        Ok(table)
    }

    /// Copy with a new ttl.
    pub fn with_ttl(&self, ttl: TtlSpec) -> TableInfo {
        let mut table = self.clone();
        table.ttl = ttl;
        table
    }
}

impl Coordinator {
    /// Persist an updated table and swap the in-memory snapshot.
    pub(crate) fn persist_table(&self, st: &mut State, table: TableInfo) -> Result<()> {
        self.store
            .save_record(&paths::table_node(&table.name), &table)?;
        st.tables.insert(table.name.clone(), Arc::new(table));
        self.notify_table_changed();
        Ok(())
    }

    /// Persist a brand-new table node and register the snapshot.
    pub(crate) fn create_table_record(&self, st: &mut State, table: TableInfo) -> Result<()> {
        self.store
            .create_record(&paths::table_node(&table.name), &table)?;
        st.tables.insert(table.name.clone(), Arc::new(table));
        self.notify_table_changed();
        Ok(())
    }

    /// Delete a table node and drop the snapshot.
    pub(crate) fn drop_table_record(&self, st: &mut State, name: &str) -> Result<()> {
        self.store.delete(&paths::table_node(name))?;
        st.tables.remove(name);
        self.notify_table_changed();
        Ok(())
    }

    /// Bump the notify counter so clients refresh their placement view.
    /// Best effort; a miss only delays client refresh.
    pub(crate) fn notify_table_changed(&self) {
        let counter = match self.store.read_counter(paths::NOTIFY) {
            Ok(Some(counter)) => counter,
            Ok(None) => {
                tracing::warn!("table changed notify node is missing");
                return;
            }
            Err(e) => {
                tracing::warn!("read table changed notify node failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.write_counter(paths::NOTIFY, counter + 1) {
            tracing::warn!("bump table changed notify node failed: {}", e);
        } else {
            tracing::debug!("notify table changed, counter {}", counter + 1);
        }
    }

    /// Pull per-worker replica counters into the catalog. The fields are
    /// transient runtime state and are not persisted; a worker that
    /// responds without mentioning a replica it should hold gets that
    /// meta flagged as missing the partition.
    pub(crate) async fn update_table_status_once(&self) {
        let clients: Vec<_> = {
            let st = self.lock_state();
            st.workers
                .values()
                .filter(|w| w.is_healthy())
                .map(|w| (w.endpoint.clone(), w.rpc.clone()))
                .collect()
        };
        let mut responses: std::collections::HashMap<
            String,
            std::collections::HashMap<(u32, u32), crate::worker::TableStatusReport>,
        > = std::collections::HashMap::new();
        for (endpoint, rpc) in clients {
            match rpc.get_table_status().await {
                Ok(reports) => {
                    let by_replica = reports
                        .into_iter()
                        .map(|r| ((r.tid, r.pid), r))
                        .collect();
                    responses.insert(endpoint, by_replica);
                }
                Err(e) => tracing::debug!("get table status from {} failed: {}", endpoint, e),
            }
        }
        if responses.is_empty() {
            return;
        }
        let mut st = self.lock_state();
        let tables: Vec<_> = st.tables.values().cloned().collect();
        for table in tables {
            let mut updated = (*table).clone();
            let mut changed = false;
            for partition in updated.table_partition.iter_mut() {
                for meta in partition.partition_meta.iter_mut() {
                    let worker_reports = match responses.get(&meta.endpoint) {
                        Some(reports) => reports,
                        None => continue,
                    };
                    match worker_reports.get(&(table.tid, partition.pid)) {
                        Some(report) => {
                            meta.offset = Some(report.offset);
                            meta.record_cnt = Some(report.record_cnt);
                            meta.record_byte_size = Some(report.record_byte_size);
                            meta.tablet_has_partition = true;
                            changed = true;
                            if meta.is_leader && meta.is_alive {
                                partition.record_cnt = report.record_cnt;
                                partition.record_byte_size = report.record_byte_size;
                            }
                        }
                        None => {
                            if meta.tablet_has_partition {
                                meta.tablet_has_partition = false;
                                changed = true;
                            }
                        }
                    }
                }
            }
            if changed {
                st.tables.insert(updated.name.clone(), Arc::new(updated));
            }
        }
    }

    pub(crate) async fn run_table_status_poller(self: Arc<Self>) {
        tracing::info!("table status poller started");
        while self.is_running() {
            self.update_table_status_once().await;
            tokio::time::sleep(std::time::Duration::from_millis(
                self.cfg.get_table_status_interval_ms,
            ))
            .await;
        }
        tracing::info!("table status poller stopped");
    }

    /// Load all tables from the store, replacing the in-memory catalog.
    pub(crate) fn recover_tables(&self, st: &mut State) -> Result<()> {
        st.tables.clear();
        let names = match self.store.children(paths::TABLE_DATA) {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("list table data failed: {}", e);
                return Ok(());
            }
        };
        tracing::info!("recovering {} tables", names.len());
        for name in names {
            match self.store.load_record::<TableInfo>(&paths::table_node(&name))? {
                Some(table) => {
                    tracing::info!("recovered table {} tid[{}]", name, table.tid);
                    st.tables.insert(name, Arc::new(table));
                }
                None => tracing::warn!("table node {} vanished during recovery", name),
            }
        }
        Ok(())
    }
}
