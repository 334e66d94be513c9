//! Coordination store adapter
//!
//! Thin typed facade over the external coordination service. The service
//! provides hierarchical nodes with per-node atomic writes, child watches
//! and a session term; no multi-key transactions are assumed. `put` on a
//! missing node and `create` on an existing node both fail, which the
//! callers rely on for initialization and op-id allocation.

pub mod memory;
pub mod paths;

use crate::common::Result;

pub use memory::MemStore;

/// Callback invoked with the new child set of a watched path.
pub type WatchCallback = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Contract of the coordination service.
pub trait MetaStore: Send + Sync {
    /// Read a node value. `Ok(None)` when the node does not exist.
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite an existing node. Fails with `NodeMissing` otherwise.
    fn put(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Create a new node. Fails with `NodeExists` if it is already there.
    fn create(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Delete a node. Fails with `NodeMissing` if absent.
    fn delete(&self, path: &str) -> Result<()>;

    /// List direct child names under a path. Empty when none.
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Register a callback fired whenever the child set of `path` changes.
    fn watch_children(&self, path: &str, cb: WatchCallback) -> Result<()>;

    /// Session term of the current connection. Changes force watch re-arm.
    fn session_term(&self) -> u64;

    /// Re-establish the session. Default stores have nothing to do.
    fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Drop the session. Default stores have nothing to do.
    fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Typed helpers layered on the raw byte interface.
pub trait MetaStoreExt: MetaStore {
    /// Read a decimal counter node.
    fn read_counter(&self, path: &str) -> Result<Option<u64>> {
        match self.get(path)? {
            Some(raw) => {
                let text = String::from_utf8(raw)
                    .map_err(|_| crate::Error::Codec(format!("non-utf8 counter at {}", path)))?;
                let value = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| crate::Error::Codec(format!("bad counter at {}: {}", path, text)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Overwrite a decimal counter node.
    fn write_counter(&self, path: &str, value: u64) -> Result<()> {
        self.put(path, value.to_string().as_bytes())
    }

    /// Read a counter, creating it with `default` when absent. Returns the
    /// effective value.
    fn ensure_counter(&self, path: &str, default: u64) -> Result<u64> {
        match self.read_counter(path)? {
            Some(value) => Ok(value),
            None => {
                self.create(path, default.to_string().as_bytes())?;
                Ok(default)
            }
        }
    }

    /// Read a "true"/"false" flag node.
    fn read_flag(&self, path: &str) -> Result<Option<bool>> {
        match self.get(path)? {
            Some(raw) => Ok(Some(raw == b"true")),
            None => Ok(None),
        }
    }

    /// Overwrite a flag node.
    fn write_flag(&self, path: &str, value: bool) -> Result<()> {
        self.put(path, if value { b"true" } else { b"false" })
    }

    /// Read a flag, creating it with `default` when absent.
    fn ensure_flag(&self, path: &str, default: bool) -> Result<bool> {
        match self.read_flag(path)? {
            Some(value) => Ok(value),
            None => {
                self.create(path, if default { b"true" } else { b"false" })?;
                Ok(default)
            }
        }
    }

    /// Read a string node, creating it with `default` when absent.
    fn ensure_text(&self, path: &str, default: &str) -> Result<String> {
        match self.get(path)? {
            Some(raw) => String::from_utf8(raw)
                .map_err(|_| crate::Error::Codec(format!("non-utf8 text at {}", path))),
            None => {
                self.create(path, default.as_bytes())?;
                Ok(default.to_string())
            }
        }
    }

    /// Read and decode a structured record node.
    fn load_record<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and overwrite a structured record node.
    fn save_record<T: serde::Serialize>(&self, path: &str, record: &T) -> Result<()> {
        self.put(path, &bincode::serialize(record)?)
    }

    /// Encode and create a structured record node.
    fn create_record<T: serde::Serialize>(&self, path: &str, record: &T) -> Result<()> {
        self.create(path, &bincode::serialize(record)?)
    }
}

impl<S: MetaStore + ?Sized> MetaStoreExt for S {}
