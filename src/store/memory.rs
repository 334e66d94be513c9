//! In-memory coordination store
//!
//! Single-process stand-in for the external coordination service. Keeps the
//! full node tree in a map and fires child watches synchronously on the
//! mutating thread, after the internal lock is released.

use crate::common::{Error, Result};
use crate::store::{MetaStore, WatchCallback};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Inner {
    nodes: BTreeMap<String, Vec<u8>>,
    watches: HashMap<String, Vec<Arc<WatchCallback>>>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
    session: AtomicU64,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                watches: HashMap::new(),
            }),
            session: AtomicU64::new(1),
        }
    }

    /// Force a session-term change, as a real service does when the session
    /// expires and a new one is established.
    pub fn expire_session(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
    }

    fn parent_of(path: &str) -> Option<&str> {
        path.rfind('/').map(|idx| &path[..idx])
    }

    fn child_names(nodes: &BTreeMap<String, Vec<u8>>, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    /// Collect the watchers of `path`'s parent together with the fresh
    /// child list, to be fired outside the lock.
    fn watchers_for(inner: &Inner, path: &str) -> Option<(Vec<Arc<WatchCallback>>, Vec<String>)> {
        let parent = Self::parent_of(path)?;
        let watchers = inner.watches.get(parent)?;
        if watchers.is_empty() {
            return None;
        }
        Some((watchers.clone(), Self::child_names(&inner.nodes, parent)))
    }
}

impl MetaStore for MemStore {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nodes.get(path).cloned())
    }

    fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(path) {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(())
            }
            None => Err(Error::NodeMissing(path.to_string())),
        }
    }

    fn create(&self, path: &str, value: &[u8]) -> Result<()> {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            if inner.nodes.contains_key(path) {
                return Err(Error::NodeExists(path.to_string()));
            }
            inner.nodes.insert(path.to_string(), value.to_vec());
            Self::watchers_for(&inner, path)
        };
        if let Some((watchers, children)) = fired {
            for watcher in watchers {
                (*watcher)(children.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            if inner.nodes.remove(path).is_none() {
                return Err(Error::NodeMissing(path.to_string()));
            }
            Self::watchers_for(&inner, path)
        };
        if let Some((watchers, children)) = fired {
            for watcher in watchers {
                (*watcher)(children.clone());
            }
        }
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::child_names(&inner.nodes, path))
    }

    fn watch_children(&self, path: &str, cb: WatchCallback) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .watches
            .entry(path.to_string())
            .or_default()
            .push(Arc::new(cb));
        Ok(())
    }

    fn session_term(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }
}
