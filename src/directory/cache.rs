// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The directory resolution cache.
//!
//! Two scopes share one store, both keyed by the escaped absolute path text:
//!
//! * transaction-scoped entries, additionally keyed by the transaction id.
//!   A path resolved once inside a transaction is served from here for the
//!   rest of that transaction and dropped when the transaction ends.
//! * database-scoped entries, tagged with the metadata version register
//!   value they were resolved under. A consult passes the register value the
//!   caller just read; a register change purges the stale entries. Only
//!   resolutions from transactions without buffered writes are installed, so
//!   an aborted transaction can never leak uncommitted state into the shared
//!   scope.
//!
//! Mutating operations additionally invalidate the mutated path and its
//! descendants eagerly in both scopes.
//!
//! Readers either see a fully installed entry or miss; a miss is always
//! safe, it only costs the node walk.

use log::trace;
use std::collections::HashMap;
use std::sync::Mutex;

/// One ancestor stamp captured at resolution time: the stamp key and the
/// value it held. A handle is valid while every captured stamp still reads
/// back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainLink {
    pub(crate) key: Vec<u8>,
    pub(crate) stamp: u64,
}

/// A fully resolved directory, as stored in the cache.
#[derive(Debug, Clone)]
pub(crate) struct CachedNode {
    pub(crate) prefix: Vec<u8>,
    pub(crate) layer: String,
    pub(crate) chain: Vec<ChainLink>,
}

#[derive(Default)]
struct CacheInner {
    /// Last observed register value, per directory layer root path.
    versions: HashMap<String, u64>,
    db: HashMap<String, CachedNode>,
    txn: HashMap<(u64, String), CachedNode>,
}

/// Process-wide resolution cache; one per [`Database`](crate::Database),
/// living exactly as long as it.
pub(crate) struct ResolutionCache {
    inner: Mutex<CacheInner>,
}

/// True when `path_key` equals `base` or lies below it.
fn under(path_key: &str, base: &str) -> bool {
    if path_key == base {
        return true;
    }
    if base == "/" {
        return path_key.starts_with('/');
    }
    path_key.starts_with(base) && path_key[base.len()..].starts_with('/')
}

impl ResolutionCache {
    pub(crate) fn new() -> Self {
        ResolutionCache {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub(crate) fn get_txn(&self, txn: u64, path_key: &str) -> Option<CachedNode> {
        let inner = self.inner.lock().expect("resolution cache poisoned");
        inner.txn.get(&(txn, path_key.to_string())).cloned()
    }

    pub(crate) fn install_txn(&self, txn: u64, path_key: String, node: CachedNode) {
        let mut inner = self.inner.lock().expect("resolution cache poisoned");
        inner.txn.insert((txn, path_key), node);
    }

    /// Looks up a database-scoped entry, refreshing the layer's observed
    /// register value first. A register change purges everything resolved
    /// under the layer.
    pub(crate) fn get_db(&self, layer_key: &str, path_key: &str, register: u64) -> Option<CachedNode> {
        let mut inner = self.inner.lock().expect("resolution cache poisoned");
        match inner.versions.get(layer_key) {
            Some(observed) if *observed == register => inner.db.get(path_key).cloned(),
            _ => {
                trace!(
                    "directory cache refresh for layer {} at register {}",
                    layer_key,
                    register
                );
                inner.db.retain(|key, _| !under(key, layer_key));
                inner.versions.insert(layer_key.to_string(), register);
                None
            }
        }
    }

    /// Installs a database-scoped entry, unless the layer's register moved
    /// since the caller read it.
    pub(crate) fn install_db(
        &self,
        layer_key: &str,
        path_key: String,
        register: u64,
        node: CachedNode,
    ) {
        let mut inner = self.inner.lock().expect("resolution cache poisoned");
        match inner.versions.get(layer_key) {
            Some(observed) if *observed != register => return,
            Some(_) => {}
            None => {
                inner.versions.insert(layer_key.to_string(), register);
            }
        }
        inner.db.insert(path_key, node);
    }

    /// Drops the entry at `path_key` and every entry below it, in both
    /// scopes.
    pub(crate) fn invalidate(&self, path_key: &str) {
        let mut inner = self.inner.lock().expect("resolution cache poisoned");
        inner.db.retain(|key, _| !under(key, path_key));
        inner.txn.retain(|(_, key), _| !under(key, path_key));
        trace!("directory cache invalidated below {}", path_key);
    }

    /// Drops every transaction-scoped entry of a finished transaction.
    pub(crate) fn forget_transaction(&self, txn: u64) {
        let mut inner = self.inner.lock().expect("resolution cache poisoned");
        inner.txn.retain(|(id, _), _| *id != txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(prefix: &[u8]) -> CachedNode {
        CachedNode {
            prefix: prefix.to_vec(),
            layer: String::new(),
            chain: Vec::new(),
        }
    }

    #[test]
    fn register_change_purges_layer() {
        let cache = ResolutionCache::new();
        cache.install_db("/", "/a".to_string(), 1, node(b"\x15\x01"));
        assert!(cache.get_db("/", "/a", 1).is_some());
        // register moved: entry is gone, new register remembered
        assert!(cache.get_db("/", "/a", 2).is_none());
        assert!(cache.get_db("/", "/a", 2).is_none());
    }

    #[test]
    fn stale_install_is_dropped() {
        let cache = ResolutionCache::new();
        assert!(cache.get_db("/", "/a", 5).is_none());
        cache.install_db("/", "/a".to_string(), 4, node(b"\x15\x01"));
        assert!(cache.get_db("/", "/a", 5).is_none());
    }

    #[test]
    fn invalidate_covers_descendants() {
        let cache = ResolutionCache::new();
        cache.install_db("/", "/a".to_string(), 1, node(b"\x15\x01"));
        cache.install_db("/", "/a/b".to_string(), 1, node(b"\x15\x02"));
        cache.install_db("/", "/ab".to_string(), 1, node(b"\x15\x03"));
        cache.invalidate("/a");
        assert!(cache.get_db("/", "/a", 1).is_none());
        assert!(cache.get_db("/", "/a/b", 1).is_none());
        assert!(cache.get_db("/", "/ab", 1).is_some());
    }

    #[test]
    fn txn_scope_is_per_transaction() {
        let cache = ResolutionCache::new();
        cache.install_txn(7, "/a".to_string(), node(b"\x15\x01"));
        assert!(cache.get_txn(7, "/a").is_some());
        assert!(cache.get_txn(8, "/a").is_none());
        cache.forget_transaction(7);
        assert!(cache.get_txn(7, "/a").is_none());
    }
}
