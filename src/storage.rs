//! String key/value persistence shared with other tabs.
//!
//! Two scopes exist: tab-scoped storage lives as long as the tab, origin-scoped
//! storage is visible to every tab of the same origin. Neither offers
//! transactions; last write wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

/// Consumer-provided key/value storage (browser storage, a file, a test map).
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    fn set(&self, key: &str, value: String) -> Result<(), Error>;

    fn remove(&self, key: &str) -> Result<(), Error>;

    /// All keys currently present.
    fn keys(&self) -> Result<Vec<String>, Error>;
}

/// Removes every key starting with `prefix`. Returns how many were removed.
pub(crate) fn remove_prefixed(store: &dyn KeyValueStore, prefix: &str) -> Result<usize, Error> {
    let mut removed = 0;
    for key in store.keys()? {
        if key.starts_with(prefix) {
            store.remove(&key)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Builds `{prefix}{first}:{second}` with both parts form-encoded, so an id
/// containing `:` cannot be mistaken for another pair.
pub(crate) fn pair_key(prefix: &str, first: &str, second: &str) -> String {
    format!("{prefix}{}:{}", encode_part(first), encode_part(second))
}

/// Inverse of [`pair_key`], still encoded. `None` for keys outside `prefix`.
pub(crate) fn split_pair_key<'k>(prefix: &str, key: &'k str) -> Option<(&'k str, &'k str)> {
    key.strip_prefix(prefix)?.split_once(':')
}

pub(crate) fn encode_part(part: &str) -> String {
    url::form_urlencoded::byte_serialize(part.as_bytes()).collect()
}

/// The two storage scopes handed to the session manager.
#[derive(Clone)]
pub struct Storage {
    pub tab: Arc<dyn KeyValueStore>,
    pub origin: Arc<dyn KeyValueStore>,
}

impl Storage {
    #[must_use]
    pub fn new(tab: Arc<dyn KeyValueStore>, origin: Arc<dyn KeyValueStore>) -> Self {
        Self { tab, origin }
    }

    /// Fresh in-memory scopes.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }
}

/// In-memory [`KeyValueStore`].
///
/// Cloning shares the underlying map, which is how tests model two tabs
/// reading the same origin storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), Error> {
        self.entries.write().insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_entries() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "v".into()).unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn remove_prefixed_leaves_other_keys() {
        let store = MemoryStore::new();
        store.set("delegation:a", "1".into()).unwrap();
        store.set("delegation:b", "2".into()).unwrap();
        store.set("tab_id", "t".into()).unwrap();

        let removed = remove_prefixed(&store, "delegation:").unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.keys().unwrap(), vec!["tab_id".to_string()]);
    }

    #[test]
    fn pair_keys_escape_separators() {
        assert_eq!(pair_key("p:", "chief-1", "u1"), "p:chief-1:u1");

        let key = pair_key("p:", "a", "x:u1");
        assert_eq!(split_pair_key("p:", &key), Some(("a", "x%3Au1")));
        assert_ne!(pair_key("p:", "a:x", "u1"), pair_key("p:", "a", "x:u1"));
        assert_eq!(split_pair_key("q:", &key), None);
    }
}
