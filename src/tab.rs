use std::sync::atomic::{AtomicBool, Ordering};

use ulid::Ulid;

use crate::error::Error;
use crate::storage::KeyValueStore;
use crate::types::TabId;

pub(crate) const TAB_ID_KEY: &str = "portal.tab_id";

/// Returns this tab's identifier, generating and persisting one on first access.
///
/// The value lives in tab-scoped storage. An unreadable value is replaced.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the store cannot be read or written.
pub fn load_or_create_tab_id(store: &dyn KeyValueStore) -> Result<TabId, Error> {
    if let Some(raw) = store.get(TAB_ID_KEY)? {
        if raw.parse::<Ulid>().is_ok() {
            return Ok(TabId(raw));
        }
        tracing::warn!(value = %raw, "Discarding malformed tab id");
    }
    let id = Ulid::new().to_string();
    store.set(TAB_ID_KEY, id.clone())?;
    Ok(TabId(id))
}

/// Identity and visibility of the tab the session manager runs in.
#[derive(Debug)]
pub struct TabContext {
    id: TabId,
    hidden: AtomicBool,
}

impl TabContext {
    #[must_use]
    pub fn new(id: TabId) -> Self {
        Self {
            id,
            hidden: AtomicBool::new(false),
        }
    }

    /// # Errors
    ///
    /// Propagates storage failures from [`load_or_create_tab_id`].
    pub fn from_store(store: &dyn KeyValueStore) -> Result<Self, Error> {
        load_or_create_tab_id(store).map(Self::new)
    }

    #[must_use]
    pub fn id(&self) -> &TabId {
        &self.id
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Acquire)
    }

    /// Records the new visibility and returns the previous one.
    pub fn set_hidden(&self, hidden: bool) -> bool {
        self.hidden.swap(hidden, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn tab_id_is_stable_across_reads() {
        let store = MemoryStore::new();
        let first = load_or_create_tab_id(&store).unwrap();
        let second = load_or_create_tab_id(&store).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn separate_tabs_get_separate_ids() {
        let a = load_or_create_tab_id(&MemoryStore::new()).unwrap();
        let b = load_or_create_tab_id(&MemoryStore::new()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_tab_id_is_replaced() {
        let store = MemoryStore::new();
        store.set(TAB_ID_KEY, "not-a-ulid".into()).unwrap();

        let id = load_or_create_tab_id(&store).unwrap();

        assert_ne!(id.0, "not-a-ulid");
        assert_eq!(store.get(TAB_ID_KEY).unwrap(), Some(id.0));
    }

    #[test]
    fn visibility_swaps() {
        let tab = TabContext::new(TabId("t".into()));
        assert!(!tab.is_hidden());
        assert!(!tab.set_hidden(true));
        assert!(tab.is_hidden());
    }
}
