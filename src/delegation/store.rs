use std::sync::Arc;

use super::{DelegatedSession, DelegationSession};
use crate::error::Error;
use crate::legacy::LegacyShim;
use crate::storage::{self, KeyValueStore};
use crate::types::{ResourceId, SubjectId};

pub(crate) const DELEGATION_PREFIX: &str = "portal.delegation:";

/// Persists delegation sessions per (primary subject, resource).
///
/// Pure storage: no expiry policy beyond what the legacy shim enforces, no
/// network. Unreadable entries are deleted on read.
#[derive(Clone)]
pub struct DelegationStore {
    store: Arc<dyn KeyValueStore>,
    legacy: LegacyShim,
}

impl DelegationStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let legacy = LegacyShim::new(store.clone());
        Self { store, legacy }
    }

    #[must_use]
    pub fn with_legacy(mut self, legacy: LegacyShim) -> Self {
        self.legacy = legacy;
        self
    }

    #[must_use]
    pub fn legacy(&self) -> &LegacyShim {
        &self.legacy
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the entry cannot be written.
    pub fn persist(&self, session: &DelegatedSession) -> Result<(), Error> {
        let value = serde_json::to_string(session)
            .map_err(|e| Error::Storage(format!("serialize delegation: {e}")))?;
        self.store
            .set(&key(&session.authenticated_by, &session.resource_id), value)
    }

    /// Authenticated delegation only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store fails.
    pub fn load(
        &self,
        primary: &SubjectId,
        resource: &ResourceId,
    ) -> Result<Option<DelegatedSession>, Error> {
        self.read_entry(&key(primary, resource))
    }

    /// Authenticated delegation if present, otherwise a live legacy session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store fails.
    pub fn load_any(
        &self,
        primary: &SubjectId,
        resource: &ResourceId,
    ) -> Result<Option<DelegationSession>, Error> {
        if let Some(session) = self.load(primary, resource)? {
            return Ok(Some(DelegationSession::Authenticated(session)));
        }
        Ok(self
            .legacy
            .check(resource, primary)?
            .map(DelegationSession::Legacy))
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the entry cannot be removed.
    pub fn invalidate(&self, primary: &SubjectId, resource: &ResourceId) -> Result<(), Error> {
        self.store.remove(&key(primary, resource))
    }

    /// Removes every delegation created by `primary` and its legacy markers,
    /// plus unreadable entries. Returns how many delegations were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store fails.
    pub fn clear_for_primary(&self, primary: &SubjectId) -> Result<usize, Error> {
        let mut removed = 0;
        for key in self.store.keys()? {
            if !key.starts_with(DELEGATION_PREFIX) {
                continue;
            }
            let owned = match self.read_entry(&key)? {
                Some(session) => session.authenticated_by == *primary,
                // read_entry already deleted it
                None => continue,
            };
            if owned {
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        self.legacy.clear_for_subject(primary)?;
        Ok(removed)
    }

    /// Removes all delegation entries and legacy markers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store fails.
    pub fn clear_all(&self) -> Result<usize, Error> {
        let delegations = storage::remove_prefixed(self.store.as_ref(), DELEGATION_PREFIX)?;
        Ok(delegations + self.legacy.clear_all()?)
    }

    fn read_entry(&self, key: &str) -> Result<Option<DelegatedSession>, Error> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable delegation entry");
                self.store.remove(key)?;
                Ok(None)
            }
        }
    }
}

fn key(primary: &SubjectId, resource: &ResourceId) -> String {
    storage::pair_key(DELEGATION_PREFIX, &primary.0, &resource.0)
}
