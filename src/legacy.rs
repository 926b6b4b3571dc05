//! Fixed-lifetime single-factor sessions for resources that have not moved
//! to delegated authentication.
//!
//! Each entry stores the grant time as unix milliseconds under a key scoped
//! to (owning resource, acting subject). Expiry is checked locally; nothing
//! here talks to a server.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::delegation::LegacySession;
use crate::error::Error;
use crate::storage::{self, KeyValueStore};
use crate::types::{ResourceId, SubjectId};

pub(crate) const LEGACY_PREFIX: &str = "portal.legacy_session:";

/// Lifetime of a legacy session.
pub const LEGACY_SESSION_TTL: Duration = Duration::hours(4);

#[derive(Clone)]
pub struct LegacyShim {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl LegacyShim {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl: LEGACY_SESSION_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Starts (or restarts) the legacy session for `acting` under `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the marker cannot be written.
    pub fn grant(&self, owner: &ResourceId, acting: &SubjectId) -> Result<(), Error> {
        self.grant_at(owner, acting, OffsetDateTime::now_utc())
    }

    pub(crate) fn grant_at(
        &self,
        owner: &ResourceId,
        acting: &SubjectId,
        at: OffsetDateTime,
    ) -> Result<(), Error> {
        let millis = at.unix_timestamp_nanos() / 1_000_000;
        self.store.set(&key(owner, acting), millis.to_string())
    }

    /// Returns the live session, deleting the entry if it expired or is unreadable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store itself fails.
    pub fn check(
        &self,
        owner: &ResourceId,
        acting: &SubjectId,
    ) -> Result<Option<LegacySession>, Error> {
        let key = key(owner, acting);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        let granted_at = match parse_millis(&raw) {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable legacy session");
                self.store.remove(&key)?;
                return Ok(None);
            }
        };
        let expires_at = granted_at + self.ttl;
        if expires_at <= OffsetDateTime::now_utc() {
            tracing::debug!(owner = %owner, "Legacy session expired");
            self.store.remove(&key)?;
            return Ok(None);
        }
        Ok(Some(LegacySession {
            owner: owner.clone(),
            acting: acting.clone(),
            granted_at,
            expires_at,
        }))
    }

    /// Like [`check`](Self::check), treating storage failures as "no session".
    #[must_use]
    pub fn is_valid(&self, owner: &ResourceId, acting: &SubjectId) -> bool {
        match self.check(owner, acting) {
            Ok(session) => session.is_some(),
            Err(e) => {
                tracing::warn!(owner = %owner, error = %e, "Legacy session check failed");
                false
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the marker cannot be removed.
    pub fn revoke(&self, owner: &ResourceId, acting: &SubjectId) -> Result<(), Error> {
        self.store.remove(&key(owner, acting))
    }

    /// Removes every marker held by `acting`, whatever the owning resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store fails.
    pub fn clear_for_subject(&self, acting: &SubjectId) -> Result<usize, Error> {
        let acting = storage::encode_part(&acting.0);
        let mut removed = 0;
        for key in self.store.keys()? {
            let held = storage::split_pair_key(LEGACY_PREFIX, &key)
                .is_some_and(|(_, subject)| subject == acting);
            if held {
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every legacy marker. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store fails.
    pub fn clear_all(&self) -> Result<usize, Error> {
        storage::remove_prefixed(self.store.as_ref(), LEGACY_PREFIX)
    }
}

fn key(owner: &ResourceId, acting: &SubjectId) -> String {
    storage::pair_key(LEGACY_PREFIX, &owner.0, &acting.0)
}

fn parse_millis(raw: &str) -> Result<OffsetDateTime, Error> {
    let corrupt = |detail: String| Error::CorruptState {
        key: "legacy_session".into(),
        detail,
    };
    let millis: i128 = raw.trim().parse().map_err(|e| corrupt(format!("{e}")))?;
    let nanos = millis
        .checked_mul(1_000_000)
        .ok_or_else(|| corrupt("out of range".into()))?;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|e| corrupt(e.to_string()))
}
