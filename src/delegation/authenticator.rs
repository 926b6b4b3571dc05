use std::collections::HashMap;

use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{
    Actor, ActorGrant, ActorKind, ActorLoginRequest, ActorSummary, AuthorityError,
    DelegatedSession, DelegationAuthority, DelegationPhase, DelegationSession, DelegationStore,
    DelegationView, DenialReason, DeviceInfo,
};
use crate::error::Error;
use crate::provider::PrimarySession;
use crate::types::{ResourceId, SubjectId};

/// Credentials for a delegated login.
#[derive(Debug, Clone)]
pub struct DelegatedLogin {
    pub resource_id: ResourceId,
    pub actor_kind: ActorKind,
    /// Required for assistants, ignored for the chief.
    pub assistant_code: Option<String>,
    pub passcode: String,
}

impl DelegatedLogin {
    #[must_use]
    pub fn chief(resource_id: ResourceId, passcode: impl Into<String>) -> Self {
        Self {
            resource_id,
            actor_kind: ActorKind::Chief,
            assistant_code: None,
            passcode: passcode.into(),
        }
    }

    #[must_use]
    pub fn assistant(
        resource_id: ResourceId,
        assistant_code: impl Into<String>,
        passcode: impl Into<String>,
    ) -> Self {
        Self {
            resource_id,
            actor_kind: ActorKind::Assistant,
            assistant_code: Some(assistant_code.into()),
            passcode: passcode.into(),
        }
    }
}

/// How a resource gates access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMode {
    Delegated { actors: Vec<ActorSummary> },
    Legacy,
    /// The settings could not be fetched.
    Unavailable(String),
}

/// Result of re-checking a stored delegation.
///
/// Only [`Granted`](Self::Granted) grants access. [`Unavailable`](Self::Unavailable)
/// is retryable, [`Denied`](Self::Denied) is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Granted(DelegationView),
    Denied(DenialReason),
    Unavailable(String),
}

impl ValidationOutcome {
    #[must_use]
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// # Errors
    ///
    /// [`Error::DelegationDenied`] for a denial, [`Error::Network`] when the
    /// authority was unreachable.
    pub fn into_result(self) -> Result<DelegationView, Error> {
        match self {
            Self::Granted(view) => Ok(view),
            Self::Denied(reason) => Err(Error::DelegationDenied(reason)),
            Self::Unavailable(msg) => Err(Error::Network(msg)),
        }
    }
}

/// Issues, validates, and revokes delegations against the remote authority.
pub struct DelegatedAuthenticator<A> {
    authority: A,
    store: DelegationStore,
    device: DeviceInfo,
    phases: Mutex<HashMap<ResourceId, DelegationPhase>>,
}

impl<A: DelegationAuthority> DelegatedAuthenticator<A> {
    #[must_use]
    pub fn new(authority: A, store: DelegationStore) -> Self {
        Self {
            authority,
            store,
            device: DeviceInfo::default(),
            phases: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn store(&self) -> &DelegationStore {
        &self.store
    }

    #[must_use]
    pub fn authority(&self) -> &A {
        &self.authority
    }

    #[must_use]
    pub fn phase(&self, resource: &ResourceId) -> DelegationPhase {
        self.phases.lock().get(resource).copied().unwrap_or_default()
    }

    /// Marks `resource` as waiting for credentials.
    pub fn begin(&self, resource: &ResourceId) {
        self.set_phase(resource, DelegationPhase::PendingCredentials);
    }

    /// Whether `resource` uses delegated or legacy authentication.
    ///
    /// Reports [`AccessMode::Unavailable`] when the settings cannot be fetched.
    pub async fn access_mode(&self, resource: &ResourceId) -> AccessMode {
        match self.authority.resource_settings(resource).await {
            Ok(settings) if settings.delegated_auth_enabled => AccessMode::Delegated {
                actors: settings.actors,
            },
            Ok(_) => AccessMode::Legacy,
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Delegation settings unavailable");
                AccessMode::Unavailable(e.to_string())
            }
        }
    }

    /// Logs an actor in under `login.resource_id` and persists the delegation.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAuthenticated`] if `primary` has expired.
    /// - [`Error::InvalidCredentials`] for any rejection, without saying which factor was wrong.
    /// - [`Error::Network`] if the authority is unreachable.
    /// - [`Error::Protocol`] if the grant is inconsistent.
    pub async fn login(
        &self,
        primary: &PrimarySession,
        login: DelegatedLogin,
    ) -> Result<DelegatedSession, Error> {
        let resource = login.resource_id.clone();
        if primary.is_expired() {
            return Err(Error::NotAuthenticated);
        }
        if login.actor_kind == ActorKind::Assistant
            && login.assistant_code.as_deref().is_none_or(str::is_empty)
        {
            self.set_phase(&resource, DelegationPhase::Denied);
            return Err(Error::InvalidCredentials);
        }

        self.set_phase(&resource, DelegationPhase::Validating);
        let request = ActorLoginRequest {
            resource_id: resource.clone(),
            actor_kind: login.actor_kind,
            assistant_code: match login.actor_kind {
                ActorKind::Chief => None,
                ActorKind::Assistant => login.assistant_code,
            },
            passcode: login.passcode,
            device: self.device.clone(),
        };

        let grant = match self.authority.actor_login(&request).await {
            Ok(grant) => grant,
            Err(e) => {
                self.set_phase(&resource, DelegationPhase::Denied);
                if matches!(e, AuthorityError::Rejected(_)) {
                    tracing::info!(resource = %resource, "Delegated login rejected");
                } else {
                    tracing::warn!(resource = %resource, error = %e, "Delegated login failed");
                }
                return Err(e.into());
            }
        };

        let session = match session_from_grant(&resource, &primary.subject, grant) {
            Ok(session) => session,
            Err(e) => {
                self.set_phase(&resource, DelegationPhase::Denied);
                return Err(e);
            }
        };
        self.store.persist(&session)?;
        self.refresh_legacy_marker(&resource, &primary.subject);
        self.set_phase(&resource, DelegationPhase::Granted);

        tracing::info!(
            resource = %resource,
            actor = ?session.actor.kind(),
            session_id = %session.session_id,
            "Delegated login successful"
        );
        Ok(session)
    }

    /// Re-checks the stored delegation for (`primary`, `resource`).
    ///
    /// Fails closed: anything but [`ValidationOutcome::Granted`] denies access.
    /// A denied delegation is deleted; an unreachable authority leaves it in place.
    pub async fn validate(
        &self,
        primary: Option<&PrimarySession>,
        resource: &ResourceId,
    ) -> ValidationOutcome {
        self.set_phase(resource, DelegationPhase::Validating);
        let outcome = self.validate_inner(primary, resource).await;
        let phase = if outcome.grants_access() {
            DelegationPhase::Granted
        } else {
            DelegationPhase::Denied
        };
        self.set_phase(resource, phase);
        outcome
    }

    async fn validate_inner(
        &self,
        primary: Option<&PrimarySession>,
        resource: &ResourceId,
    ) -> ValidationOutcome {
        let Some(primary) = primary else {
            return ValidationOutcome::Denied(DenialReason::PrimaryEnded);
        };
        if primary.is_expired() {
            self.discard(&primary.subject, resource);
            return ValidationOutcome::Denied(DenialReason::PrimaryEnded);
        }

        let stored = match self.store.load(&primary.subject, resource) {
            Ok(Some(stored)) => stored,
            Ok(None) => return ValidationOutcome::Denied(DenialReason::NoSession),
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Delegation store unreadable");
                return ValidationOutcome::Denied(DenialReason::NoSession);
            }
        };
        if stored.is_expired_at(OffsetDateTime::now_utc()) {
            self.discard(&primary.subject, resource);
            return ValidationOutcome::Denied(DenialReason::Expired);
        }

        match self.authority.actor_validate(resource, &stored.token).await {
            Ok(Some(grant)) => {
                let refreshed = stored.refreshed(&grant);
                if let Err(e) = self.store.persist(&refreshed) {
                    tracing::warn!(resource = %resource, error = %e, "Could not persist refreshed delegation");
                }
                self.refresh_legacy_marker(resource, &primary.subject);
                ValidationOutcome::Granted(DelegationSession::Authenticated(refreshed).view())
            }
            Ok(None) | Err(AuthorityError::Rejected(_)) => {
                tracing::info!(resource = %resource, "Delegation revoked");
                self.discard(&primary.subject, resource);
                ValidationOutcome::Denied(DenialReason::Revoked)
            }
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Delegation validation unavailable");
                ValidationOutcome::Unavailable(e.to_string())
            }
        }
    }

    /// Ends the delegation. The remote revocation is best effort; local
    /// state is cleared regardless.
    pub async fn logout(&self, primary: &SubjectId, resource: &ResourceId) {
        match self.store.load(primary, resource) {
            Ok(Some(stored)) => {
                if let Err(e) = self.authority.actor_logout(resource, &stored.token).await {
                    tracing::warn!(resource = %resource, error = %e, "Remote delegation logout failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Delegation store unreadable");
            }
        }
        self.discard(primary, resource);
        self.phases.lock().remove(resource);
        tracing::info!(resource = %resource, "Delegated logout");
    }

    /// Single-factor passcode check for resources without delegated authentication.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] if the passcode does not match or none is configured.
    /// - [`Error::Network`] if the settings cannot be fetched.
    pub async fn legacy_login(
        &self,
        primary: &PrimarySession,
        resource: &ResourceId,
        passcode: &str,
    ) -> Result<(), Error> {
        if primary.is_expired() {
            return Err(Error::NotAuthenticated);
        }
        let settings = self.authority.resource_settings(resource).await?;
        if settings.delegated_auth_enabled {
            return Err(Error::Config(format!(
                "resource {resource} requires delegated authentication"
            )));
        }
        match settings.legacy_passcode.as_deref() {
            Some(expected) if expected == passcode => {
                self.store.legacy().grant(resource, &primary.subject)?;
                self.set_phase(resource, DelegationPhase::Granted);
                tracing::info!(resource = %resource, "Legacy login successful");
                Ok(())
            }
            _ => {
                self.set_phase(resource, DelegationPhase::Denied);
                Err(Error::InvalidCredentials)
            }
        }
    }

    /// Route-guard entry point: feature gating, then delegated validation or
    /// the legacy check. Legacy resources never reach the remote validator.
    ///
    /// Without settings, a stored delegation is never granted (the authority
    /// alone can confirm it) and only a resource with no delegation on record
    /// falls back to the legacy check.
    pub async fn authorize(
        &self,
        primary: Option<&PrimarySession>,
        resource: &ResourceId,
    ) -> ValidationOutcome {
        let Some(active) = primary.filter(|p| !p.is_expired()) else {
            self.set_phase(resource, DelegationPhase::Denied);
            return ValidationOutcome::Denied(DenialReason::PrimaryEnded);
        };
        match self.access_mode(resource).await {
            AccessMode::Delegated { .. } => self.validate(Some(active), resource).await,
            AccessMode::Legacy => self.check_legacy(&active.subject, resource),
            AccessMode::Unavailable(reason) => match self.store.load(&active.subject, resource) {
                Ok(None) => self.check_legacy(&active.subject, resource),
                Ok(Some(_)) | Err(_) => {
                    self.set_phase(resource, DelegationPhase::Denied);
                    ValidationOutcome::Unavailable(reason)
                }
            },
        }
    }

    fn check_legacy(&self, primary: &SubjectId, resource: &ResourceId) -> ValidationOutcome {
        match self.store.legacy().check(resource, primary) {
            Ok(Some(legacy)) => {
                self.set_phase(resource, DelegationPhase::Granted);
                ValidationOutcome::Granted(DelegationSession::Legacy(legacy).view())
            }
            Ok(None) => {
                self.set_phase(resource, DelegationPhase::Denied);
                ValidationOutcome::Denied(DenialReason::NoSession)
            }
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Legacy session check failed");
                self.set_phase(resource, DelegationPhase::Denied);
                ValidationOutcome::Denied(DenialReason::NoSession)
            }
        }
    }

    /// Locally stored delegation in either format, without contacting the authority.
    #[must_use]
    pub fn current(&self, primary: &PrimarySession, resource: &ResourceId) -> Option<DelegationView> {
        if primary.is_expired() {
            return None;
        }
        let now = OffsetDateTime::now_utc();
        match self.store.load_any(&primary.subject, resource) {
            Ok(Some(session)) if session.expires_at() > now => Some(session.view()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Delegation store unreadable");
                None
            }
        }
    }

    /// Drops the delegation together with the legacy marker it kept alive.
    fn discard(&self, primary: &SubjectId, resource: &ResourceId) {
        if let Err(e) = self.store.invalidate(primary, resource) {
            tracing::warn!(resource = %resource, error = %e, "Could not delete delegation");
        }
        if let Err(e) = self.store.legacy().revoke(resource, primary) {
            tracing::warn!(resource = %resource, error = %e, "Could not clear legacy session");
        }
    }

    /// Keeps legacy-aware code paths working while resources migrate.
    fn refresh_legacy_marker(&self, resource: &ResourceId, primary: &SubjectId) {
        if let Err(e) = self.store.legacy().grant(resource, primary) {
            tracing::warn!(resource = %resource, error = %e, "Could not refresh legacy session");
        }
    }

    fn set_phase(&self, resource: &ResourceId, phase: DelegationPhase) {
        let previous = self.phases.lock().insert(resource.clone(), phase);
        tracing::debug!(resource = %resource, from = ?previous, to = ?phase, "Delegation phase");
    }
}

fn session_from_grant(
    resource: &ResourceId,
    primary: &SubjectId,
    grant: ActorGrant,
) -> Result<DelegatedSession, Error> {
    let actor = match (grant.actor_kind, grant.assistant_id) {
        (ActorKind::Chief, _) => Actor::Chief,
        (ActorKind::Assistant, Some(id)) => Actor::Assistant(id),
        (ActorKind::Assistant, None) => {
            return Err(Error::Protocol("assistant grant without assistant_id".into()));
        }
    };
    Ok(DelegatedSession {
        resource_id: resource.clone(),
        actor,
        display_name: grant.display_name,
        token: grant.token,
        session_id: grant.session_id,
        expires_at: grant.expires_at,
        can_manage_team: grant.can_manage_team,
        authenticated_by: primary.clone(),
    })
}
