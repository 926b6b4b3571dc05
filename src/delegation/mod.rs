//! Delegated "acting-as" sessions layered on top of the Primary Session.
//!
//! A chief delegates limited access to assistants under the chief's
//! resource. Each delegation is scoped by (primary subject, resource) and is
//! only valid while both its own expiry and the Primary Session that created
//! it are still valid.

mod authenticator;
mod authority;
mod device;
#[cfg(feature = "rpc")]
mod rpc;
mod store;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{AssistantId, ResourceId, SubjectId};

pub use authenticator::{AccessMode, DelegatedAuthenticator, DelegatedLogin, ValidationOutcome};
pub use authority::{
    ActorGrant, ActorLoginRequest, ActorSummary, AuthorityError, DelegationAuthority,
    RejectionReason, ResourceSettings,
};
pub use device::{DeviceContext, DeviceInfo, MOBILE_BREAKPOINT_PX};
#[cfg(feature = "rpc")]
pub use rpc::{AuthorityConfig, RpcAuthority};
pub use store::DelegationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Chief,
    Assistant,
}

/// Who is acting under the chief's resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Chief,
    Assistant(AssistantId),
}

impl Actor {
    #[must_use]
    pub fn kind(&self) -> ActorKind {
        match self {
            Self::Chief => ActorKind::Chief,
            Self::Assistant(_) => ActorKind::Assistant,
        }
    }

    #[must_use]
    pub fn assistant_id(&self) -> Option<&AssistantId> {
        match self {
            Self::Chief => None,
            Self::Assistant(id) => Some(id),
        }
    }
}

/// Delegation issued by the remote authority after a delegated login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedSession {
    pub resource_id: ResourceId,
    pub actor: Actor,
    #[serde(default)]
    pub display_name: Option<String>,
    pub token: String,
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub can_manage_team: bool,
    /// Primary subject that performed the delegated login.
    pub authenticated_by: SubjectId,
}

impl DelegatedSession {
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Applies refreshed metadata from a successful validation. The token never changes.
    #[must_use]
    pub fn refreshed(mut self, grant: &ActorGrant) -> Self {
        self.expires_at = grant.expires_at;
        self.can_manage_team = grant.can_manage_team;
        self.session_id.clone_from(&grant.session_id);
        if grant.display_name.is_some() {
            self.display_name.clone_from(&grant.display_name);
        }
        self
    }
}

/// Single-factor session from before delegated authentication existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySession {
    pub owner: ResourceId,
    pub acting: SubjectId,
    pub granted_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// A stored delegation in either format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationSession {
    Legacy(LegacySession),
    Authenticated(DelegatedSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFormat {
    Legacy,
    Authenticated,
}

/// Format-independent view of a delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationView {
    pub resource_id: ResourceId,
    pub actor: Actor,
    pub display_name: Option<String>,
    pub expires_at: OffsetDateTime,
    pub can_manage_team: bool,
    /// Only authenticated delegations carry a token.
    pub token: Option<String>,
    pub format: SessionFormat,
}

impl DelegationSession {
    /// Normalizes either format. Legacy sessions act as the chief without team management.
    #[must_use]
    pub fn view(&self) -> DelegationView {
        match self {
            Self::Legacy(legacy) => DelegationView {
                resource_id: legacy.owner.clone(),
                actor: Actor::Chief,
                display_name: None,
                expires_at: legacy.expires_at,
                can_manage_team: false,
                token: None,
                format: SessionFormat::Legacy,
            },
            Self::Authenticated(session) => DelegationView {
                resource_id: session.resource_id.clone(),
                actor: session.actor.clone(),
                display_name: session.display_name.clone(),
                expires_at: session.expires_at,
                can_manage_team: session.can_manage_team,
                token: Some(session.token.clone()),
                format: SessionFormat::Authenticated,
            },
        }
    }

    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        match self {
            Self::Legacy(legacy) => legacy.expires_at,
            Self::Authenticated(session) => session.expires_at,
        }
    }
}

/// Per-resource delegation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelegationPhase {
    #[default]
    None,
    PendingCredentials,
    Validating,
    Granted,
    Denied,
}

/// Why a delegation does not grant access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DenialReason {
    #[display("no delegation stored")]
    NoSession,
    #[display("delegation expired")]
    Expired,
    #[display("delegation revoked")]
    Revoked,
    #[display("primary session ended")]
    PrimaryEnded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn assistant_session() -> DelegatedSession {
        DelegatedSession {
            resource_id: "chief-1".into(),
            actor: Actor::Assistant("asst-7".into()),
            display_name: Some("Front desk".into()),
            token: "dtok".into(),
            session_id: "s1".into(),
            expires_at: datetime!(2030-01-01 00:00 UTC),
            can_manage_team: false,
            authenticated_by: "u1".into(),
        }
    }

    #[test]
    fn chief_has_no_assistant_id() {
        assert_eq!(Actor::Chief.assistant_id(), None);
        assert_eq!(Actor::Chief.kind(), ActorKind::Chief);
        let assistant = Actor::Assistant("a".into());
        assert_eq!(assistant.kind(), ActorKind::Assistant);
        assert_eq!(assistant.assistant_id().map(|a| a.0.as_str()), Some("a"));
    }

    #[test]
    fn refresh_keeps_token() {
        let grant = ActorGrant {
            token: "ignored".into(),
            session_id: "s2".into(),
            actor_kind: ActorKind::Assistant,
            assistant_id: Some("asst-7".into()),
            display_name: None,
            expires_at: datetime!(2031-01-01 00:00 UTC),
            can_manage_team: true,
        };

        let refreshed = assistant_session().refreshed(&grant);

        assert_eq!(refreshed.token, "dtok");
        assert_eq!(refreshed.session_id, "s2");
        assert_eq!(refreshed.expires_at, datetime!(2031-01-01 00:00 UTC));
        assert!(refreshed.can_manage_team);
        assert_eq!(refreshed.display_name.as_deref(), Some("Front desk"));
    }

    #[test]
    fn views_normalize_both_formats() {
        let authenticated = DelegationSession::Authenticated(assistant_session()).view();
        assert_eq!(authenticated.format, SessionFormat::Authenticated);
        assert_eq!(authenticated.token.as_deref(), Some("dtok"));

        let legacy = DelegationSession::Legacy(LegacySession {
            owner: "chief-1".into(),
            acting: "u1".into(),
            granted_at: datetime!(2030-01-01 00:00 UTC),
            expires_at: datetime!(2030-01-01 04:00 UTC),
        })
        .view();
        assert_eq!(legacy.format, SessionFormat::Legacy);
        assert_eq!(legacy.actor, Actor::Chief);
        assert!(legacy.token.is_none());
        assert!(!legacy.can_manage_team);
    }

    #[test]
    fn stored_format_round_trips() {
        let session = assistant_session();
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"assistant\":\"asst-7\""));
        let parsed: DelegatedSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, session);
    }
}
