use std::future::Future;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{ActorKind, DeviceInfo};
use crate::error::Error;
use crate::types::{AssistantId, ResourceId};

/// Body of the `actor_login` remote procedure.
#[derive(Debug, Clone, Serialize)]
pub struct ActorLoginRequest {
    pub resource_id: ResourceId,
    pub actor_kind: ActorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_code: Option<String>,
    pub passcode: String,
    pub device: DeviceInfo,
}

/// Delegation granted (or refreshed) by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorGrant {
    pub token: String,
    pub session_id: String,
    pub actor_kind: ActorKind,
    #[serde(default)]
    pub assistant_id: Option<AssistantId>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub can_manage_team: bool,
}

/// Assistant listed under a chief's resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSummary {
    pub id: AssistantId,
    pub display_name: String,
    #[serde(default)]
    pub can_manage_team: bool,
}

/// Remotely configured delegation settings of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSettings {
    #[serde(default)]
    pub delegated_auth_enabled: bool,
    #[serde(default)]
    pub actors: Vec<ActorSummary>,
    /// Single-factor code used when delegated authentication is off.
    #[serde(default)]
    pub legacy_passcode: Option<String>,
}

/// Which factor the authority rejected. Never shown to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    UnknownResource,
    UnknownAssistant,
    WrongPasscode,
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum AuthorityError {
    #[error("rejected by delegation authority")]
    Rejected(RejectionReason),

    #[error("delegation authority unreachable: {0}")]
    Unreachable(String),

    #[error("malformed authority response: {0}")]
    Malformed(String),
}

impl From<AuthorityError> for Error {
    fn from(e: AuthorityError) -> Self {
        match e {
            AuthorityError::Rejected(_) => Self::InvalidCredentials,
            AuthorityError::Unreachable(msg) => Self::Network(msg),
            AuthorityError::Malformed(msg) => Self::Protocol(msg),
        }
    }
}

/// Remote authority that issues, validates, and revokes delegations.
pub trait DelegationAuthority: Send + Sync + 'static {
    fn actor_login(
        &self,
        request: &ActorLoginRequest,
    ) -> impl Future<Output = Result<ActorGrant, AuthorityError>> + Send;

    /// `Ok(None)` means the authority considers the token invalid.
    fn actor_validate(
        &self,
        resource: &ResourceId,
        token: &str,
    ) -> impl Future<Output = Result<Option<ActorGrant>, AuthorityError>> + Send;

    fn actor_logout(
        &self,
        resource: &ResourceId,
        token: &str,
    ) -> impl Future<Output = Result<(), AuthorityError>> + Send;

    /// Feature flag and actor list of a resource.
    fn resource_settings(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<ResourceSettings, AuthorityError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rejection_collapses_to_invalid_credentials() {
        for reason in [
            RejectionReason::UnknownResource,
            RejectionReason::UnknownAssistant,
            RejectionReason::WrongPasscode,
            RejectionReason::Other("locked".into()),
        ] {
            let err = Error::from(AuthorityError::Rejected(reason));
            assert_eq!(err.to_string(), "Invalid credentials");
        }
    }

    #[test]
    fn grant_parses_minimal_payload() {
        let grant: ActorGrant = serde_json::from_str(
            r#"{
                "token": "dtok",
                "session_id": "s1",
                "actor_kind": "chief",
                "expires_at": "2030-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(grant.actor_kind, ActorKind::Chief);
        assert!(grant.assistant_id.is_none());
        assert!(!grant.can_manage_team);
    }

    #[test]
    fn login_request_omits_missing_assistant_code() {
        let request = ActorLoginRequest {
            resource_id: "chief-1".into(),
            actor_kind: ActorKind::Chief,
            assistant_code: None,
            passcode: "1234".into(),
            device: DeviceInfo::default(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("assistant_code").is_none());
        assert_eq!(json["actor_kind"], "chief");
    }
}
