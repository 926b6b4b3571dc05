//! Domain Profile lookup and the checks that ride along with it.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BoxError, Error};
use crate::provider::{PrimarySession, ProviderMetadata};
use crate::types::SubjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Patient,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "doctor" => Ok(Self::Doctor),
            "patient" => Ok(Self::Patient),
            "admin" => Ok(Self::Admin),
            other => Err(Error::Config(format!("unknown role `{other}`"))),
        }
    }
}

/// Business-layer identity keyed by the Primary Session's subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: SubjectId,
    /// `None` means setup is incomplete, which is not the same as having no profile.
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub avatar_updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl Profile {
    #[must_use]
    pub fn new(id: SubjectId) -> Self {
        Self {
            id,
            role: None,
            display_name: None,
            avatar_url: None,
            avatar_updated_at: None,
            capabilities: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    #[must_use]
    pub fn is_setup_complete(&self) -> bool {
        self.role.is_some()
    }

    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Partial profile written by [`ProfileStore::upsert_profile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfilePatch {
    pub id: SubjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub avatar_updated_at: Option<OffsetDateTime>,
}

/// Consumer-provided profile persistence.
pub trait ProfileStore: Send + Sync + 'static {
    fn get_profile_by_id(
        &self,
        id: &SubjectId,
    ) -> impl Future<Output = Result<Option<Profile>, BoxError>> + Send;

    fn upsert_profile(&self, patch: ProfilePatch) -> impl Future<Output = Result<(), BoxError>> + Send;
}

pub trait OnboardingStatus: Send + Sync + 'static {
    fn is_onboarded(&self, id: &SubjectId) -> impl Future<Output = Result<bool, BoxError>> + Send;
}

pub trait TermsStatus: Send + Sync + 'static {
    fn needs_new_terms(&self, id: &SubjectId)
    -> impl Future<Output = Result<bool, BoxError>> + Send;

    fn accept_terms(&self, id: &SubjectId) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Everything profile resolution reads from. Implemented for any type that
/// provides all three contracts.
pub trait ProfileDirectory: ProfileStore + OnboardingStatus + TermsStatus {}

impl<T: ProfileStore + OnboardingStatus + TermsStatus> ProfileDirectory for T {}

/// Outcome of resolving the Domain Profile for a session. Never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileResolution {
    pub profile: Option<Profile>,
    pub setup_incomplete: bool,
    pub onboarding_pending: bool,
    pub needs_terms: bool,
}

impl ProfileResolution {
    /// No usable profile: setup is treated as incomplete.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            profile: None,
            setup_incomplete: true,
            onboarding_pending: false,
            needs_terms: false,
        }
    }
}

/// Fetches and enriches the Domain Profile.
pub struct ProfileResolver<D> {
    directory: D,
    terms_role: Role,
    timeout: Duration,
}

impl<D: ProfileDirectory> ProfileResolver<D> {
    #[must_use]
    pub fn new(directory: D, terms_role: Role, timeout: Duration) -> Self {
        Self {
            directory,
            terms_role,
            timeout,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Resolves the profile for `session`, bounded by the configured timeout.
    ///
    /// Failures degrade: a missing or unreachable profile yields
    /// [`ProfileResolution::missing`], an unknown onboarding status counts as
    /// pending, an unknown terms status counts as must-accept.
    pub async fn resolve(&self, session: &PrimarySession) -> ProfileResolution {
        match tokio::time::timeout(self.timeout, self.resolve_inner(session)).await {
            Ok(resolution) => resolution,
            Err(_) => {
                tracing::warn!(
                    subject = %session.subject,
                    timeout = ?self.timeout,
                    "Profile resolution timed out"
                );
                ProfileResolution::missing()
            }
        }
    }

    async fn resolve_inner(&self, session: &PrimarySession) -> ProfileResolution {
        let id = &session.subject;
        let profile = match self.directory.get_profile_by_id(id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::info!(subject = %id, "No profile yet");
                return ProfileResolution::missing();
            }
            Err(e) => {
                tracing::warn!(subject = %id, error = %e, "Profile fetch failed");
                return ProfileResolution::missing();
            }
        };

        let profile = self.sync_avatar(&session.metadata, profile).await;

        let Some(role) = profile.role else {
            return ProfileResolution {
                profile: Some(profile),
                ..ProfileResolution::missing()
            };
        };

        let (onboarding_pending, needs_terms) =
            tokio::join!(self.onboarding_pending(id), self.needs_terms(id, role));

        ProfileResolution {
            profile: Some(profile),
            setup_incomplete: false,
            onboarding_pending,
            needs_terms,
        }
    }

    /// Writes a newer provider-side avatar back to the profile store, then re-fetches once.
    async fn sync_avatar(&self, metadata: &ProviderMetadata, profile: Profile) -> Profile {
        if !has_newer_avatar(metadata, &profile) {
            return profile;
        }
        let patch = ProfilePatch {
            id: profile.id.clone(),
            avatar_url: metadata.avatar_url.clone(),
            avatar_updated_at: metadata.avatar_updated_at,
        };
        if let Err(e) = self.directory.upsert_profile(patch).await {
            tracing::warn!(subject = %profile.id, error = %e, "Avatar write-back failed");
            return profile;
        }
        match self.directory.get_profile_by_id(&profile.id).await {
            Ok(Some(refreshed)) => refreshed,
            Ok(None) => profile,
            Err(e) => {
                tracing::warn!(subject = %profile.id, error = %e, "Profile re-fetch failed");
                profile
            }
        }
    }

    async fn onboarding_pending(&self, id: &SubjectId) -> bool {
        match self.directory.is_onboarded(id).await {
            Ok(onboarded) => !onboarded,
            Err(e) => {
                tracing::warn!(subject = %id, error = %e, "Onboarding check failed");
                true
            }
        }
    }

    async fn needs_terms(&self, id: &SubjectId, role: Role) -> bool {
        if role != self.terms_role {
            return false;
        }
        match self.directory.needs_new_terms(id).await {
            Ok(needed) => needed,
            Err(e) => {
                tracing::warn!(subject = %id, error = %e, "Terms check failed");
                true
            }
        }
    }
}

fn has_newer_avatar(metadata: &ProviderMetadata, profile: &Profile) -> bool {
    let Some(url) = metadata.avatar_url.as_deref() else {
        return false;
    };
    if profile.avatar_url.as_deref() == Some(url) {
        return false;
    }
    match (metadata.avatar_updated_at, profile.avatar_updated_at) {
        (Some(remote), Some(cached)) => remote > cached,
        (Some(_), None) => true,
        (None, _) => profile.avatar_url.is_none(),
    }
}
