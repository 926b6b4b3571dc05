//! Contract expected from the external identity provider.

use std::future::Future;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use url::Url;

use crate::error::Error;
use crate::types::{SubjectId, TokenFingerprint};

/// Session event kinds emitted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

impl EventKind {
    /// Critical kinds skip debouncing.
    #[must_use]
    pub fn is_critical(self) -> bool {
        matches!(self, Self::InitialSession | Self::SignedIn | Self::SignedOut)
    }
}

/// Profile metadata the provider keeps next to the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub avatar_updated_at: Option<OffsetDateTime>,
}

/// The authenticated identity of this tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimarySession {
    pub subject: SubjectId,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub metadata: ProviderMetadata,
    /// Event that produced this session, if it came from the event stream.
    #[serde(default)]
    pub origin: Option<EventKind>,
}

impl PrimarySession {
    #[must_use]
    pub fn fingerprint(&self) -> TokenFingerprint {
        TokenFingerprint::of(&self.access_token)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

/// One entry of the provider's session-changed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub kind: EventKind,
    pub session: Option<PrimarySession>,
}

impl ProviderEvent {
    #[must_use]
    pub fn new(kind: EventKind, session: Option<PrimarySession>) -> Self {
        Self { kind, session }
    }
}

/// Password credential for [`IdentityProvider::sign_in_with_password`].
#[derive(Debug, Clone)]
pub struct Credential {
    pub email: String,
    pub password: String,
}

impl Credential {
    #[must_use]
    pub fn password(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Tokens handed to [`IdentityProvider::set_session`].
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InvalidCredentials => Self::InvalidCredentials,
            ProviderError::Unavailable(msg) => Self::Network(msg),
            ProviderError::Other(msg) => Self::Provider(msg),
        }
    }
}

/// External identity provider.
///
/// The provider owns its own token persistence. The session manager only
/// reacts to what it reports.
pub trait IdentityProvider: Send + Sync + 'static {
    fn sign_in_with_password(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<PrimarySession, ProviderError>> + Send;

    /// Starts a redirect-based sign-in. Returns the URL the host should navigate to.
    fn sign_in_with_redirect(&self) -> impl Future<Output = Result<Url, ProviderError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), ProviderError>> + Send;

    fn get_session(
        &self,
    ) -> impl Future<Output = Result<Option<PrimarySession>, ProviderError>> + Send;

    /// Subscribes to session changes. Dropping the receiver unsubscribes.
    fn on_session_change(&self) -> broadcast::Receiver<ProviderEvent>;

    fn exchange_code_for_session(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<PrimarySession, ProviderError>> + Send;

    fn set_session(
        &self,
        tokens: &SessionTokens,
    ) -> impl Future<Output = Result<PrimarySession, ProviderError>> + Send;

    fn refresh_session(&self) -> impl Future<Output = Result<PrimarySession, ProviderError>> + Send;
}
