use crate::delegation::DenialReason;

/// Boxed error returned by consumer-provided collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A remote collaborator could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials were rejected. Deliberately carries no detail about which factor was wrong.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Delegation denied: {0}")]
    DelegationDenied(DenialReason),

    /// An operation needed a Primary Session and there was none.
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Identity provider error: {0}")]
    Provider(String),

    /// A consumer-provided store or status source failed.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Corrupt stored state under `{key}`: {detail}")]
    CorruptState { key: String, detail: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A remote collaborator answered with an unexpected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Coarse error taxonomy used to pick user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    InvalidCredential,
    InconsistentState,
    Configuration,
    Protocol,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Backend(_) => ErrorKind::Transient,
            Self::InvalidCredentials | Self::DelegationDenied(_) | Self::NotAuthenticated => {
                ErrorKind::InvalidCredential
            }
            Self::CorruptState { .. } | Self::Storage(_) => ErrorKind::InconsistentState,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Provider(_) | Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether retrying the same call can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
