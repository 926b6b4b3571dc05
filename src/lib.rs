#![doc = include_str!("../README.md")]

pub mod config;
pub mod delegation;
pub mod error;
pub mod legacy;
pub mod profile;
pub mod provider;
pub mod session;
pub mod storage;
pub mod tab;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use config::SessionConfig;
pub use delegation::{
    DelegatedAuthenticator, DelegatedLogin, DelegationAuthority, DelegationStore, DelegationView,
    ValidationOutcome,
};
#[cfg(feature = "rpc")]
pub use delegation::{AuthorityConfig, RpcAuthority};
pub use error::{BoxError, Error, ErrorKind};
pub use legacy::LegacyShim;
pub use profile::{Profile, ProfileDirectory, Role};
pub use provider::{Credential, EventKind, IdentityProvider, PrimarySession, ProviderEvent};
pub use session::{Phase, SessionManager, SessionState};
pub use storage::{KeyValueStore, MemoryStore, Storage};
pub use tab::TabContext;
pub use types::{AssistantId, ResourceId, SubjectId, TabId};
