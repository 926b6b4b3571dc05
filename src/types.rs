use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use derive_more::{Display, From, FromStr, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity-provider subject identifier (the `sub` of a Primary Session).
///
/// Also the key of the Domain Profile.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
    FromStr,
)]
#[serde(transparent)]
pub struct SubjectId(pub String);

/// Identifier of a chief's resource that delegated actors act under.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
    FromStr,
)]
#[serde(transparent)]
pub struct ResourceId(pub String);

/// Server-issued identifier of an assistant under a chief's resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct AssistantId(pub String);

/// Per-tab identifier. Never sent to a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct TabId(pub String);

/// Short digest of an access token.
///
/// Lets the session manager recognise a token it already accepted without
/// keeping a second copy of the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct TokenFingerprint(String);

impl TokenFingerprint {
    /// `BASE64URL(SHA256(token)[..12])`
    #[must_use]
    pub fn of(token: &str) -> Self {
        let hash = Sha256::digest(token.as_bytes());
        Self(URL_SAFE_NO_PAD.encode(&hash[..12]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for AssistantId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
