use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use url::Url;

use super::authority::{
    ActorGrant, ActorLoginRequest, AuthorityError, DelegationAuthority, RejectionReason,
    ResourceSettings,
};
use crate::error::Error;
use crate::types::ResourceId;

/// Delegation authority endpoint configuration.
///
/// ```rust,ignore
/// use portal_session::delegation::AuthorityConfig;
///
/// let config = AuthorityConfig::new("https://api.example.com/".parse()?)
///     .with_api_key("anon-key");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorityConfig {
    pub(crate) base_url: Url,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout: Duration,
}

impl AuthorityConfig {
    /// Remote procedures are called as `POST {base_url}/rpc/<name>`.
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            api_key: None,
            timeout: Duration::from_secs(15),
        }
    }

    /// Sent as both `apikey` header and bearer token.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// URL of the remote procedure `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, name: &str) -> Result<Url, Error> {
        self.base_url
            .join(&format!("rpc/{name}"))
            .map_err(|e| Error::Config(format!("rpc endpoint {name}: {e}")))
    }
}

/// HTTP client for the delegation authority's remote procedures.
pub struct RpcAuthority {
    config: AuthorityConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct TokenParams<'a> {
    resource_id: &'a ResourceId,
    token: &'a str,
}

#[derive(Serialize)]
struct ResourceParams<'a> {
    resource_id: &'a ResourceId,
}

#[derive(Debug, Default, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RpcAuthority {
    #[must_use]
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    async fn call<B, T>(&self, name: &'static str, body: &B) -> Result<T, AuthorityError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self
            .config
            .endpoint(name)
            .map_err(|e| AuthorityError::Malformed(e.to_string()))?;

        let mut request = self.http.post(url).timeout(self.config.timeout).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthorityError::Unreachable(format!("{name}: {e}")))?;

        let response = Self::ensure_success(response, name).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| AuthorityError::Malformed(format!("{name}: {e}")))
    }

    /// Maps 4xx to a rejection and everything else unsuccessful to unreachable.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, AuthorityError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(AuthorityError::Rejected(rejection_from_body(&body)));
        }
        Err(AuthorityError::Unreachable(format!(
            "{operation}: HTTP {}",
            status.as_u16()
        )))
    }
}

fn rejection_from_body(body: &str) -> RejectionReason {
    let parsed: RpcErrorBody = serde_json::from_str(body).unwrap_or_default();
    match parsed.code.as_deref() {
        Some("resource_not_found") => RejectionReason::UnknownResource,
        Some("invalid_assistant_code") => RejectionReason::UnknownAssistant,
        Some("invalid_passcode") => RejectionReason::WrongPasscode,
        _ => RejectionReason::Other(parsed.message.unwrap_or_else(|| body.to_string())),
    }
}

/// `null` or `{"valid": false}` means invalid; anything else must be a grant.
fn grant_from_validation(value: JsonValue) -> Result<Option<ActorGrant>, AuthorityError> {
    if value.is_null() || value.get("valid").and_then(JsonValue::as_bool) == Some(false) {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| AuthorityError::Malformed(format!("actor_validate: {e}")))
}

impl DelegationAuthority for RpcAuthority {
    async fn actor_login(&self, request: &ActorLoginRequest) -> Result<ActorGrant, AuthorityError> {
        self.call("actor_login", request).await
    }

    async fn actor_validate(
        &self,
        resource: &ResourceId,
        token: &str,
    ) -> Result<Option<ActorGrant>, AuthorityError> {
        let params = TokenParams {
            resource_id: resource,
            token,
        };
        let value: JsonValue = self.call("actor_validate", &params).await?;
        grant_from_validation(value)
    }

    async fn actor_logout(&self, resource: &ResourceId, token: &str) -> Result<(), AuthorityError> {
        let params = TokenParams {
            resource_id: resource,
            token,
        };
        let _: JsonValue = self.call("actor_logout", &params).await?;
        Ok(())
    }

    async fn resource_settings(
        &self,
        resource: &ResourceId,
    ) -> Result<ResourceSettings, AuthorityError> {
        let params = ResourceParams {
            resource_id: resource,
        };
        self.call("resource_delegation_settings", &params).await
    }
}
