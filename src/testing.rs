//! In-memory collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use url::Url;

use crate::delegation::{
    ActorGrant, ActorKind, ActorLoginRequest, AuthorityError, DelegationAuthority, DeviceInfo,
    RejectionReason, ResourceSettings,
};
use crate::error::BoxError;
use crate::profile::{OnboardingStatus, Profile, ProfilePatch, ProfileStore, TermsStatus};
use crate::provider::{
    Credential, EventKind, IdentityProvider, PrimarySession, ProviderError, ProviderEvent,
    ProviderMetadata, SessionTokens,
};
use crate::types::{ResourceId, SubjectId};

pub(crate) fn session_for(subject: &str, token: &str) -> PrimarySession {
    PrimarySession {
        subject: subject.into(),
        access_token: token.into(),
        refresh_token: Some(format!("refresh-{token}")),
        expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        metadata: ProviderMetadata::default(),
        origin: None,
    }
}

/// Like [`session_for`], but expired an hour ago.
pub(crate) fn expired_session_for(subject: &str, token: &str) -> PrimarySession {
    PrimarySession {
        expires_at: OffsetDateTime::now_utc() - time::Duration::hours(1),
        ..session_for(subject, token)
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Identity provider

#[derive(Default)]
struct ProviderState {
    stored: Mutex<Option<PrimarySession>>,
    refreshed: Mutex<Option<Result<PrimarySession, ProviderError>>>,
    hang_session_check: AtomicBool,
    fail_sign_out: AtomicBool,
    get_session_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

/// Scriptable identity provider. Clones share state and the event channel.
#[derive(Clone)]
pub(crate) struct FakeProvider {
    state: Arc<ProviderState>,
    events: broadcast::Sender<ProviderEvent>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::default(),
            events,
        }
    }
}

impl FakeProvider {
    pub(crate) const EMAIL: &'static str = "doc@example.com";
    pub(crate) const PASSWORD: &'static str = "hunter2";

    /// What `get_session` will report.
    pub(crate) fn store_session(&self, session: Option<PrimarySession>) {
        *self.state.stored.lock() = session;
    }

    pub(crate) fn hang_session_check(&self) {
        self.state.hang_session_check.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_sign_out(&self) {
        self.state.fail_sign_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn script_refresh(&self, result: Result<PrimarySession, ProviderError>) {
        *self.state.refreshed.lock() = Some(result);
    }

    pub(crate) fn emit(&self, kind: EventKind, session: Option<PrimarySession>) {
        // No receivers is fine: the manager may not have started yet.
        let _ = self.events.send(ProviderEvent::new(kind, session));
    }

    pub(crate) fn get_session_calls(&self) -> usize {
        self.state.get_session_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_out_calls(&self) -> usize {
        self.state.sign_out_calls.load(Ordering::SeqCst)
    }
}

impl IdentityProvider for FakeProvider {
    async fn sign_in_with_password(
        &self,
        credential: &Credential,
    ) -> Result<PrimarySession, ProviderError> {
        if credential.email == Self::EMAIL && credential.password == Self::PASSWORD {
            let session = session_for("u1", "tok-password");
            *self.state.stored.lock() = Some(session.clone());
            Ok(session)
        } else {
            Err(ProviderError::InvalidCredentials)
        }
    }

    async fn sign_in_with_redirect(&self) -> Result<Url, ProviderError> {
        Url::parse("https://idp.example/authorize").map_err(|e| ProviderError::Other(e.to_string()))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        bump(&self.state.sign_out_calls);
        if self.state.fail_sign_out.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("connection reset".into()));
        }
        *self.state.stored.lock() = None;
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<PrimarySession>, ProviderError> {
        bump(&self.state.get_session_calls);
        if self.state.hang_session_check.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.state.stored.lock().clone())
    }

    fn on_session_change(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    async fn exchange_code_for_session(&self, code: &str) -> Result<PrimarySession, ProviderError> {
        if code == "good-code" {
            Ok(session_for("u1", "tok-redirect"))
        } else {
            Err(ProviderError::InvalidCredentials)
        }
    }

    async fn set_session(&self, tokens: &SessionTokens) -> Result<PrimarySession, ProviderError> {
        Ok(session_for("u1", &tokens.access_token))
    }

    async fn refresh_session(&self) -> Result<PrimarySession, ProviderError> {
        self.state
            .refreshed
            .lock()
            .take()
            .unwrap_or_else(|| Err(ProviderError::Other("no refresh scripted".into())))
    }
}

// ---------------------------------------------------------------------------
// Profile directory

#[derive(Default)]
struct DirectoryState {
    profiles: Mutex<HashMap<SubjectId, Profile>>,
    fetch_delay: Mutex<Duration>,
    fail_profile_fetch: AtomicBool,
    fail_status_checks: AtomicBool,
    onboarded: AtomicBool,
    needs_terms: AtomicBool,
    profile_fetches: AtomicUsize,
    upsert_calls: AtomicUsize,
    onboarding_calls: AtomicUsize,
    terms_calls: AtomicUsize,
}

/// Profile store plus onboarding and terms sources. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeDirectory {
    state: Arc<DirectoryState>,
}

impl FakeDirectory {
    pub(crate) fn insert(&self, profile: Profile) {
        self.state.profiles.lock().insert(profile.id.clone(), profile);
    }

    pub(crate) fn fail_profile_fetch(&self, fail: bool) {
        self.state.fail_profile_fetch.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_status_checks(&self, fail: bool) {
        self.state.fail_status_checks.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_onboarded(&self, onboarded: bool) {
        self.state.onboarded.store(onboarded, Ordering::SeqCst);
    }

    pub(crate) fn set_needs_terms(&self, needed: bool) {
        self.state.needs_terms.store(needed, Ordering::SeqCst);
    }

    /// Every profile fetch sleeps this long first.
    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.state.fetch_delay.lock() = delay;
    }

    pub(crate) fn profile_fetches(&self) -> usize {
        self.state.profile_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn upsert_calls(&self) -> usize {
        self.state.upsert_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn onboarding_calls(&self) -> usize {
        self.state.onboarding_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn terms_calls(&self) -> usize {
        self.state.terms_calls.load(Ordering::SeqCst)
    }
}

impl ProfileStore for FakeDirectory {
    async fn get_profile_by_id(&self, id: &SubjectId) -> Result<Option<Profile>, BoxError> {
        bump(&self.state.profile_fetches);
        let delay = *self.state.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_profile_fetch.load(Ordering::SeqCst) {
            return Err("profile store offline".into());
        }
        Ok(self.state.profiles.lock().get(id).cloned())
    }

    async fn upsert_profile(&self, patch: ProfilePatch) -> Result<(), BoxError> {
        bump(&self.state.upsert_calls);
        let mut profiles = self.state.profiles.lock();
        let profile = profiles
            .entry(patch.id.clone())
            .or_insert_with(|| Profile::new(patch.id.clone()));
        if patch.avatar_url.is_some() {
            profile.avatar_url = patch.avatar_url;
        }
        if patch.avatar_updated_at.is_some() {
            profile.avatar_updated_at = patch.avatar_updated_at;
        }
        Ok(())
    }
}

impl OnboardingStatus for FakeDirectory {
    async fn is_onboarded(&self, _id: &SubjectId) -> Result<bool, BoxError> {
        bump(&self.state.onboarding_calls);
        if self.state.fail_status_checks.load(Ordering::SeqCst) {
            return Err("onboarding service offline".into());
        }
        Ok(self.state.onboarded.load(Ordering::SeqCst))
    }
}

impl TermsStatus for FakeDirectory {
    async fn needs_new_terms(&self, _id: &SubjectId) -> Result<bool, BoxError> {
        bump(&self.state.terms_calls);
        if self.state.fail_status_checks.load(Ordering::SeqCst) {
            return Err("terms service offline".into());
        }
        Ok(self.state.needs_terms.load(Ordering::SeqCst))
    }

    async fn accept_terms(&self, _id: &SubjectId) -> Result<(), BoxError> {
        if self.state.fail_status_checks.load(Ordering::SeqCst) {
            return Err("terms service offline".into());
        }
        self.state.needs_terms.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delegation authority

const CHIEF_RESOURCE: &str = "chief-1";
const CHIEF_PASSCODE: &str = "1234";
const ASSISTANT_CODE: &str = "ASST1";
const ASSISTANT_PASSCODE: &str = "4321";
const ASSISTANT_ID: &str = "asst-7";

/// Authority serving a single resource, `chief-1`.
pub(crate) struct FakeAuthority {
    settings: ResourceSettings,
    issued: Mutex<HashMap<String, ActorGrant>>,
    revoked: AtomicBool,
    unreachable: AtomicBool,
    last_device: Mutex<Option<DeviceInfo>>,
    login_calls: AtomicUsize,
    validate_calls: AtomicUsize,
}

impl FakeAuthority {
    fn with_settings(settings: ResourceSettings) -> Self {
        Self {
            settings,
            issued: Mutex::new(HashMap::new()),
            revoked: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            last_device: Mutex::new(None),
            login_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
        }
    }

    /// Delegated authentication on; chief passcode `1234`, assistant `ASST1`/`4321`.
    pub(crate) fn delegated() -> Self {
        Self::with_settings(ResourceSettings {
            delegated_auth_enabled: true,
            actors: Vec::new(),
            legacy_passcode: None,
        })
    }

    /// Delegated authentication off, single-factor `passcode`.
    pub(crate) fn legacy(passcode: &str) -> Self {
        Self::with_settings(ResourceSettings {
            delegated_auth_enabled: false,
            actors: Vec::new(),
            legacy_passcode: Some(passcode.into()),
        })
    }

    pub(crate) fn revoke_all(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn last_device(&self) -> Option<DeviceInfo> {
        self.last_device.lock().clone()
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> Result<(), AuthorityError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(AuthorityError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn grant_for(&self, request: &ActorLoginRequest) -> Result<ActorGrant, RejectionReason> {
        if request.resource_id.0 != CHIEF_RESOURCE {
            return Err(RejectionReason::UnknownResource);
        }
        let (assistant_id, can_manage_team) = match request.actor_kind {
            ActorKind::Chief if request.passcode == CHIEF_PASSCODE => (None, true),
            ActorKind::Chief => return Err(RejectionReason::WrongPasscode),
            ActorKind::Assistant => {
                if request.assistant_code.as_deref() != Some(ASSISTANT_CODE) {
                    return Err(RejectionReason::UnknownAssistant);
                }
                if request.passcode != ASSISTANT_PASSCODE {
                    return Err(RejectionReason::WrongPasscode);
                }
                (Some(ASSISTANT_ID.into()), false)
            }
        };
        let serial = self.login_calls();
        Ok(ActorGrant {
            token: format!("dtok-{serial}"),
            session_id: format!("dsess-{serial}"),
            actor_kind: request.actor_kind,
            assistant_id,
            display_name: None,
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
            can_manage_team,
        })
    }
}

impl DelegationAuthority for FakeAuthority {
    async fn actor_login(&self, request: &ActorLoginRequest) -> Result<ActorGrant, AuthorityError> {
        bump(&self.login_calls);
        self.reachable()?;
        *self.last_device.lock() = Some(request.device.clone());
        let grant = self.grant_for(request).map_err(AuthorityError::Rejected)?;
        self.issued.lock().insert(grant.token.clone(), grant.clone());
        Ok(grant)
    }

    async fn actor_validate(
        &self,
        _resource: &ResourceId,
        token: &str,
    ) -> Result<Option<ActorGrant>, AuthorityError> {
        bump(&self.validate_calls);
        self.reachable()?;
        if self.revoked.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.issued.lock().get(token).map(|grant| ActorGrant {
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(8),
            ..grant.clone()
        }))
    }

    async fn actor_logout(&self, _resource: &ResourceId, token: &str) -> Result<(), AuthorityError> {
        self.reachable()?;
        self.issued.lock().remove(token);
        Ok(())
    }

    async fn resource_settings(
        &self,
        _resource: &ResourceId,
    ) -> Result<ResourceSettings, AuthorityError> {
        self.reachable()?;
        Ok(self.settings.clone())
    }
}
