use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use url::Url;

use super::dispatch::EventQueue;
use super::state::{Action, Admission, SessionState, admit};
use crate::config::SessionConfig;
use crate::delegation::DelegationStore;
use crate::error::Error;
use crate::legacy::LegacyShim;
use crate::profile::{ProfileDirectory, ProfileResolver};
use crate::provider::{
    Credential, IdentityProvider, PrimarySession, ProviderError, ProviderEvent, SessionTokens,
};
use crate::storage::Storage;
use crate::tab::{TAB_ID_KEY, TabContext};

/// Owns the canonical [`SessionState`] of one tab.
///
/// Cheap to clone; clones share the same state. Call [`start`](Self::start)
/// once from inside a tokio runtime, then read state through
/// [`subscribe`](Self::subscribe) or [`snapshot`](Self::snapshot).
///
/// ```rust,ignore
/// let manager = SessionManager::new(provider, directory, Storage::in_memory(), SessionConfig::new())?;
/// manager.start();
///
/// let mut state = manager.subscribe();
/// state.wait_for(|s| !s.loading).await?;
/// ```
pub struct SessionManager<P, D> {
    inner: Arc<Inner<P, D>>,
}

impl<P, D> Clone for SessionManager<P, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<P, D> {
    provider: P,
    resolver: ProfileResolver<D>,
    storage: Storage,
    delegations: DelegationStore,
    tab: TabContext,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    mounted: AtomicBool,
    shutdown: Notify,
}

impl<P: IdentityProvider, D: ProfileDirectory> SessionManager<P, D> {
    /// Delegations and legacy markers live in origin-scoped storage, the tab
    /// identity in tab-scoped storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the tab identity cannot be read or created.
    pub fn new(
        provider: P,
        directory: D,
        storage: Storage,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let tab = TabContext::from_store(storage.tab.as_ref())?;
        let legacy =
            LegacyShim::new(Arc::clone(&storage.origin)).with_ttl(config.legacy_session_ttl);
        let delegations = DelegationStore::new(Arc::clone(&storage.origin)).with_legacy(legacy);
        let resolver = ProfileResolver::new(directory, config.terms_role, config.profile_timeout);
        let (state, _) = watch::channel(SessionState::default());

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                resolver,
                storage,
                delegations,
                tab,
                config,
                state,
                mounted: AtomicBool::new(true),
                shutdown: Notify::new(),
            }),
        })
    }

    /// Current state, cloned.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Identity and visibility of this tab.
    #[must_use]
    pub fn tab(&self) -> &TabContext {
        &self.inner.tab
    }

    /// Store shared with [`DelegatedAuthenticator`](crate::delegation::DelegatedAuthenticator)s.
    #[must_use]
    pub fn delegations(&self) -> &DelegationStore {
        &self.inner.delegations
    }

    /// Configuration the manager was built with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// False once [`unmount`](Self::unmount) was called.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::Acquire)
    }

    /// Enters `Initializing`, subscribes to provider events, and schedules the
    /// explicit session check. Returns the event loop's handle.
    pub fn start(&self) -> JoinHandle<()> {
        self.dispatch(Action::Start);
        let events = self.inner.provider.on_session_change();

        let checker = self.clone();
        let delay = self.inner.config.session_check_delay;
        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                checker.check_current_session().await;
            }
            .instrument(self.span()),
        );

        let listener = self.clone();
        tokio::spawn(async move { listener.listen(events).await }.instrument(self.span()))
    }

    /// Stops the event loop. Results of operations still in flight are discarded.
    pub fn unmount(&self) {
        if self.inner.mounted.swap(false, Ordering::AcqRel) {
            self.inner.shutdown.notify_one();
            tracing::debug!(tab = %self.inner.tab.id(), "Session manager unmounted");
        }
    }

    /// Applies one provider event right away, bypassing the debounce lane.
    pub async fn handle_event(&self, event: ProviderEvent) {
        if let Some((session, epoch)) = self.admit_event(event) {
            self.process(session, epoch).await;
        }
    }

    /// Asks the provider for its current session, unless the event path has
    /// already initialized the manager.
    ///
    /// A missing session, a provider failure, or exceeding the configured
    /// timeout all resolve to anonymous.
    pub async fn check_current_session(&self) {
        if !self.is_mounted() {
            return;
        }
        let mut claimed = None;
        self.inner.state.send_if_modified(|state| {
            if state.initialized {
                return false;
            }
            *state = mem::take(state).reduce(Action::ProcessingStarted);
            claimed = Some(state.epoch);
            true
        });
        let Some(epoch) = claimed else {
            tracing::debug!("Already initialized, skipping session check");
            return;
        };

        let mut claim = Claim {
            manager: self,
            epoch,
            settled: false,
        };
        let timeout = self.inner.config.session_check_timeout;
        let checked = tokio::time::timeout(timeout, self.inner.provider.get_session()).await;
        claim.settle();

        match checked {
            Ok(Ok(Some(session))) if session.is_expired() => {
                tracing::debug!(subject = %session.subject, "Current session already expired");
            }
            Ok(Ok(Some(session))) => return self.process(session, epoch).await,
            Ok(Ok(None)) => tracing::debug!("No current session"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Session check failed"),
            Err(_) => tracing::warn!(timeout = ?timeout, "Session check timed out"),
        }
        self.dispatch(Action::InitFailed { epoch });
    }

    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] if the provider rejects the credential.
    /// - [`Error::Network`] / [`Error::Provider`] for other provider failures,
    ///   including a session that has already expired.
    #[tracing::instrument(name = "session", skip_all, fields(tab = %self.inner.tab.id()))]
    pub async fn sign_in(&self, credential: &Credential) -> Result<(), Error> {
        let _operation = Operation::start(self);
        let session = self
            .inner
            .provider
            .sign_in_with_password(credential)
            .await
            .inspect_err(|e| log_sign_in_failure("password", e))?;
        self.accept(session).await?;
        tracing::info!("Signed in");
        Ok(())
    }

    /// Starts a redirect sign-in and returns where to navigate. The session
    /// arrives later through the event stream or
    /// [`complete_redirect`](Self::complete_redirect).
    ///
    /// # Errors
    ///
    /// Provider failures, converted into [`Error`].
    pub async fn sign_in_with_redirect(&self) -> Result<Url, Error> {
        let url = self.inner.provider.sign_in_with_redirect().await?;
        tracing::info!(host = url.host_str().unwrap_or_default(), "Redirect sign-in started");
        Ok(url)
    }

    /// Exchanges the redirect's authorization code and processes the session
    /// like [`sign_in`](Self::sign_in).
    ///
    /// # Errors
    ///
    /// Same as [`sign_in`](Self::sign_in).
    #[tracing::instrument(name = "session", skip_all, fields(tab = %self.inner.tab.id()))]
    pub async fn complete_redirect(&self, code: &str) -> Result<(), Error> {
        let _operation = Operation::start(self);
        let session = self
            .inner
            .provider
            .exchange_code_for_session(code)
            .await
            .inspect_err(|e| log_sign_in_failure("redirect", e))?;
        self.accept(session).await?;
        tracing::info!("Signed in via redirect");
        Ok(())
    }

    /// Hands previously issued tokens back to the provider.
    ///
    /// # Errors
    ///
    /// Same as [`sign_in`](Self::sign_in).
    #[tracing::instrument(name = "session", skip_all, fields(tab = %self.inner.tab.id()))]
    pub async fn restore(&self, tokens: &SessionTokens) -> Result<(), Error> {
        let _operation = Operation::start(self);
        let session = self
            .inner
            .provider
            .set_session(tokens)
            .await
            .inspect_err(|e| log_sign_in_failure("restore", e))?;
        self.accept(session).await?;
        tracing::info!("Session restored");
        Ok(())
    }

    /// Signs out. Never fails: the remote call is best effort and local state
    /// is cleared either way.
    #[tracing::instrument(name = "session", skip_all, fields(tab = %self.inner.tab.id()))]
    pub async fn sign_out(&self) {
        let _operation = Operation::start(self);
        if let Err(e) = self.inner.provider.sign_out().await {
            tracing::warn!(error = %e, "Remote sign-out failed, clearing local state anyway");
        }
        match self.inner.delegations.clear_all() {
            Ok(removed) => tracing::debug!(removed, "Cleared delegations"),
            Err(e) => tracing::warn!(error = %e, "Could not clear delegations"),
        }
        self.clear_tab_storage();
        self.dispatch(Action::Cleared);
        tracing::info!("Signed out");
    }

    /// Re-resolves the profile of the current session. No-op when anonymous.
    #[tracing::instrument(name = "session", skip_all, fields(tab = %self.inner.tab.id()))]
    pub async fn refresh_profile(&self) {
        let state = self.snapshot();
        let Some(session) = state.session else {
            tracing::debug!("No session, profile refresh skipped");
            return;
        };
        let resolution = self.inner.resolver.resolve(&session).await;
        self.dispatch(Action::ProfileRefreshed {
            subject: session.subject,
            resolution,
            epoch: state.epoch,
        });
    }

    /// Records acceptance of the outstanding legal terms.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAuthenticated`] without a session.
    /// - [`Error::Backend`] if the terms source fails.
    pub async fn accept_terms(&self) -> Result<(), Error> {
        let subject = self
            .snapshot()
            .session
            .map(|s| s.subject)
            .ok_or(Error::NotAuthenticated)?;
        self.inner
            .resolver
            .directory()
            .accept_terms(&subject)
            .await
            .map_err(|e| Error::Backend(format!("accept terms: {e}")))?;
        self.dispatch(Action::TermsAccepted);
        tracing::info!(subject = %subject, "Terms accepted");
        Ok(())
    }

    /// Records tab visibility. Coming back to the foreground with an expired
    /// session refreshes it.
    pub async fn set_tab_hidden(&self, hidden: bool) {
        let was_hidden = self.inner.tab.set_hidden(hidden);
        if hidden || !was_hidden {
            return;
        }
        let Some(session) = self.snapshot().session else {
            return;
        };
        if !session.is_expired() {
            return;
        }
        self.refresh_expired(session)
            .instrument(self.span())
            .await;
    }

    async fn refresh_expired(&self, session: PrimarySession) {
        tracing::info!(subject = %session.subject, "Session expired in background, refreshing");
        let _operation = Operation::start(self);
        match self.inner.provider.refresh_session().await {
            Ok(fresh) if fresh.is_expired() => {
                tracing::warn!("Refresh returned an expired session");
                self.end_session();
            }
            Ok(fresh) if fresh.subject == session.subject => {
                self.dispatch(Action::TokenUpdated(fresh));
            }
            Ok(fresh) => {
                if let Err(e) = self.accept(fresh).await {
                    tracing::warn!(error = %e, "Refreshed session not accepted");
                }
            }
            Err(ProviderError::Unavailable(msg)) => {
                tracing::warn!(error = %msg, "Refresh unavailable, keeping session");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Refresh rejected");
                self.end_session();
            }
        }
    }

    async fn listen(&self, mut events: broadcast::Receiver<ProviderEvent>) {
        let mut queue = EventQueue::new(self.inner.config.debounce);
        loop {
            let deadline = queue.deadline();
            tokio::select! {
                () = self.inner.shutdown.notified() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Some(event) = queue.offer(event, Instant::now()) {
                            self.spawn_event(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Provider events lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Provider event stream closed");
                        break;
                    }
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(event) = queue.take_due(Instant::now()) {
                        self.spawn_event(event);
                    }
                }
            }
        }
    }

    /// Admission runs inline so events are gated in arrival order; only
    /// profile resolution moves to its own task.
    fn spawn_event(&self, event: ProviderEvent) {
        if let Some((session, epoch)) = self.admit_event(event) {
            let this = self.clone();
            tokio::spawn(async move { this.process(session, epoch).await }.instrument(self.span()));
        }
    }

    /// Runs the admission gate and claims processing atomically. Returns the
    /// session to process and the epoch it was claimed under.
    fn admit_event(&self, event: ProviderEvent) -> Option<(PrimarySession, u64)> {
        if !self.is_mounted() {
            return None;
        }
        let hidden = self.inner.tab.is_hidden();
        let kind = event.kind;
        let mut decision = None;
        self.inner.state.send_if_modified(|state| {
            let admission = admit(state, &event, hidden);
            let claimed = matches!(admission, Admission::Process(_));
            if claimed {
                *state = mem::take(state).reduce(Action::ProcessingStarted);
            }
            decision = Some((admission, state.epoch));
            claimed
        });
        let (admission, epoch) = decision?;

        match admission {
            Admission::Process(session) => Some((session, epoch)),
            Admission::UpdateToken(session) => {
                tracing::debug!(subject = %session.subject, kind = ?kind, "Token updated in place");
                self.dispatch(Action::TokenUpdated(session));
                None
            }
            Admission::Clear => {
                self.end_session();
                None
            }
            Admission::Drop(reason) => {
                tracing::debug!(kind = ?kind, reason = ?reason, "Provider event dropped");
                None
            }
        }
    }

    /// Claims processing and resolves a session handed over by the provider.
    async fn accept(&self, session: PrimarySession) -> Result<(), Error> {
        if session.is_expired() {
            tracing::warn!(subject = %session.subject, "Provider returned an expired session");
            return Err(Error::Provider("session already expired".into()));
        }
        if !self.is_mounted() {
            return Ok(());
        }
        let mut epoch = 0;
        self.inner.state.send_modify(|state| {
            *state = mem::take(state).reduce(Action::ProcessingStarted);
            epoch = state.epoch;
        });
        self.process(session, epoch).await;
        Ok(())
    }

    /// Resolves the profile for a claimed session and publishes the result.
    async fn process(&self, session: PrimarySession, epoch: u64) {
        let mut claim = Claim {
            manager: self,
            epoch,
            settled: false,
        };
        let resolution = self.inner.resolver.resolve(&session).await;
        claim.settle();

        if self.inner.state.borrow().epoch != epoch {
            tracing::debug!(subject = %session.subject, "Discarding result from before sign-out");
            return;
        }
        let subject = session.subject.clone();
        let expired = session.is_expired();
        let setup_incomplete = resolution.setup_incomplete;
        if !self.dispatch(Action::Resolved {
            session,
            resolution,
            epoch,
        }) {
            return;
        }
        if expired {
            tracing::warn!(subject = %subject, "Session expired while resolving its profile");
        } else {
            tracing::info!(subject = %subject, setup_incomplete, "Session accepted");
        }
    }

    /// Clears the Primary Session and the delegations it created.
    fn end_session(&self) {
        let previous = self.inner.state.borrow().session.as_ref().map(|s| s.subject.clone());
        self.dispatch(Action::Cleared);
        let Some(subject) = previous else {
            return;
        };
        match self.inner.delegations.clear_for_primary(&subject) {
            Ok(removed) => tracing::info!(subject = %subject, removed, "Session ended"),
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "Could not clear delegations");
            }
        }
    }

    /// Removes every tab-scoped key except the tab identity.
    fn clear_tab_storage(&self) {
        let store = self.inner.storage.tab.as_ref();
        let result = store.keys().and_then(|keys| {
            keys.iter()
                .filter(|key| key.as_str() != TAB_ID_KEY)
                .try_for_each(|key| store.remove(key))
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "Could not clear tab storage");
        }
    }

    /// Applies `action` unless the manager was unmounted.
    fn dispatch(&self, action: Action) -> bool {
        if !self.is_mounted() {
            tracing::debug!("Discarding state update after unmount");
            return false;
        }
        self.inner
            .state
            .send_modify(|state| *state = mem::take(state).reduce(action));
        true
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("session", tab = %self.inner.tab.id())
    }
}

fn log_sign_in_failure(method: &'static str, error: &ProviderError) {
    match error {
        ProviderError::InvalidCredentials => tracing::info!(method, "Sign-in rejected"),
        other => tracing::warn!(method, error = %other, "Sign-in failed"),
    }
}

/// Keeps `loading` raised for an identity-changing operation; lowered on drop,
/// including on early return and cancellation.
struct Operation<'a, P: IdentityProvider, D: ProfileDirectory> {
    manager: &'a SessionManager<P, D>,
}

impl<'a, P: IdentityProvider, D: ProfileDirectory> Operation<'a, P, D> {
    fn start(manager: &'a SessionManager<P, D>) -> Self {
        manager.dispatch(Action::OperationStarted);
        Self { manager }
    }
}

impl<P: IdentityProvider, D: ProfileDirectory> Drop for Operation<'_, P, D> {
    fn drop(&mut self) {
        self.manager.dispatch(Action::OperationFinished);
    }
}

/// A processing claim. Released on drop unless a result was produced.
struct Claim<'a, P: IdentityProvider, D: ProfileDirectory> {
    manager: &'a SessionManager<P, D>,
    epoch: u64,
    settled: bool,
}

impl<P: IdentityProvider, D: ProfileDirectory> Claim<'_, P, D> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<P: IdentityProvider, D: ProfileDirectory> Drop for Claim<'_, P, D> {
    fn drop(&mut self) {
        if !self.settled {
            self.manager.dispatch(Action::ProcessingReleased { epoch: self.epoch });
        }
    }
}
