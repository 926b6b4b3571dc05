//! Canonical session state and its transitions.
//!
//! All mutation goes through [`SessionState::reduce`]; the event admission
//! rules live in [`admit`]. Neither touches I/O, so both are tested directly.

use crate::profile::{Profile, ProfileResolution};
use crate::provider::{EventKind, PrimarySession, ProviderEvent};
use crate::types::{SubjectId, TokenFingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Uninitialized,
    Initializing,
    Anonymous,
    Authenticated,
}

/// Snapshot of the session as seen by the rest of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    pub session: Option<PrimarySession>,
    pub profile: Option<Profile>,
    pub setup_incomplete: bool,
    pub onboarding_pending: bool,
    pub needs_terms: bool,
    /// True while initializing or while an identity-changing operation runs.
    pub loading: bool,
    pub initialized: bool,
    /// Processing cycles claimed and not yet settled.
    pub(crate) in_flight: u32,
    /// At least one full processing cycle completed since the last sign-out.
    pub(crate) processed_once: bool,
    pub(crate) last_fingerprint: Option<TokenFingerprint>,
    /// Bumped whenever the session is cleared; results started under an older
    /// epoch are discarded.
    pub(crate) epoch: u64,
    pub(crate) operations: u32,
}

/// Transitions accepted by [`SessionState::reduce`].
#[derive(Debug, Clone)]
pub enum Action {
    Start,
    OperationStarted,
    OperationFinished,
    ProcessingStarted,
    /// A claimed cycle ended without a result.
    ProcessingReleased { epoch: u64 },
    /// A session and its profile were resolved. Ignored if `epoch` is stale;
    /// an already expired session only settles the claim.
    Resolved {
        session: PrimarySession,
        resolution: ProfileResolution,
        epoch: u64,
    },
    /// Same identity, new tokens. The profile is left alone.
    TokenUpdated(PrimarySession),
    /// Re-resolved profile data for `subject`. Ignored if the session moved on.
    ProfileRefreshed {
        subject: SubjectId,
        resolution: ProfileResolution,
        epoch: u64,
    },
    /// Back to anonymous.
    Cleared,
    /// The startup check found nothing usable. Only settles its claim once
    /// initialized.
    InitFailed { epoch: u64 },
    TermsAccepted,
}

impl SessionState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }

    /// Initialized and at least one session processed.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.initialized && self.processed_once
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.in_flight > 0
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn reduce(mut self, action: Action) -> Self {
        match action {
            Action::Start => {
                if self.phase == Phase::Uninitialized {
                    self.phase = Phase::Initializing;
                }
            }
            Action::OperationStarted => self.operations += 1,
            Action::OperationFinished => self.operations = self.operations.saturating_sub(1),
            Action::ProcessingStarted => self.in_flight += 1,
            Action::ProcessingReleased { epoch } => {
                if epoch == self.epoch {
                    self.in_flight = self.in_flight.saturating_sub(1);
                }
            }
            Action::Resolved {
                session,
                resolution,
                epoch,
            } => {
                if epoch != self.epoch {
                    return self;
                }
                if session.is_expired() {
                    return self.reduce(Action::InitFailed { epoch });
                }
                self.last_fingerprint = Some(session.fingerprint());
                self.session = Some(session);
                self.apply_resolution(resolution);
                self.in_flight = self.in_flight.saturating_sub(1);
                self.processed_once = true;
                self.phase = Phase::Authenticated;
                self.initialized = true;
            }
            Action::TokenUpdated(session) => {
                if let Some(current) = self.session.as_mut() {
                    if current.subject == session.subject && !session.is_expired() {
                        self.last_fingerprint = Some(session.fingerprint());
                        current.access_token = session.access_token;
                        current.refresh_token = session.refresh_token;
                        current.expires_at = session.expires_at;
                        current.origin = session.origin;
                    }
                }
            }
            Action::ProfileRefreshed {
                subject,
                resolution,
                epoch,
            } => {
                let current = self.session.as_ref().map(|s| &s.subject);
                if epoch == self.epoch && current == Some(&subject) {
                    self.apply_resolution(resolution);
                }
            }
            Action::Cleared => {
                self.clear();
            }
            Action::InitFailed { epoch } => {
                if epoch != self.epoch {
                    return self;
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                if !self.initialized {
                    self.phase = Phase::Anonymous;
                    self.initialized = true;
                }
            }
            Action::TermsAccepted => self.needs_terms = false,
        }
        self.loading = self.phase == Phase::Initializing || self.operations > 0;
        self
    }

    fn apply_resolution(&mut self, resolution: ProfileResolution) {
        self.profile = resolution.profile;
        self.setup_incomplete = resolution.setup_incomplete;
        self.onboarding_pending = resolution.onboarding_pending;
        self.needs_terms = resolution.needs_terms;
    }

    fn clear(&mut self) {
        self.session = None;
        self.apply_resolution(ProfileResolution::default());
        self.in_flight = 0;
        self.processed_once = false;
        self.last_fingerprint = None;
        self.epoch += 1;
        self.phase = Phase::Anonymous;
        self.initialized = true;
    }
}

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Token refresh delivered to a hidden tab.
    HiddenTab,
    /// Another event is still being processed.
    Busy,
    /// Token refresh carrying the token already accepted.
    DuplicateToken,
    /// Non-initial event without a session.
    NoSession,
    /// The session carried by the event has already expired.
    Expired,
}

/// What the manager should do with an incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Clear,
    Drop(DropReason),
    UpdateToken(PrimarySession),
    Process(PrimarySession),
}

/// Decides how `event` is handled given the current state.
#[must_use]
pub fn admit(state: &SessionState, event: &ProviderEvent, tab_hidden: bool) -> Admission {
    if event.kind == EventKind::SignedOut {
        return Admission::Clear;
    }
    let Some(session) = event.session.clone() else {
        return if event.kind == EventKind::InitialSession {
            Admission::Clear
        } else {
            Admission::Drop(DropReason::NoSession)
        };
    };
    if session.is_expired() {
        return Admission::Drop(DropReason::Expired);
    }
    // A same-tab redirect sign-in is only observable through this event.
    if event.kind == EventKind::InitialSession {
        return Admission::Process(session);
    }
    if tab_hidden && event.kind == EventKind::TokenRefreshed {
        return Admission::Drop(DropReason::HiddenTab);
    }
    if state.is_processing() {
        return Admission::Drop(DropReason::Busy);
    }
    if !state.is_stable() {
        return Admission::Process(session);
    }
    if event.kind == EventKind::TokenRefreshed
        && state.last_fingerprint.as_ref() == Some(&session.fingerprint())
    {
        return Admission::Drop(DropReason::DuplicateToken);
    }
    let same_subject = state
        .session
        .as_ref()
        .is_some_and(|current| current.subject == session.subject);
    if same_subject {
        Admission::UpdateToken(session)
    } else {
        Admission::Process(session)
    }
}
