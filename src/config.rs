use std::time::Duration;

use crate::error::Error;
use crate::profile::Role;

/// Session manager tuning.
///
/// All fields have defaults; override with `with_*` methods or read them
/// from the environment with [`from_env()`](SessionConfig::from_env).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    pub(crate) debounce: Duration,
    pub(crate) session_check_delay: Duration,
    pub(crate) session_check_timeout: Duration,
    pub(crate) profile_timeout: Duration,
    pub(crate) legacy_session_ttl: time::Duration,
    pub(crate) terms_role: Role,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            session_check_delay: Duration::from_millis(50),
            session_check_timeout: Duration::from_secs(5),
            profile_timeout: Duration::from_secs(10),
            legacy_session_ttl: crate::legacy::LEGACY_SESSION_TTL,
            terms_role: Role::Doctor,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from the environment.
    ///
    /// # Optional env vars
    /// - `PORTAL_SESSION_DEBOUNCE_MS`: debounce for non-critical provider events
    /// - `PORTAL_SESSION_CHECK_DELAY_MS`: delay before the explicit startup session check
    /// - `PORTAL_SESSION_CHECK_TIMEOUT_MS`: timeout of that check
    /// - `PORTAL_SESSION_PROFILE_TIMEOUT_MS`: bound on profile resolution
    /// - `PORTAL_SESSION_LEGACY_TTL_MINUTES`: lifetime of legacy delegated sessions
    /// - `PORTAL_SESSION_TERMS_ROLE`: role that must accept new legal terms
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the variable that failed to parse.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the variable that failed to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(ms) = parse_u64(&lookup, "PORTAL_SESSION_DEBOUNCE_MS")? {
            config = config.with_debounce(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_u64(&lookup, "PORTAL_SESSION_CHECK_DELAY_MS")? {
            config = config.with_session_check_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_u64(&lookup, "PORTAL_SESSION_CHECK_TIMEOUT_MS")? {
            config = config.with_session_check_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_u64(&lookup, "PORTAL_SESSION_PROFILE_TIMEOUT_MS")? {
            config = config.with_profile_timeout(Duration::from_millis(ms));
        }
        if let Some(minutes) = parse_u64(&lookup, "PORTAL_SESSION_LEGACY_TTL_MINUTES")? {
            let minutes = i64::try_from(minutes).map_err(|_| {
                Error::Config("PORTAL_SESSION_LEGACY_TTL_MINUTES: out of range".into())
            })?;
            config = config.with_legacy_session_ttl(time::Duration::minutes(minutes));
        }
        if let Some(role) = lookup("PORTAL_SESSION_TERMS_ROLE") {
            let role = role
                .parse::<Role>()
                .map_err(|e| Error::Config(format!("PORTAL_SESSION_TERMS_ROLE: {e}")))?;
            config = config.with_terms_role(role);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_session_check_delay(mut self, delay: Duration) -> Self {
        self.session_check_delay = delay;
        self
    }

    #[must_use]
    pub fn with_session_check_timeout(mut self, timeout: Duration) -> Self {
        self.session_check_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_profile_timeout(mut self, timeout: Duration) -> Self {
        self.profile_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_legacy_session_ttl(mut self, ttl: time::Duration) -> Self {
        self.legacy_session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_terms_role(mut self, role: Role) -> Self {
        self.terms_role = role;
        self
    }

    /// Quiet period before a token refresh event is applied.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Delay between start-up and the explicit session check.
    #[must_use]
    pub fn session_check_delay(&self) -> Duration {
        self.session_check_delay
    }

    /// Upper bound on the explicit session check.
    #[must_use]
    pub fn session_check_timeout(&self) -> Duration {
        self.session_check_timeout
    }

    /// Upper bound on resolving a Domain Profile.
    #[must_use]
    pub fn profile_timeout(&self) -> Duration {
        self.profile_timeout
    }

    /// Lifetime of a legacy passcode session.
    #[must_use]
    pub fn legacy_session_ttl(&self) -> time::Duration {
        self.legacy_session_ttl
    }

    /// Role that must accept the legal terms.
    #[must_use]
    pub fn terms_role(&self) -> Role {
        self.terms_role
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>, Error> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("{name}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.session_check_timeout(), Duration::from_secs(5));
        assert_eq!(config.legacy_session_ttl(), time::Duration::hours(4));
        assert_eq!(config.terms_role(), Role::Doctor);
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.session_check_delay(), Duration::from_millis(50));
    }

    #[test]
    fn environment_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("PORTAL_SESSION_DEBOUNCE_MS", "250"),
            ("PORTAL_SESSION_CHECK_TIMEOUT_MS", "1500"),
            ("PORTAL_SESSION_LEGACY_TTL_MINUTES", "30"),
            ("PORTAL_SESSION_TERMS_ROLE", "patient"),
        ]))
        .unwrap();

        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.session_check_timeout(), Duration::from_millis(1500));
        assert_eq!(config.legacy_session_ttl(), time::Duration::minutes(30));
        assert_eq!(config.terms_role(), Role::Patient);
    }

    #[test]
    fn invalid_value_names_the_variable() {
        let err = SessionConfig::from_lookup(lookup(&[("PORTAL_SESSION_DEBOUNCE_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("PORTAL_SESSION_DEBOUNCE_MS"));
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(
            SessionConfig::from_lookup(lookup(&[("PORTAL_SESSION_TERMS_ROLE", "nurse")])).is_err()
        );
    }
}
