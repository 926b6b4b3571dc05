//! Debounce lane for provider events.
//!
//! Critical events dispatch immediately. Everything else waits in a single
//! pending slot; a newer event replaces the pending one and restarts the wait.

use std::time::Duration;

use tokio::time::Instant;

use crate::provider::ProviderEvent;

#[derive(Debug)]
pub(crate) struct EventQueue {
    debounce: Duration,
    pending: Option<(ProviderEvent, Instant)>,
}

impl EventQueue {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: None,
        }
    }

    /// Accepts an event. Returns it back if it must be dispatched now.
    ///
    /// A critical event supersedes whatever is pending.
    pub(crate) fn offer(&mut self, event: ProviderEvent, now: Instant) -> Option<ProviderEvent> {
        if event.kind.is_critical() {
            if let Some((superseded, _)) = self.pending.take() {
                tracing::debug!(kind = ?superseded.kind, "Pending event superseded");
            }
            return Some(event);
        }
        self.pending = Some((event, now + self.debounce));
        None
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, at)| *at)
    }

    /// Takes the pending event if its wait has elapsed.
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<ProviderEvent> {
        match self.pending {
            Some((_, at)) if at <= now => self.pending.take().map(|(event, _)| event),
            _ => None,
        }
    }
}
