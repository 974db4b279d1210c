//! SPA navigation detection
//!
//! The tracker turns raw history-API calls, `popstate` events and DOM
//! mutations into a single debounced "navigation occurred" signal. It owns no
//! timers itself: the host feeds events with a timestamp, asks for
//! [`NavigationTracker::next_deadline`] and calls [`NavigationTracker::poll`]
//! once that time has passed.

use crate::config::EngineConfig;

/// Milliseconds on the host's monotonic clock.
pub type Millis = u64;

// =============================================================================
// Signals
// =============================================================================

/// What produced a navigation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationKind {
    PushState,
    ReplaceState,
    PopState,
    /// Structural change of the top-level container with a new path/query
    DomMutation,
}

impl NavigationKind {
    /// Parse the host-side event name.
    pub fn from_event(name: &str) -> Option<Self> {
        match name {
            "pushState" | "pushstate" => Some(Self::PushState),
            "replaceState" | "replacestate" => Some(Self::ReplaceState),
            "popstate" | "popState" => Some(Self::PopState),
            "mutation" | "domMutation" => Some(Self::DomMutation),
            _ => None,
        }
    }
}

/// Who issued the history call behind a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalOrigin {
    /// Page, framework or user navigation
    External,
    /// The engine's own in-place referral correction
    SelfCorrected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationSignal {
    pub kind: NavigationKind,
    pub origin: SignalOrigin,
}

impl NavigationSignal {
    pub fn external(kind: NavigationKind) -> Self {
        Self { kind, origin: SignalOrigin::External }
    }

    pub fn self_corrected() -> Self {
        Self { kind: NavigationKind::ReplaceState, origin: SignalOrigin::SelfCorrected }
    }
}

/// Why the tracker asks for a decision run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First run after script start
    InitialLoad,
    /// Debounced navigation signal
    Navigation,
}

/// Result of trying to attach the structural observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAttach {
    Attached,
    /// Container not present yet; retry at the given time
    RetryAt(Millis),
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug, Clone)]
pub struct NavigationTracker {
    debounce_ms: Millis,
    initial_delay_ms: Millis,
    observer_retry_ms: Millis,
    debounce_at: Option<Millis>,
    initial_at: Option<Millis>,
    observer_retry_at: Option<Millis>,
    observer_attached: bool,
    last_observed: String,
    accepted: u64,
    dropped: u64,
}

impl NavigationTracker {
    /// Create a tracker; `initial_location` is the path+query at script start.
    pub fn new(config: &EngineConfig, initial_location: impl Into<String>) -> Self {
        Self {
            debounce_ms: config.debounce_ms,
            initial_delay_ms: config.initial_delay_ms,
            observer_retry_ms: config.observer_retry_ms,
            debounce_at: None,
            initial_at: None,
            observer_retry_at: None,
            observer_attached: false,
            last_observed: initial_location.into(),
            accepted: 0,
            dropped: 0,
        }
    }

    /// Arm the one-shot initial run.
    pub fn schedule_initial(&mut self, now: Millis) {
        self.initial_at = Some(now + self.initial_delay_ms);
    }

    /// Raise a signal. Returns true if it (re)armed the debounce timer.
    pub fn raise(&mut self, signal: NavigationSignal, now: Millis) -> bool {
        if signal.origin == SignalOrigin::SelfCorrected {
            self.dropped += 1;
            log::trace!("dropping self-issued {:?} signal", signal.kind);
            return false;
        }
        self.accepted += 1;
        self.debounce_at = Some(now + self.debounce_ms);
        true
    }

    /// Handle a structural mutation. Only a changed path/query raises a signal.
    pub fn on_mutation(&mut self, path_and_query: &str, now: Millis) -> bool {
        if path_and_query == self.last_observed {
            return false;
        }
        self.last_observed = path_and_query.to_string();
        self.raise(NavigationSignal::external(NavigationKind::DomMutation), now)
    }

    /// Record the location the engine itself wrote, so the next mutation
    /// check does not mistake it for a navigation.
    pub fn note_location(&mut self, path_and_query: &str) {
        self.last_observed = path_and_query.to_string();
    }

    /// Try to attach the observer; `container_present` reports whether the
    /// observed node exists yet.
    pub fn attach_observer(&mut self, container_present: bool, now: Millis) -> ObserverAttach {
        if self.observer_attached || container_present {
            self.observer_attached = true;
            self.observer_retry_at = None;
            return ObserverAttach::Attached;
        }
        let at = now + self.observer_retry_ms;
        self.observer_retry_at = Some(at);
        ObserverAttach::RetryAt(at)
    }

    pub fn observer_attached(&self) -> bool {
        self.observer_attached
    }

    /// True if an observer attach retry is due.
    pub fn observer_retry_due(&self, now: Millis) -> bool {
        self.observer_retry_at.is_some_and(|at| now >= at)
    }

    /// Fire due timers. A due initial run and a due debounce coalesce into a
    /// single trigger.
    pub fn poll(&mut self, now: Millis) -> Option<Trigger> {
        let initial_due = self.initial_at.is_some_and(|at| now >= at);
        let debounce_due = self.debounce_at.is_some_and(|at| now >= at);

        if initial_due {
            self.initial_at = None;
            if debounce_due {
                self.debounce_at = None;
            }
            return Some(Trigger::InitialLoad);
        }
        if debounce_due {
            self.debounce_at = None;
            return Some(Trigger::Navigation);
        }
        None
    }

    /// Cancel every pending run (observer retry excluded).
    pub fn cancel(&mut self) {
        self.initial_at = None;
        self.debounce_at = None;
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Millis> {
        [self.initial_at, self.debounce_at, self.observer_retry_at]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn is_pending(&self) -> bool {
        self.initial_at.is_some() || self.debounce_at.is_some()
    }

    /// (accepted, dropped) signal counts.
    pub fn signal_counts(&self) -> (u64, u64) {
        (self.accepted, self.dropped)
    }
}
