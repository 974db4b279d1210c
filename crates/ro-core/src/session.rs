//! In-page referral session
//!
//! Wires the navigation tracker, the decision engine and the local mirror
//! into one pipeline driven by host events and `tick` calls.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::decision::{Decision, EnginePhase, Evaluation, RefAction, ReferralDecisionEngine};
use crate::messaging::{Dispatch, Message, MessageChannel, Outbox, Recovery};
use crate::mirror::{ContentItemId, LocalReferralMirror};
use crate::page_key::PageKey;
use crate::settings::Settings;
use crate::store::LocalStore;
use crate::tracker::{Millis, NavigationKind, NavigationSignal, NavigationTracker, SignalOrigin, Trigger};
use crate::url::{extract_host, extract_path, host_matches_domain, path_and_query};

/// Error type for page host operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("History API unavailable: {0}")]
    History(String),
    #[error("Navigation failed: {0}")]
    Navigation(String),
}

/// The hosting page.
pub trait PageHost {
    /// Current absolute URL.
    fn location(&self) -> String;
    /// Replace the current URL without navigating or adding a history entry.
    ///
    /// Implementations must tag the resulting history notification as
    /// [`SignalOrigin::SelfCorrected`].
    fn replace_location(&mut self, url: &str) -> Result<(), HostError>;
    /// Full page reload.
    fn reload(&mut self) -> Result<(), HostError>;
    /// Whether the container watched for structural mutations exists yet.
    fn container_present(&self) -> bool;
}

/// What one pipeline run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    Applied {
        trigger: Trigger,
        page_key: PageKey,
        decision: Decision,
        /// Item written to the local mirror, if the page names one
        recorded: Option<ContentItemId>,
    },
    AlreadyProcessed(PageKey),
    Disabled,
    /// The page is not on the target domain
    OffDomain,
    /// In-place correction failed; a reload was requested instead
    CorrectionFailed { page_key: PageKey, error: HostError },
}

pub struct ContentSession<H, L, C> {
    settings: Settings,
    tracker: NavigationTracker,
    engine: ReferralDecisionEngine,
    mirror: LocalReferralMirror<L, C>,
    outbox: Outbox,
    host: H,
    started: bool,
}

impl<H, L, C> ContentSession<H, L, C>
where
    H: PageHost + MessageChannel,
    L: LocalStore,
    C: Clock,
{
    pub fn new(config: EngineConfig, settings: Settings, host: H, store: L, clock: C) -> Self {
        let tracker = NavigationTracker::new(&config, path_and_query(&host.location()));
        let mirror = LocalReferralMirror::new(store, clock, config.local_referral_key.clone());
        let outbox = Outbox::new(config.message_retry);
        Self {
            settings,
            tracker,
            engine: ReferralDecisionEngine::new(config),
            mirror,
            outbox,
            host,
            started: false,
        }
    }

    /// Script start. Does nothing while the feature is disabled.
    pub fn start(&mut self, now: Millis) {
        log::info!(
            "loaded with settings: enabled={} passive={} referral={}",
            self.settings.enabled,
            self.settings.passive,
            self.settings.referral_id
        );
        if !self.settings.enabled {
            return;
        }
        self.started = true;
        self.seed_campaign();
        // a directly loaded item page must be handled without any navigation
        self.tracker.schedule_initial(now);
        self.tracker.attach_observer(self.host.container_present(), now);
    }

    /// History API call or `popstate`.
    pub fn on_history(&mut self, kind: NavigationKind, origin: SignalOrigin, now: Millis) {
        if !self.started {
            return;
        }
        if self.tracker.raise(NavigationSignal { kind, origin }, now) {
            self.tracker.note_location(&path_and_query(&self.host.location()));
        }
    }

    /// Structural mutation of the observed container.
    pub fn on_mutation(&mut self, now: Millis) {
        if !self.started || !self.tracker.observer_attached() {
            return;
        }
        let current = path_and_query(&self.host.location());
        self.tracker.on_mutation(&current, now);
    }

    /// New settings snapshot from a store change notification.
    pub fn on_settings_changed(&mut self, settings: Settings, now: Millis) {
        let policy_changed = settings.passive != self.settings.passive
            || settings.referral_id != self.settings.referral_id;
        let was_enabled = self.settings.enabled;
        self.settings = settings;

        if !self.settings.enabled {
            if was_enabled {
                log::info!("referral disabled, cancelling pending runs");
            }
            self.tracker.cancel();
            return;
        }

        if !self.started {
            self.start(now);
            return;
        }

        if policy_changed || !was_enabled {
            self.seed_campaign();
            self.engine.reset();
            self.tracker.raise(NavigationSignal::external(NavigationKind::ReplaceState), now);
        }
    }

    /// Drive timers. Returns a report when a pipeline run happened.
    pub fn tick(&mut self, now: Millis) -> Option<RunReport> {
        if self.tracker.observer_retry_due(now) {
            self.tracker.attach_observer(self.host.container_present(), now);
        }

        if let Dispatch::GaveUp(Recovery::FullReload) = self.outbox.poll(&mut self.host, now) {
            self.reload_directly();
        }

        let trigger = self.tracker.poll(now)?;
        Some(self.run(trigger, now))
    }

    /// Earliest time `tick` has work to do.
    pub fn next_wakeup(&self) -> Option<Millis> {
        [self.tracker.next_deadline(), self.outbox.next_retry()]
            .into_iter()
            .flatten()
            .min()
    }

    fn run(&mut self, trigger: Trigger, now: Millis) -> RunReport {
        self.engine.transition(EnginePhase::Loading);
        let url = self.host.location();
        if !self.on_target(&url) {
            log::debug!("{url} is outside {}, leaving it alone", self.engine.config().target_domain);
            self.engine.transition(EnginePhase::Idle);
            return RunReport::OffDomain;
        }

        self.engine.transition(EnginePhase::Deciding);
        let (page_key, decision) = match self.engine.evaluate(&self.settings, &url) {
            Evaluation::Pending(key, decision) => (key, decision),
            Evaluation::AlreadyProcessed(key) => {
                self.engine.transition(EnginePhase::Idle);
                return RunReport::AlreadyProcessed(key);
            }
            Evaluation::Disabled => {
                self.engine.transition(EnginePhase::Idle);
                return RunReport::Disabled;
            }
        };

        self.engine.transition(EnginePhase::Applying);
        if let RefAction::Set { url: corrected } = &decision.action {
            if let Err(error) = self.host.replace_location(corrected) {
                log::warn!("in-place referral correction failed: {error}; requesting reload");
                if let Dispatch::GaveUp(Recovery::FullReload) =
                    self.outbox.dispatch(&mut self.host, Message::ReloadPage, now)
                {
                    self.reload_directly();
                }
                self.engine.transition(EnginePhase::Idle);
                return RunReport::CorrectionFailed { page_key, error };
            }
            self.tracker.note_location(&path_and_query(corrected));
            log::info!("URL updated: {corrected}");
        } else {
            log::debug!("keeping existing ref {}", decision.effective_ref);
        }

        let path = extract_path(&url).to_string();
        let recorded = match self.mirror.record(&path, &decision.effective_ref) {
            Ok(item) => item,
            Err(e) => {
                log::warn!("failed to record local referral: {e}");
                None
            }
        };

        self.engine.mark_processed(page_key.clone());
        self.engine.transition(EnginePhase::Idle);
        RunReport::Applied { trigger, page_key, decision, recorded }
    }

    fn on_target(&self, url: &str) -> bool {
        extract_host(url).is_some_and(|host| host_matches_domain(host, &self.engine.config().target_domain))
    }

    fn seed_campaign(&mut self) {
        if !self.on_target(&self.host.location()) {
            return;
        }
        if let Err(e) = self.mirror.seed_campaign(&self.settings.referral_id, self.settings.passive) {
            log::warn!("failed to seed campaign referral: {e}");
        }
    }

    fn reload_directly(&mut self) {
        log::warn!("background unreachable, reloading page");
        if let Err(e) = self.host.reload() {
            log::error!("page reload failed: {e}");
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn phase(&self) -> EnginePhase {
        self.engine.phase()
    }

    pub fn engine(&self) -> &ReferralDecisionEngine {
        &self.engine
    }

    pub fn tracker(&self) -> &NavigationTracker {
        &self.tracker
    }

    pub fn mirror(&self) -> &LocalReferralMirror<L, C> {
        &self.mirror
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;
    use crate::clock::FixedClock;
    use crate::messaging::ChannelError;
    use crate::store::MemoryLocalStore;

    /// Page double: replaceState feeds back into the session the way the
    /// wrapped history API does, tagged as self-corrected.
    #[derive(Default)]
    struct FakePage {
        url: String,
        body: bool,
        fail_replace: bool,
        channel_down: bool,
        replaced: Vec<String>,
        sent: Vec<Message>,
        reloads: u32,
    }

    impl FakePage {
        fn at(url: &str) -> Self {
            Self { url: url.to_string(), body: true, ..Self::default() }
        }
    }

    impl PageHost for FakePage {
        fn location(&self) -> String {
            self.url.clone()
        }

        fn replace_location(&mut self, url: &str) -> Result<(), HostError> {
            if self.fail_replace {
                return Err(HostError::History("SecurityError".to_string()));
            }
            self.url = url.to_string();
            self.replaced.push(url.to_string());
            Ok(())
        }

        fn reload(&mut self) -> Result<(), HostError> {
            self.reloads += 1;
            Ok(())
        }

        fn container_present(&self) -> bool {
            self.body
        }
    }

    impl MessageChannel for FakePage {
        fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
            if self.channel_down {
                return Err(ChannelError::Unavailable);
            }
            self.sent.push(message.clone());
            Ok(())
        }
    }

    type Session = ContentSession<FakePage, MemoryLocalStore, FixedClock>;

    fn settings(passive: bool) -> Settings {
        Settings { enabled: true, passive, referral_id: "tzDEFAULT".to_string() }
    }

    fn session(url: &str, settings: Settings) -> Session {
        let clock = FixedClock(DateTime::parse_from_rfc3339("2026-02-24T23:02:31.282-08:00").expect("time"));
        ContentSession::new(EngineConfig::default(), settings, FakePage::at(url), MemoryLocalStore::new(), clock)
    }

    fn stored_map(s: &Session) -> serde_json::Map<String, serde_json::Value> {
        s.mirror().load().expect("load")
    }

    #[test]
    fn passive_fills_missing_ref_on_direct_load() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.start(0);
        assert_eq!(s.next_wakeup(), Some(100));
        assert_eq!(s.tick(50), None);

        let report = s.tick(100).expect("initial run");
        assert!(matches!(report, RunReport::Applied { trigger: Trigger::InitialLoad, .. }));
        assert_eq!(s.host().url, "https://objkt.com/tokens/KT1X/3?ref=tzDEFAULT");
        assert_eq!(stored_map(&s)["KT1X-3"]["shares"], json!({"tzDEFAULT": 10000}));
        assert_eq!(s.phase(), EnginePhase::Idle);
    }

    #[test]
    fn passive_preserves_and_records_foreign_ref() {
        let mut s = session("https://objkt.com/tokens/KT1X/3?ref=tzOTHER", settings(true));
        s.start(0);
        s.tick(100).expect("initial run");
        assert_eq!(s.host().url, "https://objkt.com/tokens/KT1X/3?ref=tzOTHER");
        assert!(s.host().replaced.is_empty());
        assert_eq!(stored_map(&s)["KT1X-3"]["shares"], json!({"tzOTHER": 10000}));
    }

    #[test]
    fn active_overrides_foreign_ref() {
        let mut s = session("https://objkt.com/tokens/KT1X/3?ref=tzOTHER", settings(false));
        s.start(0);
        s.tick(100).expect("initial run");
        assert_eq!(s.host().url, "https://objkt.com/tokens/KT1X/3?ref=tzDEFAULT");
        assert_eq!(stored_map(&s)["KT1X-3"]["shares"], json!({"tzDEFAULT": 10000}));
    }

    #[test]
    fn disabled_session_does_nothing() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", Settings::default());
        s.start(0);
        s.on_history(NavigationKind::PushState, SignalOrigin::External, 10);
        assert_eq!(s.next_wakeup(), None);
        assert_eq!(s.tick(10_000), None);
        assert!(s.host().replaced.is_empty());
    }

    #[test]
    fn spa_navigation_is_debounced_and_deduplicated() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.start(0);
        s.tick(100).expect("initial run");

        // SPA route change followed by a burst of framework rewrites
        s.host_mut().url = "https://objkt.com/tokens/KT1X/4".to_string();
        s.on_history(NavigationKind::PushState, SignalOrigin::External, 1_000);
        s.on_history(NavigationKind::ReplaceState, SignalOrigin::External, 1_100);
        assert_eq!(s.tick(1_300), None);
        let report = s.tick(1_400).expect("debounced run");
        assert!(matches!(report, RunReport::Applied { trigger: Trigger::Navigation, .. }));
        assert_eq!(s.host().url, "https://objkt.com/tokens/KT1X/4?ref=tzDEFAULT");

        // tab switch on the same item: same page key, no second mutation
        s.host_mut().url = "https://objkt.com/tokens/KT1X/4/owners".to_string();
        s.on_history(NavigationKind::PushState, SignalOrigin::External, 2_000);
        let report = s.tick(2_300).expect("run");
        assert!(matches!(report, RunReport::AlreadyProcessed(_)));
        assert_eq!(s.host().replaced.len(), 2);
    }

    #[test]
    fn self_corrected_replace_does_not_retrigger() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.start(0);
        s.tick(100).expect("initial run");
        s.on_history(NavigationKind::ReplaceState, SignalOrigin::SelfCorrected, 101);
        assert_eq!(s.next_wakeup(), None);
        assert_eq!(s.tracker().signal_counts(), (0, 1));
    }

    #[test]
    fn mutation_fallback_detects_silent_route_change() {
        let mut s = session("https://objkt.com/explore", settings(true));
        s.start(0);
        s.tick(100).expect("initial run");
        assert_eq!(s.host().url, "https://objkt.com/explore?ref=tzDEFAULT");

        // our own rewrite is not a navigation
        s.on_mutation(150);
        assert_eq!(s.next_wakeup(), None);

        s.host_mut().url = "https://objkt.com/asset/KT1Y/9".to_string();
        s.on_mutation(500);
        let report = s.tick(800).expect("run");
        let RunReport::Applied { recorded, .. } = report else {
            panic!("expected applied run");
        };
        assert_eq!(recorded.map(|i| i.key()).as_deref(), Some("KT1Y-9"));
    }

    #[test]
    fn observer_waits_for_container() {
        let mut s = session("https://objkt.com/explore", settings(true));
        s.host_mut().body = false;
        s.start(0);
        assert!(!s.tracker().observer_attached());
        assert_eq!(s.next_wakeup(), Some(50));

        s.tick(50);
        assert!(!s.tracker().observer_attached());
        s.host_mut().body = true;
        s.tick(100);
        assert!(s.tracker().observer_attached());
    }

    #[test]
    fn policy_change_reprocesses_current_page() {
        let mut s = session("https://objkt.com/tokens/KT1X/3?ref=tzOTHER", settings(true));
        s.start(0);
        s.tick(100).expect("initial run");
        assert!(s.host().replaced.is_empty());

        s.on_settings_changed(settings(false), 1_000);
        let report = s.tick(1_300).expect("run");
        assert!(matches!(report, RunReport::Applied { .. }));
        assert_eq!(s.host().url, "https://objkt.com/tokens/KT1X/3?ref=tzDEFAULT");
    }

    #[test]
    fn disabling_cancels_pending_runs() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.start(0);
        s.on_settings_changed(Settings { enabled: false, ..settings(true) }, 10);
        assert_eq!(s.tick(1_000), None);
        assert!(s.host().replaced.is_empty());
    }

    #[test]
    fn enabling_later_starts_session() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", Settings::default());
        s.start(0);
        s.on_settings_changed(settings(true), 500);
        assert!(s.tick(600).is_some());
        assert_eq!(s.host().url, "https://objkt.com/tokens/KT1X/3?ref=tzDEFAULT");
    }

    #[test]
    fn failed_correction_requests_reload() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.host_mut().fail_replace = true;
        s.start(0);
        let report = s.tick(100).expect("run");
        assert!(matches!(report, RunReport::CorrectionFailed { .. }));
        assert_eq!(s.host().sent, vec![Message::ReloadPage]);
        assert_eq!(s.engine().processed_count(), 0);
        assert!(!stored_map(&s).contains_key("KT1X-3"));
    }

    #[test]
    fn unreachable_background_falls_back_to_direct_reload() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.host_mut().fail_replace = true;
        s.host_mut().channel_down = true;
        s.start(0);
        s.tick(100).expect("run");
        assert_eq!(s.next_wakeup(), Some(200));
        s.tick(200);
        assert_eq!(s.host().reloads, 0);
        s.tick(300);
        assert_eq!(s.host().reloads, 1);
        assert_eq!(s.next_wakeup(), None);
    }

    #[test]
    fn mirror_failure_still_marks_processed() {
        let mut s = session("https://objkt.com/tokens/KT1X/3", settings(true));
        s.mirror.store_mut().fail_writes(true);
        s.start(0);
        let report = s.tick(100).expect("run");
        assert!(matches!(report, RunReport::Applied { recorded: None, .. }));
        assert_eq!(s.engine().processed_count(), 1);
    }

    #[test]
    fn leaves_other_domains_alone() {
        let mut s = session("https://example.com/tokens/KT1X/3", settings(false));
        s.start(0);
        assert_eq!(s.tick(100), Some(RunReport::OffDomain));
        assert!(s.host().replaced.is_empty());
        assert!(stored_map(&s).is_empty());
        assert_eq!(s.engine().processed_count(), 0);
    }

    #[test]
    fn start_seeds_campaign_entry_once_per_referrer() {
        let mut s = session("https://objkt.com/explore", settings(false));
        s.start(0);
        s.tick(100).expect("initial run");
        let campaign: Vec<String> = stored_map(&s).keys().filter(|k| k.starts_with("custom-")).cloned().collect();
        assert_eq!(campaign, vec!["custom-1772002951282".to_string()]);

        // restarting with the same referrer does not pile up entries
        s.on_settings_changed(Settings { enabled: false, ..settings(false) }, 500);
        s.on_settings_changed(settings(false), 600);
        let map = stored_map(&s);
        assert_eq!(map.keys().filter(|k| k.starts_with("custom-")).count(), 1);

        s.on_settings_changed(Settings { referral_id: "tzOTHER".to_string(), ..settings(false) }, 1_000);
        let map = stored_map(&s);
        assert!(map
            .iter()
            .any(|(k, v)| k.starts_with("custom-") && v["shares"] == json!({"tzOTHER": 10000})));
    }
}
