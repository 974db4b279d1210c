//! WebAssembly bindings for RObjkt
//!
//! The content script creates a [`ContentController`] and forwards history
//! wrapper calls, `popstate` and body mutations to it. The background worker
//! drives a [`BackgroundController`] and applies the `updateDynamicRules`
//! payloads it hands back; the popup and options pages use a
//! [`SettingsFormController`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use wasm_bindgen::prelude::*;

use ro_core::background::{Background, BackgroundError, BrowserActions, IconState, TabId};
use ro_core::clock::Clock;
use ro_core::messaging::{ChannelError, Message, MessageChannel};
use ro_core::redirect::{DnrPlanFacility, RedirectRuleSynchronizer, RuleUpdate, SyncOutcome, SyncReport, SyncTrigger};
use ro_core::session::{ContentSession, HostError, PageHost, RunReport};
use ro_core::settings_form::{FormError, SettingsForm, StatusMessage, ToggleEffect};
use ro_core::store::{LocalStore, SettingsStore, StoreError};
use ro_core::tracker::{Millis, NavigationKind, SignalOrigin};
use ro_core::{
    decide as decide_ref, is_valid_address as is_valid, EngineConfig, PageKey, RefAction, Settings, SettingsChange,
    StoredSettings,
};

// =============================================================================
// Logging
// =============================================================================

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("RObjkt: {}", record.args()));
        match record.level() {
            log::Level::Error => web_sys::console::error_1(&line),
            log::Level::Warn => web_sys::console::warn_1(&line),
            log::Level::Info => web_sys::console::log_1(&line),
            log::Level::Debug | log::Level::Trace => web_sys::console::debug_1(&line),
        }
    }

    fn flush(&self) {}
}

/// Route `log` output to the browser console. `level` is a `log` level name
/// ("info" when omitted or unknown).
#[wasm_bindgen]
pub fn init_logging(level: Option<String>) {
    let filter = level
        .as_deref()
        .and_then(|l| l.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // a second call only changes the level
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(filter);
}

// =============================================================================
// Browser Hosts
// =============================================================================

fn describe(value: &JsValue) -> String {
    value.as_string().unwrap_or_else(|| format!("{value:?}"))
}

fn window() -> Result<web_sys::Window, HostError> {
    web_sys::window().ok_or_else(|| HostError::History("no window".to_string()))
}

/// Local time from the JS `Date`, so records carry the browser's offset.
struct JsClock;

impl Clock for JsClock {
    fn now_local(&self) -> DateTime<FixedOffset> {
        let date = js_sys::Date::new_0();
        let offset_secs = -(date.get_timezone_offset() as i32) * 60;
        let offset = FixedOffset::east_opt(offset_secs).unwrap_or(Utc.fix());
        DateTime::from_timestamp_millis(date.get_time() as i64)
            .unwrap_or_default()
            .with_timezone(&offset)
    }
}

/// `window.localStorage` of the hosting page.
struct BrowserLocalStorage;

impl BrowserLocalStorage {
    fn storage(&self) -> Result<web_sys::Storage, StoreError> {
        web_sys::window()
            .ok_or_else(|| StoreError::Unavailable("no window".to_string()))?
            .local_storage()
            .map_err(|e| StoreError::Unavailable(describe(&e)))?
            .ok_or_else(|| StoreError::Unavailable("localStorage disabled".to_string()))
    }
}

impl LocalStore for BrowserLocalStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.storage()?
            .get_item(key)
            .map_err(|e| StoreError::Unavailable(describe(&e)))
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.storage()?
            .set_item(key, value)
            .map_err(|e| StoreError::WriteRejected(describe(&e)))
    }
}

/// The page the content script runs in.
struct BrowserPage {
    self_issued: Rc<Cell<bool>>,
    /// JS function posting a message to the background; throws when the
    /// background context is unreachable
    send: js_sys::Function,
}

impl PageHost for BrowserPage {
    fn location(&self) -> String {
        web_sys::window()
            .and_then(|w| w.location().href().ok())
            .unwrap_or_default()
    }

    fn replace_location(&mut self, url: &str) -> Result<(), HostError> {
        let history = window()?
            .history()
            .map_err(|e| HostError::History(describe(&e)))?;
        let state = history.state().unwrap_or(JsValue::NULL);

        // the wrapped replaceState reports back synchronously; flag it
        self.self_issued.set(true);
        let result = history.replace_state_with_url(&state, "", Some(url));
        self.self_issued.set(false);

        result.map_err(|e| HostError::History(describe(&e)))
    }

    fn reload(&mut self) -> Result<(), HostError> {
        window()?
            .location()
            .reload()
            .map_err(|e| HostError::Navigation(describe(&e)))
    }

    fn container_present(&self) -> bool {
        web_sys::window()
            .and_then(|w| w.document())
            .and_then(|d| d.body())
            .is_some()
    }
}

impl MessageChannel for BrowserPage {
    fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        let json = message
            .to_json()
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;
        self.send
            .call1(&JsValue::NULL, &JsValue::from_str(&json))
            .map(|_| ())
            .map_err(|_| ChannelError::Unavailable)
    }
}

// =============================================================================
// Content Controller
// =============================================================================

type BrowserSession = ContentSession<BrowserPage, BrowserLocalStorage, JsClock>;

fn parse_settings(settings_json: &str) -> Result<Settings, JsValue> {
    serde_json::from_str::<StoredSettings>(settings_json)
        .map(|stored| stored.resolve())
        .map_err(|e| JsValue::from_str(&format!("Invalid settings: {}", e)))
}

fn parse_config(config_json: Option<String>) -> Result<EngineConfig, JsValue> {
    match config_json {
        Some(text) => EngineConfig::from_json(&text).map_err(|e| JsValue::from_str(&e.to_string())),
        None => Ok(EngineConfig::default()),
    }
}

#[inline]
fn millis(now: f64) -> Millis {
    if now.is_finite() && now > 0.0 {
        now as Millis
    } else {
        0
    }
}

#[wasm_bindgen]
pub struct ContentController {
    session: RefCell<BrowserSession>,
    self_issued: Rc<Cell<bool>>,
}

#[wasm_bindgen]
impl ContentController {
    /// `settings_json` is the stored settings record; missing fields take
    /// their defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(settings_json: &str, config_json: Option<String>, send: js_sys::Function) -> Result<ContentController, JsValue> {
        let settings = parse_settings(settings_json)?;
        let config = parse_config(config_json)?;
        let self_issued = Rc::new(Cell::new(false));
        let page = BrowserPage { self_issued: Rc::clone(&self_issued), send };
        let session = ContentSession::new(config, settings, page, BrowserLocalStorage, JsClock);
        Ok(ContentController { session: RefCell::new(session), self_issued })
    }

    pub fn start(&self, now: f64) {
        if let Ok(mut session) = self.session.try_borrow_mut() {
            session.start(millis(now));
        }
    }

    /// Forward a wrapped history call or `popstate` ("pushState",
    /// "replaceState", "popstate").
    pub fn notify_history(&self, kind: &str, now: f64) {
        let Some(kind) = NavigationKind::from_event(kind) else {
            log::debug!("ignoring unknown history event '{}'", kind);
            return;
        };
        let origin = if self.self_issued.get() {
            SignalOrigin::SelfCorrected
        } else {
            SignalOrigin::External
        };
        match self.session.try_borrow_mut() {
            Ok(mut session) => session.on_history(kind, origin, millis(now)),
            // re-entered from our own replaceState
            Err(_) => log::trace!("dropping re-entrant {:?} notification", kind),
        }
    }

    pub fn notify_mutation(&self, now: f64) {
        if let Ok(mut session) = self.session.try_borrow_mut() {
            session.on_mutation(millis(now));
        }
    }

    pub fn settings_changed(&self, settings_json: &str, now: f64) -> Result<(), JsValue> {
        let settings = parse_settings(settings_json)?;
        let mut session = self
            .session
            .try_borrow_mut()
            .map_err(|_| JsValue::from_str("Controller busy"))?;
        session.on_settings_changed(settings, millis(now));
        Ok(())
    }

    /// Run due timers. Returns a report object, or `undefined` when nothing ran.
    pub fn tick(&self, now: f64) -> JsValue {
        let Ok(mut session) = self.session.try_borrow_mut() else {
            return JsValue::UNDEFINED;
        };
        match session.tick(millis(now)) {
            Some(report) => report_to_js(&report),
            None => JsValue::UNDEFINED,
        }
    }

    /// Time at which `tick` should be called next.
    pub fn next_wakeup(&self) -> Option<f64> {
        self.session
            .try_borrow()
            .ok()
            .and_then(|s| s.next_wakeup())
            .map(|t| t as f64)
    }
}

fn report_to_js(report: &RunReport) -> JsValue {
    let result = js_sys::Object::new();
    match report {
        RunReport::Applied { page_key, decision, recorded, .. } => {
            let _ = js_sys::Reflect::set(&result, &"kind".into(), &"applied".into());
            let _ = js_sys::Reflect::set(&result, &"pageKey".into(), &JsValue::from_str(page_key.as_str()));
            let _ = js_sys::Reflect::set(&result, &"effectiveRef".into(), &JsValue::from_str(&decision.effective_ref));
            if let RefAction::Set { url } = &decision.action {
                let _ = js_sys::Reflect::set(&result, &"url".into(), &JsValue::from_str(url));
            }
            if let Some(item) = recorded {
                let _ = js_sys::Reflect::set(&result, &"recorded".into(), &JsValue::from_str(&item.key()));
            }
        }
        RunReport::AlreadyProcessed(page_key) => {
            let _ = js_sys::Reflect::set(&result, &"kind".into(), &"alreadyProcessed".into());
            let _ = js_sys::Reflect::set(&result, &"pageKey".into(), &JsValue::from_str(page_key.as_str()));
        }
        RunReport::Disabled => {
            let _ = js_sys::Reflect::set(&result, &"kind".into(), &"disabled".into());
        }
        RunReport::OffDomain => {
            let _ = js_sys::Reflect::set(&result, &"kind".into(), &"offDomain".into());
        }
        RunReport::CorrectionFailed { page_key, error } => {
            let _ = js_sys::Reflect::set(&result, &"kind".into(), &"correctionFailed".into());
            let _ = js_sys::Reflect::set(&result, &"pageKey".into(), &JsValue::from_str(page_key.as_str()));
            let _ = js_sys::Reflect::set(&result, &"error".into(), &JsValue::from_str(&error.to_string()));
        }
    }
    result.into()
}

// =============================================================================
// Extension Hosts
// =============================================================================

fn to_js_json<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    let text = serde_json::to_string(value).map_err(|e| JsValue::from_str(&format!("Failed to encode: {}", e)))?;
    js_sys::JSON::parse(&text)
}

/// `chrome.storage.local` as seen by one extension context.
///
/// Reads come from a snapshot the host keeps current through
/// `settings_changed`; writes go through `persist(change)`.
struct JsSettingsStore {
    snapshot: Rc<RefCell<StoredSettings>>,
    persist: js_sys::Function,
}

impl JsSettingsStore {
    fn new(stored_json: &str, persist: js_sys::Function) -> Result<Self, StoreError> {
        let stored: StoredSettings =
            serde_json::from_str(stored_json).map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(Self { snapshot: Rc::new(RefCell::new(stored)), persist })
    }
}

impl SettingsStore for JsSettingsStore {
    fn load(&self) -> Result<StoredSettings, StoreError> {
        self.snapshot
            .try_borrow()
            .map(|stored| stored.clone())
            .map_err(|_| StoreError::Unavailable("settings snapshot busy".to_string()))
    }

    fn save(&mut self, change: &SettingsChange) -> Result<(), StoreError> {
        let value = to_js_json(change).map_err(|e| StoreError::WriteRejected(describe(&e)))?;
        self.persist
            .call1(&JsValue::NULL, &value)
            .map_err(|e| StoreError::WriteRejected(describe(&e)))?;
        self.snapshot
            .try_borrow_mut()
            .map_err(|_| StoreError::Unavailable("settings snapshot busy".to_string()))?
            .apply(change);
        Ok(())
    }
}

/// Toolbar icon and tab control, forwarded to JS callbacks.
struct JsBrowserActions {
    set_icon: js_sys::Function,
    reload_tab: js_sys::Function,
}

impl BrowserActions for JsBrowserActions {
    fn set_icon(&mut self, icon: IconState) -> Result<(), HostError> {
        self.set_icon
            .call1(&JsValue::NULL, &JsValue::from_str(icon.path()))
            .map(|_| ())
            .map_err(|e| HostError::Navigation(describe(&e)))
    }

    fn reload_tab(&mut self, tab: TabId) -> Result<(), HostError> {
        self.reload_tab
            .call1(&JsValue::NULL, &JsValue::from(tab))
            .map(|_| ())
            .map_err(|e| HostError::Navigation(describe(&e)))
    }
}

// =============================================================================
// Background Controller
// =============================================================================

type BrowserBackground = Background<JsSettingsStore, DnrPlanFacility, JsBrowserActions>;

fn sync_report_to_js(report: &SyncReport) -> JsValue {
    let outcome = match &report.outcome {
        SyncOutcome::Removed => "removed".to_string(),
        SyncOutcome::Installed { .. } => "installed".to_string(),
        SyncOutcome::Failed(e) => format!("failed: {}", e),
    };
    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"trigger".into(), &JsValue::from_str(&format!("{:?}", report.trigger)));
    let _ = js_sys::Reflect::set(&result, &"outcome".into(), &JsValue::from_str(&outcome));
    let _ = js_sys::Reflect::set(&result, &"degraded".into(), &JsValue::from(report.is_degraded()));
    result.into()
}

#[inline]
fn has_changes(update: &RuleUpdate) -> bool {
    !update.remove_rule_ids.is_empty() || !update.add_rules.is_empty()
}

/// Background worker state. Every event handler flushes the rule changes it
/// made through `apply_rules(update)` before returning.
#[wasm_bindgen]
pub struct BackgroundController {
    background: RefCell<BrowserBackground>,
    snapshot: Rc<RefCell<StoredSettings>>,
    apply_rules: js_sys::Function,
}

#[wasm_bindgen]
impl BackgroundController {
    /// `stored_json` is the current `chrome.storage.local` settings record.
    #[wasm_bindgen(constructor)]
    pub fn new(
        stored_json: &str,
        persist: js_sys::Function,
        set_icon: js_sys::Function,
        reload_tab: js_sys::Function,
        apply_rules: js_sys::Function,
        config_json: Option<String>,
    ) -> Result<BackgroundController, JsValue> {
        let config = parse_config(config_json)?;
        let store = JsSettingsStore::new(stored_json, persist).map_err(|e| JsValue::from_str(&e.to_string()))?;
        let snapshot = Rc::clone(&store.snapshot);
        let actions = JsBrowserActions { set_icon, reload_tab };
        let background = Background::new(store, DnrPlanFacility::new(), actions, config);
        Ok(BackgroundController { background: RefCell::new(background), snapshot, apply_rules })
    }

    pub fn on_installed(&self) -> Result<JsValue, JsValue> {
        let result = self.background.borrow_mut().on_installed().map(Some);
        self.finish(result)
    }

    pub fn on_startup(&self) -> Result<JsValue, JsValue> {
        let result = self.background.borrow_mut().on_startup().map(Some);
        self.finish(result)
    }

    pub fn on_action_clicked(&self) -> Result<JsValue, JsValue> {
        let result = self.background.borrow_mut().on_action_clicked().map(Some);
        self.finish(result)
    }

    /// Runtime message from a page or the settings surface.
    pub fn on_message(&self, message_json: &str, sender_tab: Option<i32>) -> Result<JsValue, JsValue> {
        let message = Message::from_json(message_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid message: {}", e)))?;
        let result = self.background.borrow_mut().on_message(&message, sender_tab);
        self.finish(result)
    }

    /// `chrome.storage.onChanged`, reduced to the new values.
    pub fn settings_changed(&self, change_json: &str) -> Result<JsValue, JsValue> {
        let change: SettingsChange = serde_json::from_str(change_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid settings change: {}", e)))?;
        self.snapshot.borrow_mut().apply(&change);
        let result = self.background.borrow_mut().on_settings_changed(&change);
        self.finish(result)
    }

    fn finish(&self, result: Result<Option<SyncReport>, BackgroundError>) -> Result<JsValue, JsValue> {
        let update = self.background.borrow_mut().synchronizer_mut().facility_mut().take_update();
        if has_changes(&update) {
            self.apply_rules.call1(&JsValue::NULL, &to_js_json(&update)?)?;
        }
        match result {
            Ok(Some(report)) => Ok(sync_report_to_js(&report)),
            Ok(None) => Ok(JsValue::UNDEFINED),
            Err(e) => Err(JsValue::from_str(&e.to_string())),
        }
    }
}

// =============================================================================
// Settings Form Controller
// =============================================================================

fn status_to_js(status: &StatusMessage) -> JsValue {
    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"text".into(), &JsValue::from_str(status.text));
    let _ = js_sys::Reflect::set(&result, &"color".into(), &JsValue::from_str(status.tone.color()));
    let _ = js_sys::Reflect::set(&result, &"expiresAt".into(), &JsValue::from(status.expires_at as f64));
    result.into()
}

fn toggle_to_js(effect: &ToggleEffect) -> Result<JsValue, JsValue> {
    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"message".into(), &to_js_json(&effect.message)?);
    if let Some(icon) = effect.icon {
        let _ = js_sys::Reflect::set(&result, &"icon".into(), &JsValue::from_str(icon.path()));
    }
    Ok(result.into())
}

/// Popup / options page logic. Toggle results carry the message the page
/// should send to the background and the icon to show.
#[wasm_bindgen]
pub struct SettingsFormController {
    form: RefCell<SettingsForm<JsSettingsStore>>,
}

#[wasm_bindgen]
impl SettingsFormController {
    #[wasm_bindgen(constructor)]
    pub fn new(stored_json: &str, persist: js_sys::Function, config_json: Option<String>) -> Result<SettingsFormController, JsValue> {
        let config = parse_config(config_json)?;
        let store = JsSettingsStore::new(stored_json, persist).map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(SettingsFormController { form: RefCell::new(SettingsForm::new(store, config.message_ttl_ms)) })
    }

    /// `{ wallet, enabled, passive }` for the initial render.
    pub fn load(&self) -> Result<JsValue, JsValue> {
        let state = self.form.borrow().load().map_err(|e| JsValue::from_str(&e.to_string()))?;
        let result = js_sys::Object::new();
        let _ = js_sys::Reflect::set(&result, &"wallet".into(), &JsValue::from_str(&state.wallet));
        let _ = js_sys::Reflect::set(&result, &"enabled".into(), &JsValue::from(state.enabled));
        let _ = js_sys::Reflect::set(&result, &"passive".into(), &JsValue::from(state.passive));
        Ok(result.into())
    }

    /// Save the wallet field. Returns the status line to show; an invalid
    /// address is reported through the status line, not as an error.
    pub fn save_wallet(&self, input: &str, now: f64) -> Result<JsValue, JsValue> {
        let mut form = self.form.borrow_mut();
        let saved = form.save_wallet(input, millis(now)).map(status_to_js);
        match saved {
            Ok(status) => Ok(status),
            Err(FormError::InvalidAddress(_)) => {
                Ok(form.visible_message(millis(now)).map(status_to_js).unwrap_or(JsValue::UNDEFINED))
            }
            Err(e) => Err(JsValue::from_str(&e.to_string())),
        }
    }

    pub fn clear(&self, now: f64) -> Result<JsValue, JsValue> {
        let mut form = self.form.borrow_mut();
        form.clear(millis(now))
            .map(status_to_js)
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<JsValue, JsValue> {
        let effect = self.form.borrow_mut().set_enabled(enabled).map_err(|e| JsValue::from_str(&e.to_string()))?;
        toggle_to_js(&effect)
    }

    pub fn set_passive(&self, passive: bool) -> Result<JsValue, JsValue> {
        let effect = self.form.borrow_mut().set_passive(passive).map_err(|e| JsValue::from_str(&e.to_string()))?;
        toggle_to_js(&effect)
    }

    /// Status line still visible at `now`, or `undefined`.
    pub fn visible_message(&self, now: f64) -> JsValue {
        self.form
            .borrow()
            .visible_message(millis(now))
            .map(status_to_js)
            .unwrap_or(JsValue::UNDEFINED)
    }
}

// =============================================================================
// Stateless Helpers
// =============================================================================

fn parse_trigger(trigger: &str) -> SyncTrigger {
    match trigger {
        "installed" => SyncTrigger::Installed,
        "startup" => SyncTrigger::Startup,
        "toggle" => SyncTrigger::Toggle,
        "referral" => SyncTrigger::ReferralChanged,
        "passive" => SyncTrigger::PassiveChanged,
        _ => SyncTrigger::StorageChanged,
    }
}

/// Build the `updateDynamicRules` payload for the given settings.
///
/// Returns `{ update, outcome, degraded }`; `update` always removes rule 1
/// and adds the new rule only when the feature is enabled.
#[wasm_bindgen]
pub fn plan_rule_update(settings_json: &str, trigger: &str, config_json: Option<String>) -> Result<JsValue, JsValue> {
    let settings = parse_settings(settings_json)?;
    let config = parse_config(config_json)?;

    let mut sync = RedirectRuleSynchronizer::new(DnrPlanFacility::new(), config);
    let report = sync.sync(&settings, parse_trigger(trigger));
    let update = sync.facility_mut().take_update();

    let result = sync_report_to_js(&report);
    let _ = js_sys::Reflect::set(&result, &"update".into(), &to_js_json(&update)?);
    Ok(result)
}

#[wasm_bindgen]
pub fn is_valid_address(address: &str) -> bool {
    is_valid(address)
}

#[wasm_bindgen]
pub fn page_key(url: &str) -> String {
    PageKey::compute(url, &EngineConfig::default()).as_str().to_string()
}

/// Stateless decision for `url`; returns `{ url?, effectiveRef }`.
#[wasm_bindgen]
pub fn decide(url: &str, settings_json: &str) -> Result<JsValue, JsValue> {
    let settings = parse_settings(settings_json)?;
    let decision = decide_ref(&settings, url, &EngineConfig::default().referral_param);

    let result = js_sys::Object::new();
    if let RefAction::Set { url } = &decision.action {
        let _ = js_sys::Reflect::set(&result, &"url".into(), &JsValue::from_str(url));
    }
    let _ = js_sys::Reflect::set(&result, &"effectiveRef".into(), &JsValue::from_str(&decision.effective_ref));
    Ok(result.into())
}
