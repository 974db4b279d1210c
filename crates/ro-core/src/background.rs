//! Privileged background context
//!
//! Owns the redirect rule and the toolbar icon. Reacts to install/startup,
//! toolbar clicks, messages from other contexts and settings-store changes.

use crate::config::EngineConfig;
use crate::messaging::Message;
use crate::redirect::{RedirectFacility, RedirectRuleSynchronizer, SyncReport, SyncTrigger};
use crate::session::HostError;
use crate::settings::{Settings, SettingsChange, StoredSettings};
use crate::store::{SettingsStore, StoreError};

/// Error type for background event handling.
#[derive(Debug, thiserror::Error)]
pub enum BackgroundError {
    #[error("Settings store error: {0}")]
    Store(#[from] StoreError),
    #[error("Browser action failed: {0}")]
    Host(#[from] HostError),
    #[error("Reload requested without a sender tab")]
    NoSenderTab,
}

/// Toolbar icon variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconState {
    On,
    Off,
}

impl IconState {
    pub fn for_enabled(enabled: bool) -> Self {
        if enabled {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::On => "icon-on.png",
            Self::Off => "icon-off.png",
        }
    }
}

/// Browser tab identifier.
pub type TabId = i32;

/// Browser chrome the background context controls.
pub trait BrowserActions {
    fn set_icon(&mut self, icon: IconState) -> Result<(), HostError>;
    fn reload_tab(&mut self, tab: TabId) -> Result<(), HostError>;
}

pub struct Background<S, F, B> {
    store: S,
    sync: RedirectRuleSynchronizer<F>,
    actions: B,
}

impl<S, F, B> Background<S, F, B>
where
    S: SettingsStore,
    F: RedirectFacility,
    B: BrowserActions,
{
    pub fn new(store: S, facility: F, actions: B, config: EngineConfig) -> Self {
        Self {
            store,
            sync: RedirectRuleSynchronizer::new(facility, config),
            actions,
        }
    }

    /// Extension installed or updated: persist defaults for missing fields.
    pub fn on_installed(&mut self) -> Result<SyncReport, BackgroundError> {
        let settings = self.store.load()?.resolve();
        let stored = StoredSettings::from(&settings);
        self.store.save(&SettingsChange {
            enabled: stored.enabled,
            passive: stored.passive,
            referral_id: stored.referral_id,
        })?;
        if !settings.has_valid_referral() {
            log::warn!("stored referral id '{}' is not a valid address", settings.referral_id);
        }
        self.refresh(&settings, SyncTrigger::Installed)
    }

    /// Browser or session start.
    pub fn on_startup(&mut self) -> Result<SyncReport, BackgroundError> {
        let settings = self.settings()?;
        self.refresh(&settings, SyncTrigger::Startup)
    }

    /// Toolbar click toggles the feature.
    pub fn on_action_clicked(&mut self) -> Result<SyncReport, BackgroundError> {
        let current = self.settings()?;
        let change = SettingsChange::enabled(!current.enabled);
        self.store.save(&change)?;
        let settings = current.with_change(&change);
        self.refresh(&settings, SyncTrigger::Toggle)
    }

    /// Message from a page or the settings surface.
    ///
    /// Returns the sync report for settings updates, `None` for reloads.
    pub fn on_message(&mut self, message: &Message, sender_tab: Option<TabId>) -> Result<Option<SyncReport>, BackgroundError> {
        let (change, trigger) = match message {
            Message::UpdateState { enabled } => (SettingsChange::enabled(*enabled), SyncTrigger::Toggle),
            Message::UpdatePassive { passive } => (SettingsChange::passive(*passive), SyncTrigger::PassiveChanged),
            Message::UpdateReferral { referral_id } => {
                (SettingsChange::referral_id(referral_id.clone()), SyncTrigger::ReferralChanged)
            }
            Message::ReloadPage => {
                let tab = sender_tab.ok_or(BackgroundError::NoSenderTab)?;
                log::info!("reloading tab {tab} on request");
                self.actions.reload_tab(tab)?;
                return Ok(None);
            }
        };

        self.store.save(&change)?;
        let settings = self.settings()?;
        if change.enabled.is_some() {
            return self.refresh(&settings, trigger).map(Some);
        }
        Ok(Some(self.sync.sync(&settings, trigger)))
    }

    /// Settings-store change notification.
    pub fn on_settings_changed(&mut self, change: &SettingsChange) -> Result<Option<SyncReport>, BackgroundError> {
        let toggled = change.enabled.is_some();
        if !toggled && !change.touches_policy() {
            return Ok(None);
        }
        let settings = self.settings()?;
        if toggled {
            self.set_icon(settings.enabled);
        }
        Ok(Some(self.sync.sync(&settings, SyncTrigger::StorageChanged)))
    }

    fn refresh(&mut self, settings: &Settings, trigger: SyncTrigger) -> Result<SyncReport, BackgroundError> {
        let report = self.sync.sync(settings, trigger);
        self.set_icon(settings.enabled);
        Ok(report)
    }

    fn set_icon(&mut self, enabled: bool) {
        // icon failures never block rule sync
        if let Err(e) = self.actions.set_icon(IconState::for_enabled(enabled)) {
            log::warn!("failed to update icon: {e}");
        }
    }

    fn settings(&self) -> Result<Settings, BackgroundError> {
        Ok(self.store.load()?.resolve())
    }

    pub fn synchronizer(&self) -> &RedirectRuleSynchronizer<F> {
        &self.sync
    }

    pub fn synchronizer_mut(&mut self) -> &mut RedirectRuleSynchronizer<F> {
        &mut self.sync
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn actions(&self) -> &B {
        &self.actions
    }
}
