//! Settings surface logic (popup / options page).

use crate::address::{ReferralId, DEFAULT_REFERRAL_ID};
use crate::background::IconState;
use crate::messaging::Message;
use crate::settings::SettingsChange;
use crate::store::{SettingsStore, StoreError};
use crate::tracker::Millis;

/// Error type for form actions.
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("Invalid Tezos address")]
    InvalidAddress(String),
    #[error("Settings store error: {0}")]
    Store(#[from] StoreError),
}

/// Values shown when the surface opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormState {
    pub wallet: String,
    pub enabled: bool,
    pub passive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Success,
    Error,
}

impl Tone {
    pub fn color(&self) -> &'static str {
        match self {
            Self::Success => "green",
            Self::Error => "red",
        }
    }
}

/// Transient status line above the wallet input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub text: &'static str,
    pub tone: Tone,
    pub expires_at: Millis,
}

/// Result of a toggle: what to tell the background and what icon to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleEffect {
    pub message: Message,
    pub icon: Option<IconState>,
}

pub struct SettingsForm<S> {
    store: S,
    message_ttl_ms: Millis,
    status: Option<StatusMessage>,
}

impl<S: SettingsStore> SettingsForm<S> {
    pub fn new(store: S, message_ttl_ms: Millis) -> Self {
        Self { store, message_ttl_ms, status: None }
    }

    pub fn load(&self) -> Result<FormState, FormError> {
        let settings = self.store.load()?.resolve();
        Ok(FormState {
            wallet: settings.referral_id,
            enabled: settings.enabled,
            passive: settings.passive,
        })
    }

    /// Save the wallet field. Empty input restores the default address;
    /// invalid input is rejected without touching the store.
    pub fn save_wallet(&mut self, input: &str, now: Millis) -> Result<&StatusMessage, FormError> {
        let trimmed = input.trim();
        let candidate = if trimmed.is_empty() { DEFAULT_REFERRAL_ID } else { trimmed };

        let id = match ReferralId::parse(candidate) {
            Ok(id) => id,
            Err(_) => {
                self.show("Invalid Tezos address", Tone::Error, now);
                return Err(FormError::InvalidAddress(candidate.to_string()));
            }
        };

        let text = if id.is_default() {
            "Default referral wallet restored!"
        } else {
            "Referral wallet saved!"
        };
        self.store.save(&SettingsChange::referral_id(id.into_string()))?;
        Ok(self.show(text, Tone::Success, now))
    }

    /// Clear the wallet field, resetting to the default address.
    pub fn clear(&mut self, now: Millis) -> Result<&StatusMessage, FormError> {
        self.store.save(&SettingsChange::referral_id(DEFAULT_REFERRAL_ID))?;
        Ok(self.show("Referral wallet cleared!", Tone::Error, now))
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Result<ToggleEffect, FormError> {
        self.store.save(&SettingsChange::enabled(enabled))?;
        Ok(ToggleEffect {
            message: Message::UpdateState { enabled },
            icon: Some(IconState::for_enabled(enabled)),
        })
    }

    pub fn set_passive(&mut self, passive: bool) -> Result<ToggleEffect, FormError> {
        self.store.save(&SettingsChange::passive(passive))?;
        Ok(ToggleEffect { message: Message::UpdatePassive { passive }, icon: None })
    }

    /// Status message still visible at `now`.
    pub fn visible_message(&self, now: Millis) -> Option<&StatusMessage> {
        self.status.as_ref().filter(|m| now < m.expires_at)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn show(&mut self, text: &'static str, tone: Tone, now: Millis) -> &StatusMessage {
        self.status.insert(StatusMessage { text, tone, expires_at: now + self.message_ttl_ms })
    }
}
