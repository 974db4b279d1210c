//! User settings as persisted by the settings store.

use serde::{Deserialize, Serialize};

use crate::address::{is_valid_address, DEFAULT_REFERRAL_ID};

/// Resolved settings snapshot handed to the engine and the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub enabled: bool,
    pub passive: bool,
    pub referral_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            passive: true,
            referral_id: DEFAULT_REFERRAL_ID.to_string(),
        }
    }
}

impl Settings {
    /// True if the referral id has the expected address format.
    ///
    /// Stored values can bypass the settings surface, so the engine never
    /// assumes this holds.
    pub fn has_valid_referral(&self) -> bool {
        is_valid_address(&self.referral_id)
    }

    /// Apply a partial update, returning the new snapshot.
    pub fn with_change(&self, change: &SettingsChange) -> Self {
        Self {
            enabled: change.enabled.unwrap_or(self.enabled),
            passive: change.passive.unwrap_or(self.passive),
            referral_id: change
                .referral_id
                .clone()
                .unwrap_or_else(|| self.referral_id.clone()),
        }
    }
}

/// Settings record as found in storage; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct StoredSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_id: Option<String>,
}

impl StoredSettings {
    /// Fill missing fields with defaults.
    pub fn resolve(&self) -> Settings {
        Settings::default().with_change(&SettingsChange {
            enabled: self.enabled,
            passive: self.passive,
            referral_id: self.referral_id.clone(),
        })
    }

    /// Merge the fields present in `change`.
    pub fn apply(&mut self, change: &SettingsChange) {
        if let Some(enabled) = change.enabled {
            self.enabled = Some(enabled);
        }
        if let Some(passive) = change.passive {
            self.passive = Some(passive);
        }
        if let Some(referral_id) = &change.referral_id {
            self.referral_id = Some(referral_id.clone());
        }
    }
}

impl From<&Settings> for StoredSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            enabled: Some(settings.enabled),
            passive: Some(settings.passive),
            referral_id: Some(settings.referral_id.clone()),
        }
    }
}

/// A partial settings update. Used both as a store write and as the payload
/// of a change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_id: Option<String>,
}

impl SettingsChange {
    pub fn enabled(enabled: bool) -> Self {
        Self { enabled: Some(enabled), ..Self::default() }
    }

    pub fn passive(passive: bool) -> Self {
        Self { passive: Some(passive), ..Self::default() }
    }

    pub fn referral_id(referral_id: impl Into<String>) -> Self {
        Self { referral_id: Some(referral_id.into()), ..Self::default() }
    }

    /// True if the change affects the referral policy (passive or referral id).
    pub fn touches_policy(&self) -> bool {
        self.passive.is_some() || self.referral_id.is_some()
    }
}
