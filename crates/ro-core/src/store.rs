//! Storage seams: the settings store and the page-local key/value store.

use std::collections::HashMap;

use crate::settings::{SettingsChange, StoredSettings};

/// Error type for storage access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage write rejected: {0}")]
    WriteRejected(String),
    #[error("Stored value is malformed: {0}")]
    Malformed(String),
}

/// Persistent settings store shared by every context.
///
/// Change notifications are delivered by the host as [`SettingsChange`]
/// values; this trait only covers reads and writes.
pub trait SettingsStore {
    fn load(&self) -> Result<StoredSettings, StoreError>;
    fn save(&mut self, change: &SettingsChange) -> Result<(), StoreError>;
}

/// Page-local string store (`window.localStorage`).
pub trait LocalStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory settings store.
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    stored: StoredSettings,
    /// Every change written, in order
    pub writes: Vec<SettingsChange>,
}

impl MemorySettingsStore {
    pub fn new(stored: StoredSettings) -> Self {
        Self { stored, writes: Vec::new() }
    }

    pub fn stored(&self) -> &StoredSettings {
        &self.stored
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<StoredSettings, StoreError> {
        Ok(self.stored.clone())
    }

    fn save(&mut self, change: &SettingsChange) -> Result<(), StoreError> {
        self.stored.apply(change);
        self.writes.push(change.clone());
        Ok(())
    }
}

/// In-memory local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocalStore {
    items: HashMap<String, String>,
    fail_writes: bool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, key: &str, value: &str) -> Self {
        self.items.insert(key.to_string(), value.to_string());
        self
    }

    /// Reject every subsequent write (quota exceeded and similar).
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn items(&self) -> &HashMap<String, String> {
        &self.items
    }
}

impl LocalStore for MemoryLocalStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::WriteRejected(format!("write to '{key}' refused")));
        }
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
