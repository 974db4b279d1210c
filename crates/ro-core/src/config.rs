//! Tunable engine constants.

use serde::{Deserialize, Serialize};

use crate::messaging::RetryPolicy;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Engine configuration. Every field has a default, so a partial JSON
/// object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Marketplace domain the redirect rule targets
    pub target_domain: String,
    /// Query parameter carrying the referral identifier
    pub referral_param: String,
    /// Trailing-edge debounce window for navigation signals
    pub debounce_ms: u64,
    /// Delay before the first run after script start
    pub initial_delay_ms: u64,
    /// Retry interval while waiting for the observed container
    pub observer_retry_ms: u64,
    /// Trailing path segments that do not change content identity
    pub tab_suffixes: Vec<String>,
    /// Local-store key holding the referral map
    pub local_referral_key: String,
    /// Retry policy for cross-context messages
    pub message_retry: RetryPolicy,
    /// How long settings-surface status messages stay visible
    pub message_ttl_ms: u64,
    /// Priority of the redirect rule
    pub rule_priority: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_domain: "objkt.com".to_string(),
            referral_param: "ref".to_string(),
            debounce_ms: 300,
            initial_delay_ms: 100,
            observer_retry_ms: 50,
            tab_suffixes: ["curations", "owners", "history", "offers", "bids", "activities"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            local_referral_key: "objkt-settings-local-referral".to_string(),
            message_retry: RetryPolicy::default(),
            message_ttl_ms: 3000,
            rule_priority: 1,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON and validate it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_domain.trim().is_empty() {
            return Err(ConfigError::InvalidValue("targetDomain must not be empty".to_string()));
        }
        if self.referral_param.is_empty() || self.referral_param.contains(&['=', '&', '#', '?'][..]) {
            return Err(ConfigError::InvalidValue(format!(
                "referralParam '{}' is not a valid query key",
                self.referral_param
            )));
        }
        if self.local_referral_key.is_empty() {
            return Err(ConfigError::InvalidValue("localReferralKey must not be empty".to_string()));
        }
        if self.tab_suffixes.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(ConfigError::InvalidValue(
                "tabSuffixes must be single non-empty path segments".to_string(),
            ));
        }
        Ok(())
    }
}
