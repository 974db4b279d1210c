//! Referral decision table and per-page dedup.

use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::page_key::PageKey;
use crate::settings::Settings;
use crate::url::{get_query_param, set_query_param};

/// What to do with the page URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefAction {
    /// Replace the URL in place with this one
    Set { url: String },
    /// Leave the URL untouched
    Keep,
}

/// Outcome of the decision table for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: RefAction,
    /// Referral value present on the page once the action is applied
    pub effective_ref: String,
    /// Referral value found on the page before the decision
    pub previous_ref: Option<String>,
}

impl Decision {
    pub fn modifies_url(&self) -> bool {
        matches!(self.action, RefAction::Set { .. })
    }
}

/// Apply the referral decision table to `url`.
///
/// | passive | ref present | ref == id | action |
/// |---------|-------------|-----------|--------|
/// | yes     | no          | -         | set    |
/// | yes     | yes         | -         | keep   |
/// | no      | no          | -         | set    |
/// | no      | yes         | no        | set    |
/// | no      | yes         | yes       | keep   |
///
/// An empty `ref` value counts as absent.
pub fn decide(settings: &Settings, url: &str, param: &str) -> Decision {
    let previous_ref = get_query_param(url, param).filter(|v| !v.is_empty());
    let referral = settings.referral_id.as_str();

    let keep_existing = match previous_ref.as_deref() {
        None => false,
        Some(_) if settings.passive => true,
        Some(current) => current == referral,
    };

    if keep_existing {
        let effective_ref = previous_ref.clone().unwrap_or_default();
        return Decision { action: RefAction::Keep, effective_ref, previous_ref };
    }

    Decision {
        action: RefAction::Set { url: set_query_param(url, param, referral) },
        effective_ref: referral.to_string(),
        previous_ref,
    }
}

/// Pipeline phase of the in-page engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePhase {
    #[default]
    Idle,
    /// Reading the current location
    Loading,
    /// Running the decision table
    Deciding,
    /// Writing the URL and the local record
    Applying,
}

/// Result of evaluating one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Feature is off; nothing to do
    Disabled,
    /// This logical page was already handled in this session
    AlreadyProcessed(PageKey),
    /// Decision ready to apply; call `mark_processed` once applied
    Pending(PageKey, Decision),
}

/// Decision engine with an in-memory set of processed pages.
#[derive(Debug, Clone)]
pub struct ReferralDecisionEngine {
    config: EngineConfig,
    processed: HashSet<PageKey>,
    phase: EnginePhase,
}

impl ReferralDecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, processed: HashSet::new(), phase: EnginePhase::Idle }
    }

    pub fn evaluate(&self, settings: &Settings, url: &str) -> Evaluation {
        if !settings.enabled {
            return Evaluation::Disabled;
        }
        let key = PageKey::compute(url, &self.config);
        if self.processed.contains(&key) {
            return Evaluation::AlreadyProcessed(key);
        }
        let decision = decide(settings, url, &self.config.referral_param);
        Evaluation::Pending(key, decision)
    }

    pub fn mark_processed(&mut self, key: PageKey) {
        self.processed.insert(key);
    }

    pub fn is_processed(&self, key: &PageKey) -> bool {
        self.processed.contains(key)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Forget every processed page, e.g. after a policy change.
    pub fn reset(&mut self) {
        self.processed.clear();
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Move to `next`, logging the transition.
    pub fn transition(&mut self, next: EnginePhase) {
        if self.phase != next {
            log::debug!("engine phase {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
