//! Network-level redirect rule synchronization
//!
//! The background context keeps exactly one redirect rule (id 1) that adds
//! the referral parameter to top-level requests toward the marketplace.
//! Every sync removes the rule first and only then installs a fresh one, so
//! the rule is either absent or carries the latest settings.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::settings::Settings;

/// Fixed id of the referral redirect rule.
pub const RULE_ID: u32 = 1;

/// Error type for rule building and installation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("Malformed rule: {0}")]
    Malformed(String),
    #[error("Rule not expressible by this facility: {0}")]
    Unsupported(String),
    #[error("Facility rejected update: {0}")]
    Facility(String),
}

// =============================================================================
// Rule Model
// =============================================================================

bitflags::bitflags! {
    /// Request types the rule applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceTypes: u8 {
        const MAIN_FRAME = 1 << 0;
        const SUB_FRAME = 1 << 1;
        const XMLHTTPREQUEST = 1 << 2;
    }
}

impl ResourceTypes {
    /// Names as used by `declarativeNetRequest`.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::MAIN_FRAME) {
            names.push("main_frame");
        }
        if self.contains(Self::SUB_FRAME) {
            names.push("sub_frame");
        }
        if self.contains(Self::XMLHTTPREQUEST) {
            names.push("xmlhttprequest");
        }
        names
    }
}

/// How the referral parameter is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryRewrite {
    /// Always replace the parameter (active mode)
    Set,
    /// Only add the parameter when missing (passive mode)
    SetIfAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCondition {
    pub request_domains: Vec<String>,
    pub resource_types: ResourceTypes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub id: u32,
    pub priority: u32,
    pub condition: RuleCondition,
    pub param: String,
    pub value: String,
    pub rewrite: QueryRewrite,
}

impl RedirectRule {
    /// Build the referral rule for `settings`.
    pub fn for_settings(settings: &Settings, config: &EngineConfig, rewrite: QueryRewrite) -> Self {
        Self {
            id: RULE_ID,
            priority: config.rule_priority,
            condition: RuleCondition {
                request_domains: vec![config.target_domain.clone()],
                resource_types: ResourceTypes::MAIN_FRAME,
            },
            param: config.referral_param.clone(),
            value: settings.referral_id.clone(),
            rewrite,
        }
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.condition.request_domains.is_empty()
            || self.condition.request_domains.iter().any(|d| d.trim().is_empty())
        {
            return Err(RuleError::Malformed("empty request domain".to_string()));
        }
        if self.condition.resource_types.is_empty() {
            return Err(RuleError::Malformed("no resource types".to_string()));
        }
        if self.param.is_empty() || self.param.contains(&['=', '&', '#'][..]) {
            return Err(RuleError::Malformed(format!("invalid query key '{}'", self.param)));
        }
        if self.value.trim().is_empty() {
            return Err(RuleError::Malformed("empty referral value".to_string()));
        }
        Ok(())
    }

    /// Chrome `declarativeNetRequest` dynamic-rule object.
    ///
    /// DNR query transforms can only add or replace, so `SetIfAbsent` is
    /// rejected here.
    pub fn to_dnr_json(&self) -> Result<Value, RuleError> {
        self.validate()?;
        if self.rewrite == QueryRewrite::SetIfAbsent {
            return Err(RuleError::Unsupported(
                "declarativeNetRequest cannot add a parameter only when absent".to_string(),
            ));
        }
        Ok(json!({
            "id": self.id,
            "priority": self.priority,
            "action": {
                "type": "redirect",
                "redirect": {
                    "transform": {
                        "queryTransform": {
                            "addOrReplaceParams": [{ "key": self.param, "value": self.value }]
                        }
                    }
                }
            },
            "condition": {
                "requestDomains": self.condition.request_domains,
                "resourceTypes": self.condition.resource_types.names()
            }
        }))
    }
}

/// Batched `updateDynamicRules` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    pub remove_rule_ids: Vec<u32>,
    pub add_rules: Vec<Value>,
}

// =============================================================================
// Facilities
// =============================================================================

/// What a redirect facility can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilityCapabilities {
    pub fill_if_absent: bool,
}

/// Declarative network redirection facility.
pub trait RedirectFacility {
    fn capabilities(&self) -> FacilityCapabilities;
    /// Remove the rule with `id`; removing a missing rule is not an error.
    fn remove_rule(&mut self, id: u32) -> Result<(), RuleError>;
    fn install_rule(&mut self, rule: &RedirectRule) -> Result<(), RuleError>;
}

/// Facility operation, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilityOp {
    Remove(u32),
    Install(u32),
}

/// In-memory facility with configurable capability and failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryRedirectFacility {
    rules: BTreeMap<u32, RedirectRule>,
    fill_if_absent: bool,
    fail_installs: bool,
    pub ops: Vec<FacilityOp>,
}

impl MemoryRedirectFacility {
    pub fn new(fill_if_absent: bool) -> Self {
        Self { fill_if_absent, ..Self::default() }
    }

    pub fn fail_installs(&mut self, fail: bool) {
        self.fail_installs = fail;
    }

    pub fn rules(&self) -> &BTreeMap<u32, RedirectRule> {
        &self.rules
    }
}

impl RedirectFacility for MemoryRedirectFacility {
    fn capabilities(&self) -> FacilityCapabilities {
        FacilityCapabilities { fill_if_absent: self.fill_if_absent }
    }

    fn remove_rule(&mut self, id: u32) -> Result<(), RuleError> {
        self.ops.push(FacilityOp::Remove(id));
        self.rules.remove(&id);
        Ok(())
    }

    fn install_rule(&mut self, rule: &RedirectRule) -> Result<(), RuleError> {
        self.ops.push(FacilityOp::Install(rule.id));
        if self.fail_installs {
            return Err(RuleError::Facility("install refused".to_string()));
        }
        if rule.rewrite == QueryRewrite::SetIfAbsent && !self.fill_if_absent {
            return Err(RuleError::Unsupported("fill-if-absent".to_string()));
        }
        rule.validate()?;
        if self.rules.contains_key(&rule.id) {
            return Err(RuleError::Facility(format!("rule id {} already exists", rule.id)));
        }
        self.rules.insert(rule.id, rule.clone());
        Ok(())
    }
}

/// Facility that collects operations into one [`RuleUpdate`] for a
/// `declarativeNetRequest.updateDynamicRules` call made by the host.
#[derive(Debug, Clone, Default)]
pub struct DnrPlanFacility {
    update: RuleUpdate,
}

impl DnrPlanFacility {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the collected update, leaving an empty one.
    pub fn take_update(&mut self) -> RuleUpdate {
        std::mem::take(&mut self.update)
    }
}

impl RedirectFacility for DnrPlanFacility {
    fn capabilities(&self) -> FacilityCapabilities {
        FacilityCapabilities { fill_if_absent: false }
    }

    fn remove_rule(&mut self, id: u32) -> Result<(), RuleError> {
        // a queued add for the same id is superseded by this removal
        self.update.add_rules.retain(|rule| rule["id"] != id);
        if !self.update.remove_rule_ids.contains(&id) {
            self.update.remove_rule_ids.push(id);
        }
        Ok(())
    }

    fn install_rule(&mut self, rule: &RedirectRule) -> Result<(), RuleError> {
        let value = rule.to_dnr_json()?;
        self.update.add_rules.push(value);
        Ok(())
    }
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Event that caused a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    Installed,
    Startup,
    Toggle,
    ReferralChanged,
    PassiveChanged,
    StorageChanged,
}

/// Rule state as last left by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleState {
    Absent,
    Present(RedirectRule),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Feature disabled; no rule installed
    Removed,
    Installed {
        rewrite: QueryRewrite,
        /// Passive mode requested but the facility forced `Set`
        degraded: bool,
    },
    /// Installation failed; no rule installed
    Failed(RuleError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub outcome: SyncOutcome,
}

impl SyncReport {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Installed { degraded: true, .. })
    }
}

pub struct RedirectRuleSynchronizer<F> {
    facility: F,
    config: EngineConfig,
    state: RuleState,
}

impl<F: RedirectFacility> RedirectRuleSynchronizer<F> {
    pub fn new(facility: F, config: EngineConfig) -> Self {
        Self { facility, config, state: RuleState::Absent }
    }

    /// Bring the rule in line with `settings`.
    pub fn sync(&mut self, settings: &Settings, trigger: SyncTrigger) -> SyncReport {
        if let Err(e) = self.facility.remove_rule(RULE_ID) {
            log::warn!("failed to remove redirect rule {RULE_ID} ({trigger:?}): {e}");
        }
        self.state = RuleState::Absent;

        if !settings.enabled {
            log::info!("redirect rule removed ({trigger:?}): referral disabled");
            return SyncReport { trigger, outcome: SyncOutcome::Removed };
        }

        let fill_if_absent = self.facility.capabilities().fill_if_absent;
        let (rewrite, degraded) = match (settings.passive, fill_if_absent) {
            (false, _) => (QueryRewrite::Set, false),
            (true, true) => (QueryRewrite::SetIfAbsent, false),
            (true, false) => {
                log::warn!(
                    "passive mode cannot be expressed by the redirect facility; \
                     network rule will always set '{}'",
                    self.config.referral_param
                );
                (QueryRewrite::Set, true)
            }
        };

        let rule = RedirectRule::for_settings(settings, &self.config, rewrite);
        let result = rule.validate().and_then(|()| self.facility.install_rule(&rule));
        match result {
            Ok(()) => {
                log::info!(
                    "redirect rule {} installed ({trigger:?}): {:?} {}={}",
                    rule.id,
                    rewrite,
                    rule.param,
                    rule.value
                );
                self.state = RuleState::Present(rule);
                SyncReport { trigger, outcome: SyncOutcome::Installed { rewrite, degraded } }
            }
            Err(e) => {
                log::error!("failed to install redirect rule ({trigger:?}): {e}");
                SyncReport { trigger, outcome: SyncOutcome::Failed(e) }
            }
        }
    }

    pub fn state(&self) -> &RuleState {
        &self.state
    }

    pub fn facility(&self) -> &F {
        &self.facility
    }

    pub fn facility_mut(&mut self) -> &mut F {
        &mut self.facility
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool, passive: bool, referral: &str) -> Settings {
        Settings { enabled, passive, referral_id: referral.to_string() }
    }

    fn sync(fill_if_absent: bool) -> RedirectRuleSynchronizer<MemoryRedirectFacility> {
        RedirectRuleSynchronizer::new(MemoryRedirectFacility::new(fill_if_absent), EngineConfig::default())
    }

    #[test]
    fn disabled_leaves_no_rule() {
        let mut s = sync(true);
        s.sync(&settings(true, false, "tzA"), SyncTrigger::Startup);
        let report = s.sync(&settings(false, false, "tzA"), SyncTrigger::Toggle);
        assert_eq!(report.outcome, SyncOutcome::Removed);
        assert_eq!(s.state(), &RuleState::Absent);
        assert!(s.facility().rules().is_empty());
    }

    #[test]
    fn always_removes_before_install() {
        let mut s = sync(true);
        s.sync(&settings(false, true, "tzA"), SyncTrigger::Installed);
        s.sync(&settings(true, true, "tzA"), SyncTrigger::Toggle);
        assert_eq!(
            s.facility().ops,
            vec![FacilityOp::Remove(1), FacilityOp::Remove(1), FacilityOp::Install(1)]
        );
    }

    #[test]
    fn converges_to_latest_settings() {
        let mut s = sync(true);
        let sequence = [
            (settings(true, true, "tzA"), SyncTrigger::Startup),
            (settings(true, false, "tzA"), SyncTrigger::PassiveChanged),
            (settings(false, false, "tzA"), SyncTrigger::Toggle),
            (settings(true, false, "tzB"), SyncTrigger::ReferralChanged),
        ];
        for (settings, trigger) in &sequence {
            s.sync(settings, *trigger);
        }

        let rules = s.facility().rules();
        assert_eq!(rules.len(), 1);
        let rule = &rules[&RULE_ID];
        assert_eq!(rule.value, "tzB");
        assert_eq!(rule.rewrite, QueryRewrite::Set);
        assert_eq!(s.state(), &RuleState::Present(rule.clone()));
    }

    #[test]
    fn passive_uses_fill_if_absent_when_supported() {
        let mut s = sync(true);
        let report = s.sync(&settings(true, true, "tzA"), SyncTrigger::Startup);
        assert_eq!(report.outcome, SyncOutcome::Installed { rewrite: QueryRewrite::SetIfAbsent, degraded: false });
    }

    #[test]
    fn passive_degrades_to_set_when_unsupported() {
        let mut s = sync(false);
        let report = s.sync(&settings(true, true, "tzA"), SyncTrigger::Startup);
        assert!(report.is_degraded());
        assert_eq!(report.outcome, SyncOutcome::Installed { rewrite: QueryRewrite::Set, degraded: true });
        assert_eq!(s.facility().rules()[&RULE_ID].rewrite, QueryRewrite::Set);
    }

    #[test]
    fn install_failure_leaves_rule_absent() {
        let mut s = sync(true);
        s.sync(&settings(true, false, "tzA"), SyncTrigger::Startup);
        s.facility_mut().fail_installs(true);
        let report = s.sync(&settings(true, false, "tzB"), SyncTrigger::ReferralChanged);
        assert!(matches!(report.outcome, SyncOutcome::Failed(RuleError::Facility(_))));
        assert_eq!(s.state(), &RuleState::Absent);
        assert!(s.facility().rules().is_empty());
    }

    #[test]
    fn malformed_rule_is_not_installed() {
        let mut s = sync(true);
        let report = s.sync(&settings(true, false, "  "), SyncTrigger::ReferralChanged);
        assert!(matches!(report.outcome, SyncOutcome::Failed(RuleError::Malformed(_))));
        assert_eq!(s.facility().ops, vec![FacilityOp::Remove(1)]);
    }

    #[test]
    fn dnr_json_shape() {
        let rule = RedirectRule::for_settings(&settings(true, false, "tzA"), &EngineConfig::default(), QueryRewrite::Set);
        let value = rule.to_dnr_json().expect("json");
        assert_eq!(
            value,
            json!({
                "id": 1,
                "priority": 1,
                "action": {
                    "type": "redirect",
                    "redirect": {"transform": {"queryTransform": {
                        "addOrReplaceParams": [{"key": "ref", "value": "tzA"}]
                    }}}
                },
                "condition": {"requestDomains": ["objkt.com"], "resourceTypes": ["main_frame"]}
            })
        );

        let passive = RedirectRule { rewrite: QueryRewrite::SetIfAbsent, ..rule };
        assert!(matches!(passive.to_dnr_json(), Err(RuleError::Unsupported(_))));
    }

    #[test]
    fn dnr_plan_batches_update() {
        let mut s = RedirectRuleSynchronizer::new(DnrPlanFacility::new(), EngineConfig::default());
        let report = s.sync(&settings(true, true, "tzA"), SyncTrigger::StorageChanged);
        assert!(report.is_degraded());
        let update = s.facility_mut().take_update();
        assert_eq!(update.remove_rule_ids, vec![1]);
        assert_eq!(update.add_rules.len(), 1);

        s.sync(&settings(false, true, "tzA"), SyncTrigger::Toggle);
        let update = s.facility_mut().take_update();
        assert_eq!(update.remove_rule_ids, vec![1]);
        assert!(update.add_rules.is_empty());
    }

    #[test]
    fn dnr_plan_keeps_only_latest_rule_between_flushes() {
        let mut s = RedirectRuleSynchronizer::new(DnrPlanFacility::new(), EngineConfig::default());
        s.sync(&settings(true, false, "tzA"), SyncTrigger::Startup);
        s.sync(&settings(true, false, "tzB"), SyncTrigger::ReferralChanged);
        let update = s.facility_mut().take_update();
        assert_eq!(update.remove_rule_ids, vec![1]);
        assert_eq!(update.add_rules.len(), 1);
        assert_eq!(
            update.add_rules[0]["action"]["redirect"]["transform"]["queryTransform"]["addOrReplaceParams"][0]["value"],
            "tzB"
        );

        s.sync(&settings(true, false, "tzA"), SyncTrigger::Toggle);
        s.sync(&settings(false, false, "tzA"), SyncTrigger::Toggle);
        let update = s.facility_mut().take_update();
        assert_eq!(update.remove_rule_ids, vec![1]);
        assert!(update.add_rules.is_empty());
        assert_eq!(s.state(), &RuleState::Absent);
    }
}
