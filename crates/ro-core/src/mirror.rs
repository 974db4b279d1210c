//! Local referral records
//!
//! The marketplace client keeps a map of content item -> referral shares in
//! page-local storage and reads it at purchase time. The mirror writes the
//! engine's effective referral into that map in the client's own format.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{format_local_timestamp, Clock};
use crate::store::{LocalStore, StoreError};

/// Share assigned to the single referrer, in basis points.
pub const FULL_SHARE: u32 = 10_000;

/// Key prefix of campaign-wide entries (`custom-<epoch millis>`).
pub const CAMPAIGN_PREFIX: &str = "custom-";

/// Matches current `/tokens/` and legacy `/asset/` item paths.
const CONTENT_ITEM_PATTERN: &str = r"/(?:tokens|asset)/(KT\w+)/(\d+)";

static CONTENT_ITEM_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Error type for mirror writes.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to encode referral map: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// Content Items
// =============================================================================

/// A marketplace item, identified by contract and token id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentItemId {
    pub contract: String,
    pub token_id: String,
}

impl ContentItemId {
    /// Extract the item from a URL path, if the path names one.
    pub fn from_path(path: &str) -> Option<Self> {
        let re = CONTENT_ITEM_RE
            .get_or_init(|| Regex::new(CONTENT_ITEM_PATTERN).ok())
            .as_ref()?;
        let caps = re.captures(path)?;
        Some(Self {
            contract: caps.get(1)?.as_str().to_string(),
            token_id: caps.get(2)?.as_str().to_string(),
        })
    }

    /// Key used in the referral map.
    pub fn key(&self) -> String {
        format!("{}-{}", self.contract, self.token_id)
    }
}

impl fmt::Display for ContentItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.contract, self.token_id)
    }
}

// =============================================================================
// Records
// =============================================================================

/// One referral entry, shaped exactly like the marketplace's own entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ReferralRecord {
    pub date: String,
    pub shares: BTreeMap<String, u32>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
}

impl ReferralRecord {
    /// A single-referrer record holding the full share.
    pub fn new(referral: &str, date: String) -> Self {
        let mut shares = BTreeMap::new();
        shares.insert(referral.to_string(), FULL_SHARE);
        Self {
            date,
            shares,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            utm_term: None,
            utm_content: None,
        }
    }

    /// The referrer, when the record has exactly one.
    pub fn referrer(&self) -> Option<&str> {
        match self.shares.len() {
            1 => self.shares.keys().next().map(String::as_str),
            _ => None,
        }
    }
}

/// Parse the stored referral map. Anything unreadable is an empty map.
pub fn parse_referral_map(raw: Option<&str>) -> Map<String, Value> {
    let Some(raw) = raw else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            log::warn!("local referral data is not an object ({}), starting empty", json_kind(&other));
            Map::new()
        }
        Err(e) => {
            log::warn!("error parsing local referral data: {e}, starting empty");
            Map::new()
        }
    }
}

fn credits_only(entry: &Value, referral: &str) -> bool {
    entry["shares"]
        .as_object()
        .is_some_and(|shares| shares.len() == 1 && shares.contains_key(referral))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Mirror
// =============================================================================

/// Writes referral records into the page-local store.
#[derive(Debug)]
pub struct LocalReferralMirror<S, C> {
    store: S,
    clock: C,
    storage_key: String,
}

impl<S: LocalStore, C: Clock> LocalReferralMirror<S, C> {
    pub fn new(store: S, clock: C, storage_key: impl Into<String>) -> Self {
        Self { store, clock, storage_key: storage_key.into() }
    }

    /// Record `referral` for the item named by `path`.
    ///
    /// Returns the item written, or `None` when the path names no item (no
    /// write happens then). Other entries in the map are preserved.
    pub fn record(&mut self, path: &str, referral: &str) -> Result<Option<ContentItemId>, MirrorError> {
        let Some(item) = ContentItemId::from_path(path) else {
            return Ok(None);
        };

        let mut map = self.load()?;
        let record = ReferralRecord::new(referral, format_local_timestamp(&self.clock.now_local()));
        map.insert(item.key(), serde_json::to_value(&record)?);

        let encoded = serde_json::to_string(&map)?;
        self.store.set_item(&self.storage_key, &encoded)?;
        log::info!("updated local referral for token {} wallet {}", item, referral);
        Ok(Some(item))
    }

    /// Add a campaign-wide entry crediting `referral`.
    ///
    /// Passive mode writes nothing when any entry already credits
    /// `referral`. Otherwise earlier campaign entries held by the same single
    /// referrer are replaced, so repeated seeding keeps one entry.
    pub fn seed_campaign(&mut self, referral: &str, passive: bool) -> Result<Option<String>, MirrorError> {
        let mut map = self.load()?;
        if passive && map.values().any(|entry| entry["shares"].get(referral).is_some()) {
            log::debug!("campaign referral for {} already present, keeping it", referral);
            return Ok(None);
        }

        map.retain(|key, entry| !(key.starts_with(CAMPAIGN_PREFIX) && credits_only(entry, referral)));

        let now = self.clock.now_local();
        let key = format!("{}{}", CAMPAIGN_PREFIX, now.timestamp_millis());
        let record = ReferralRecord::new(referral, format_local_timestamp(&now));
        map.insert(key.clone(), serde_json::to_value(&record)?);

        let encoded = serde_json::to_string(&map)?;
        self.store.set_item(&self.storage_key, &encoded)?;
        log::info!("seeded campaign referral {} for wallet {}", key, referral);
        Ok(Some(key))
    }

    /// The stored map; corrupt data reads as empty.
    pub fn load(&self) -> Result<Map<String, Value>, MirrorError> {
        let raw = self.store.get_item(&self.storage_key)?;
        Ok(parse_referral_map(raw.as_deref()))
    }

    /// Typed record for `item`, if one is stored and well-formed.
    pub fn record_for(&self, item: &ContentItemId) -> Result<Option<ReferralRecord>, MirrorError> {
        let map = self.load()?;
        Ok(map
            .get(&item.key())
            .and_then(|value| serde_json::from_value(value.clone()).ok()))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryLocalStore;

    const KEY: &str = "objkt-settings-local-referral";

    fn clock() -> FixedClock {
        FixedClock(DateTime::parse_from_rfc3339("2026-02-24T23:02:31.282-08:00").expect("time"))
    }

    fn mirror(store: MemoryLocalStore) -> LocalReferralMirror<MemoryLocalStore, FixedClock> {
        LocalReferralMirror::new(store, clock(), KEY)
    }

    #[test]
    fn extracts_items_from_both_path_shapes() {
        let item = ContentItemId::from_path("/tokens/KT1X/3/owners").expect("item");
        assert_eq!(item.key(), "KT1X-3");
        let legacy = ContentItemId::from_path("/asset/KT1RJ6PbjHpwc3M5rw5s2Nbmefwbuwbdxton/42").expect("item");
        assert_eq!(legacy.to_string(), "KT1RJ6PbjHpwc3M5rw5s2Nbmefwbuwbdxton-42");
        assert_eq!(ContentItemId::from_path("/explore"), None);
        assert_eq!(ContentItemId::from_path("/tokens/tz1abc/3"), None);
    }

    #[test]
    fn writes_record_in_marketplace_format() {
        let mut m = mirror(MemoryLocalStore::new());
        let item = m.record("/tokens/KT1X/3", "tzDEFAULT").expect("record");
        assert_eq!(item.as_ref().map(ContentItemId::key).as_deref(), Some("KT1X-3"));

        let raw = m.store().items().get(KEY).expect("stored");
        let value: Value = serde_json::from_str(raw).expect("json");
        assert_eq!(
            value["KT1X-3"],
            serde_json::json!({
                "date": "2026-02-24T23:02:31.282-08:00",
                "shares": {"tzDEFAULT": 10000},
                "utm_source": null,
                "utm_medium": null,
                "utm_campaign": null,
                "utm_term": null,
                "utm_content": null
            })
        );
    }

    #[test]
    fn no_write_without_item() {
        let mut m = mirror(MemoryLocalStore::new());
        assert_eq!(m.record("/explore", "tzDEFAULT").expect("record"), None);
        assert!(m.store().items().is_empty());
    }

    #[test]
    fn preserves_other_entries() {
        let mut m = mirror(MemoryLocalStore::new());
        m.record("/tokens/KT1A/1", "tzFIRST").expect("record");
        let first = m.load().expect("load")["KT1A-1"].clone();

        m.record("/tokens/KT1B/2", "tzSECOND").expect("record");
        let map = m.load().expect("load");
        assert_eq!(map["KT1A-1"], first);
        assert_eq!(map.len(), 2);

        let item = ContentItemId::from_path("/tokens/KT1B/2").expect("item");
        let record = m.record_for(&item).expect("load").expect("record");
        assert_eq!(record.referrer(), Some("tzSECOND"));
    }

    #[test]
    fn last_write_wins_per_item() {
        let mut m = mirror(MemoryLocalStore::new());
        m.record("/tokens/KT1A/1", "tzFIRST").expect("record");
        m.record("/asset/KT1A/1", "tzSECOND").expect("record");
        let map = m.load().expect("load");
        assert_eq!(map.len(), 1);
        assert_eq!(map["KT1A-1"]["shares"], serde_json::json!({"tzSECOND": 10000}));
    }

    #[test]
    fn keeps_unknown_entries_verbatim() {
        let existing = r#"{"custom-1":{"date":"x","shares":{"a":5000,"b":5000},"extra":true}}"#;
        let mut m = mirror(MemoryLocalStore::new().with_item(KEY, existing));
        m.record("/tokens/KT1A/1", "tzNEW").expect("record");
        let map = m.load().expect("load");
        assert_eq!(map["custom-1"]["extra"], Value::Bool(true));
        assert_eq!(map["custom-1"]["shares"]["b"], 5000);
    }

    #[test]
    fn corrupt_data_is_replaced() {
        for raw in ["{not json", "[1,2]", "\"text\"", "null"] {
            let mut m = mirror(MemoryLocalStore::new().with_item(KEY, raw));
            m.record("/tokens/KT1A/1", "tzNEW").expect("record");
            let map = m.load().expect("load");
            assert_eq!(map.len(), 1, "{raw}");
            assert!(map.contains_key("KT1A-1"));
        }
    }

    #[test]
    fn store_failure_is_reported() {
        let mut store = MemoryLocalStore::new();
        store.fail_writes(true);
        let mut m = mirror(store);
        assert!(matches!(m.record("/tokens/KT1A/1", "tz"), Err(MirrorError::Store(_))));
    }

    #[test]
    fn seeds_campaign_entry() {
        let mut m = mirror(MemoryLocalStore::new());
        let key = m.seed_campaign("tzDEFAULT", false).expect("seed").expect("written");
        assert_eq!(key, "custom-1772002951282");
        let map = m.load().expect("load");
        assert_eq!(map[&key]["shares"], serde_json::json!({"tzDEFAULT": 10000}));
        assert_eq!(map[&key]["utm_term"], Value::Null);
    }

    #[test]
    fn passive_seed_skips_credited_wallet() {
        let existing = r#"{"KT1A-1":{"date":"x","shares":{"tzDEFAULT":10000}}}"#;
        let mut m = mirror(MemoryLocalStore::new().with_item(KEY, existing));
        assert_eq!(m.seed_campaign("tzDEFAULT", true).expect("seed"), None);
        assert_eq!(m.load().expect("load").len(), 1);

        assert!(m.seed_campaign("tzOTHER", true).expect("seed").is_some());
        assert_eq!(m.load().expect("load").len(), 2);
    }

    #[test]
    fn active_seed_replaces_own_campaign_entries() {
        let existing = r#"{
            "custom-1":{"date":"x","shares":{"tzDEFAULT":10000}},
            "custom-2":{"date":"x","shares":{"tzOTHER":10000}},
            "KT1A-1":{"date":"x","shares":{"tzDEFAULT":10000}}
        }"#;
        let mut m = mirror(MemoryLocalStore::new().with_item(KEY, existing));
        let key = m.seed_campaign("tzDEFAULT", false).expect("seed").expect("written");

        let map = m.load().expect("load");
        assert!(!map.contains_key("custom-1"));
        assert!(map.contains_key("custom-2"));
        assert!(map.contains_key("KT1A-1"));
        assert!(map.contains_key(&key));
    }
}
