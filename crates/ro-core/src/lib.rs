//! RObjkt Core Library
//!
//! This crate provides the navigation-aware referral synchronization engine
//! used by the RObjkt browser extension. It keeps the marketplace `ref` query
//! parameter consistent across SPA navigation, reloads and the network-level
//! redirect rule.
//!
//! # Architecture
//!
//! Every browser facility is an injected trait, so the engine runs the same
//! way inside the wasm content script, the background worker, the CLI and
//! tests. Time is passed in as [`tracker::Millis`] and hosts drive the engine
//! by calling `tick` at the reported wakeup.
//!
//! # Modules
//!
//! - `address`: referral address validation
//! - `config`: tunable engine constants
//! - `url`: allocation-light URL and query helpers
//! - `page_key`: content-identity dedup keys
//! - `tracker`: SPA navigation detection and debounce
//! - `decision`: referral decision table and dedup
//! - `mirror`: local referral record persistence
//! - `redirect`: network redirect rule synchronization
//! - `messaging`: cross-context messages and bounded retry
//! - `session`: in-page pipeline wiring tracker, engine and mirror
//! - `background`: privileged-context event handling
//! - `settings_form`: settings surface logic
//! - `store` / `clock`: storage and time seams

pub mod address;
pub mod background;
pub mod clock;
pub mod config;
pub mod decision;
pub mod messaging;
pub mod mirror;
pub mod page_key;
pub mod redirect;
pub mod session;
pub mod settings;
pub mod settings_form;
pub mod store;
pub mod tracker;
pub mod url;

// Re-export commonly used types
pub use address::{is_valid_address, ReferralId, DEFAULT_REFERRAL_ID};
pub use background::Background;
pub use config::EngineConfig;
pub use decision::{decide, Decision, ReferralDecisionEngine, RefAction};
pub use messaging::{Message, MessageChannel, Outbox};
pub use mirror::{ContentItemId, LocalReferralMirror, ReferralRecord};
pub use page_key::PageKey;
pub use redirect::{RedirectFacility, RedirectRule, RedirectRuleSynchronizer, SyncTrigger};
pub use session::{ContentSession, PageHost};
pub use settings::{Settings, SettingsChange, StoredSettings};
pub use tracker::{Millis, NavigationKind, NavigationSignal, NavigationTracker, SignalOrigin};
