//! RObjkt CLI
//!
//! Runs the referral decision, page keying and rule planning outside the
//! browser.

use std::fs;

use clap::{Parser, Subcommand};

use ro_core::clock::SystemClock;
use ro_core::redirect::{MemoryRedirectFacility, RuleState, SyncOutcome, SyncTrigger};
use ro_core::store::MemoryLocalStore;
use ro_core::{
    decide, EngineConfig, LocalReferralMirror, PageKey, RedirectRuleSynchronizer, RefAction, ReferralId, Settings,
};

#[cfg(feature = "e2e")]
mod e2e;

#[derive(Parser)]
#[command(name = "ro-cli")]
#[command(about = "RObjkt referral engine tools")]
struct Cli {
    /// Engine config JSON file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide the referral action for a URL
    Decide {
        #[arg(short, long)]
        url: String,

        /// Keep an existing referral instead of overwriting it
        #[arg(long)]
        passive: bool,

        /// Referral wallet (defaults to the built-in address)
        #[arg(short, long)]
        referral: Option<String>,

        /// JSON file holding the local referral map; updated in place
        #[arg(long)]
        mirror: Option<String>,
    },

    /// Print the page key used for deduplication
    PageKey {
        #[arg(short, long)]
        url: String,
    },

    /// Plan the redirect rule for the given settings
    Rule {
        #[arg(long)]
        enabled: bool,

        #[arg(long)]
        passive: bool,

        #[arg(short, long)]
        referral: Option<String>,

        /// Assume the facility can fill a parameter only when absent
        #[arg(long)]
        fill_if_absent: bool,
    },

    /// Validate a Tezos address
    CheckAddress { address: String },

    /// Load the unpacked extension in Chrome and check it end to end
    #[cfg(feature = "e2e")]
    E2e {
        #[arg(long, default_value = "http://localhost:9515")]
        chromedriver: String,

        /// Unpacked extension directory
        #[arg(short, long)]
        extension: String,

        #[arg(long)]
        headless: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Decide { url, passive, referral, mirror } => {
            cmd_decide(&config, &url, settings(true, passive, referral), mirror.as_deref())
        }
        Commands::PageKey { url } => cmd_page_key(&config, &url),
        Commands::Rule { enabled, passive, referral, fill_if_absent } => {
            cmd_rule(config, settings(enabled, passive, referral), fill_if_absent)
        }
        Commands::CheckAddress { address } => cmd_check_address(&address),
        #[cfg(feature = "e2e")]
        Commands::E2e { chromedriver, extension, headless } => e2e::run_e2e(e2e::E2eOptions {
            chromedriver_url: chromedriver,
            extension_path: extension,
            headless,
        }),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<EngineConfig, String> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    EngineConfig::from_json(&text).map_err(|e| format!("Invalid config '{}': {}", path, e))
}

fn settings(enabled: bool, passive: bool, referral: Option<String>) -> Settings {
    Settings {
        enabled,
        passive,
        referral_id: referral.unwrap_or_else(|| ReferralId::default_id().into_string()),
    }
}

fn cmd_decide(config: &EngineConfig, url: &str, settings: Settings, mirror: Option<&str>) -> Result<(), String> {
    if !settings.has_valid_referral() {
        log::warn!("referral '{}' is not a valid Tezos address", settings.referral_id);
    }

    let decision = decide(&settings, url, &config.referral_param);
    println!("Page key:      {}", PageKey::compute(url, config));
    println!("Mode:          {}", if settings.passive { "passive" } else { "active" });
    println!("Previous ref:  {}", decision.previous_ref.as_deref().unwrap_or("-"));
    println!("Effective ref: {}", decision.effective_ref);
    match &decision.action {
        RefAction::Set { url } => println!("Action:        set -> {}", url),
        RefAction::Keep => println!("Action:        keep"),
    }

    let Some(path) = mirror else {
        return Ok(());
    };

    let key = config.local_referral_key.as_str();
    let mut store = MemoryLocalStore::new();
    if let Ok(existing) = fs::read_to_string(path) {
        store = store.with_item(key, &existing);
    }

    let mut local = LocalReferralMirror::new(store, SystemClock, key);
    let path_only = ro_core::url::extract_path(url);
    let item = local
        .record(path_only, &decision.effective_ref)
        .map_err(|e| format!("Failed to record referral: {}", e))?;

    match item {
        Some(item) => {
            let raw = local.store().items().get(key).cloned().unwrap_or_default();
            fs::write(path, raw).map_err(|e| format!("Failed to write '{}': {}", path, e))?;
            println!("Recorded:      {} in '{}'", item, path);
        }
        None => println!("Recorded:      - (not a token page)"),
    }
    Ok(())
}

fn cmd_page_key(config: &EngineConfig, url: &str) -> Result<(), String> {
    println!("{}", PageKey::compute(url, config));
    Ok(())
}

fn cmd_rule(config: EngineConfig, settings: Settings, fill_if_absent: bool) -> Result<(), String> {
    let mut sync = RedirectRuleSynchronizer::new(MemoryRedirectFacility::new(fill_if_absent), config);
    let report = sync.sync(&settings, SyncTrigger::Startup);

    match report.outcome {
        SyncOutcome::Removed => {
            println!("Rule removed (feature disabled)");
            Ok(())
        }
        SyncOutcome::Installed { rewrite, degraded } => {
            let RuleState::Present(rule) = sync.state() else {
                return Err("Rule reported installed but state is absent".to_string());
            };
            println!("Rewrite:   {:?}{}", rewrite, if degraded { " (degraded from set-if-absent)" } else { "" });
            match rule.to_dnr_json() {
                Ok(json) => {
                    let pretty = serde_json::to_string_pretty(&json)
                        .map_err(|e| format!("Failed to encode rule: {}", e))?;
                    println!("{}", pretty);
                }
                Err(e) => println!("No DNR form: {}", e),
            }
            Ok(())
        }
        SyncOutcome::Failed(e) => Err(format!("Rule install failed: {}", e)),
    }
}

fn cmd_check_address(address: &str) -> Result<(), String> {
    let id = ReferralId::parse(address).map_err(|e| e.to_string())?;
    println!("'{}' is a valid Tezos address{}", id, if id.is_default() { " (default)" } else { "" });
    Ok(())
}
