use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;

use ro_core::url::get_query_param;
use ro_core::DEFAULT_REFERRAL_ID;

const TOKEN_PAGE: &str = "https://objkt.com/tokens/KT1RJ6PbjHpwc3M5rw5s2Nbmefwbuwbdxton/1";
const FOREIGN_REF: &str = "tz1g4u4S2Fg7jsJVMmbYujxXQYsJB7ecSWGJ";

pub struct E2eOptions {
    pub chromedriver_url: String,
    pub extension_path: String,
    pub headless: bool,
}

pub fn run_e2e(opts: E2eOptions) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(run_e2e_async(opts))
}

async fn run_e2e_async(opts: E2eOptions) -> Result<(), String> {
    let extension_path = std::fs::canonicalize(&opts.extension_path)
        .map_err(|e| format!("Failed to resolve '{}': {}", opts.extension_path, e))?;

    let caps = chrome_caps(&extension_path, opts.headless)
        .map_err(|e| format!("Failed to set chrome arg: {}", e))?;

    let driver = WebDriver::new(&opts.chromedriver_url, caps)
        .await
        .map_err(|e| format!("Failed to connect to chromedriver: {}", e))?;

    let cdp = ChromeDevTools::new(driver.handle.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let Some(extension_id) = find_extension_id(&cdp).await else {
        driver.quit().await.ok();
        return Err("Failed to locate extension service worker".to_string());
    };
    log::info!("extension id {}", extension_id);

    let mut errors = Vec::new();

    let options_url = format!("chrome-extension://{}/options.html", extension_id);
    if let Err(e) = check_options_page(&driver, &options_url).await {
        errors.push(format!("Options page check failed: {}", e));
    }

    // active mode: a foreign ref is overwritten
    if let Err(e) = check_referral(&driver, &options_url, false, DEFAULT_REFERRAL_ID).await {
        errors.push(format!("Active mode check failed: {}", e));
    }

    // passive mode: a foreign ref survives
    if let Err(e) = check_referral(&driver, &options_url, true, FOREIGN_REF).await {
        errors.push(format!("Passive mode check failed: {}", e));
    }

    driver.quit().await.ok();

    if errors.is_empty() {
        println!("✓ E2E checks passed");
        Ok(())
    } else {
        Err(format!("E2E failed:\n- {}", errors.join("\n- ")))
    }
}

fn chrome_caps(extension_path: &PathBuf, headless: bool) -> WebDriverResult<ChromeCapabilities> {
    let mut caps = ChromeCapabilities::new();
    caps.add_arg(&format!("--disable-extensions-except={}", extension_path.display()))?;
    caps.add_arg(&format!("--load-extension={}", extension_path.display()))?;
    caps.add_arg("--no-first-run")?;
    caps.add_arg("--no-default-browser-check")?;
    if headless {
        caps.add_arg("--headless=new")?;
        caps.add_arg("--disable-gpu")?;
    }
    Ok(caps)
}

async fn find_extension_id(cdp: &ChromeDevTools) -> Option<String> {
    let targets = cdp.execute_cdp("Target.getTargets").await.ok()?;
    let infos = targets.get("targetInfos")?.as_array()?;
    infos.iter().find_map(|info| {
        let target_type = info.get("type").and_then(Value::as_str)?;
        let url = info.get("url").and_then(Value::as_str)?;
        if target_type != "service_worker" {
            return None;
        }
        let id = url.strip_prefix("chrome-extension://")?.split('/').next()?;
        (!id.is_empty()).then(|| id.to_string())
    })
}

async fn check_options_page(driver: &WebDriver, url: &str) -> WebDriverResult<()> {
    driver.goto(url).await?;
    driver.find(By::Id("wallet")).await?;
    driver.find(By::Id("toggle")).await?;
    Ok(())
}

/// Store settings from the options page, open a token page carrying a
/// foreign ref and read back the ref the page settles on.
async fn check_referral(driver: &WebDriver, options_url: &str, passive: bool, expected: &str) -> Result<(), String> {
    driver.goto(options_url)
        .await
        .map_err(|e| format!("Failed to open options page: {}", e))?;
    let script = format!(
        "const done = arguments[arguments.length - 1];\
         chrome.storage.local.set({{ enabled: true, passive: {passive}, referralId: '{DEFAULT_REFERRAL_ID}' }}, () => done(true));"
    );
    driver.execute_async(&script, Vec::<Value>::new())
        .await
        .map_err(|e| format!("Failed to store settings: {}", e))?;

    let page = format!("{}?ref={}", TOKEN_PAGE, FOREIGN_REF);
    driver.goto(&page)
        .await
        .map_err(|e| format!("Failed to open '{}': {}", page, e))?;
    // initial run delay plus debounce
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let current = driver.current_url()
        .await
        .map_err(|e| format!("Failed to read URL: {}", e))?;
    match get_query_param(current.as_str(), "ref") {
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(format!("ref is '{}', expected '{}'", found, expected)),
        None => Err(format!("no ref on '{}'", current)),
    }
}
