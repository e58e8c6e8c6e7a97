pub mod agent;
pub mod gateway;
pub mod tools_cmd;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use webscout_core::{Config, Paths};
use webscout_tools::browser::{BrowserSessionManager, BrowserSettings, ChromeDriver};
use webscout_tools::cache::FetchCache;
use webscout_tools::crawl::Crawler;
use webscout_tools::fetch::Fetcher;
use webscout_tools::url_guard::UrlGuard;
use webscout_tools::ToolRegistry;

/// Config file (explicit path or the default location) plus env overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(p) => Config::load(p).with_context(|| format!("failed to load config from {}", p.display()))?,
        None => Config::load_or_default(&Paths::new()).context("failed to load config")?,
    };
    config.apply_env()?;
    Ok(config)
}

/// Everything the agent's tools hang off.
pub struct Toolkit {
    pub cache: Arc<FetchCache>,
    pub registry: ToolRegistry,
    pub browser: Option<Arc<BrowserSessionManager>>,
}

impl Toolkit {
    /// Build the web tools and, when `with_browser`, try to start the browser.
    /// A browser that fails to launch only costs the browser tools.
    pub async fn build(config: &Config, with_browser: bool) -> anyhow::Result<Self> {
        let fetch = &config.fetch;
        let guard = UrlGuard::system();
        let cache = Arc::new(FetchCache::new(
            Duration::from_secs(fetch.cache_ttl_secs),
            fetch.cache_max_entries,
        ));
        let fetcher = Arc::new(
            Fetcher::new(
                guard.clone(),
                cache.clone(),
                Duration::from_secs(fetch.timeout_secs),
                fetch.max_chars,
            )
            .context("failed to build HTTP client")?,
        );
        let crawler = Arc::new(Crawler::new(fetcher.clone(), fetch.crawl_page_chars, fetch.crawl_max_chars));
        let mut registry = ToolRegistry::with_web_tools(fetcher, crawler);

        let browser = if with_browser {
            start_browser(config, guard).await
        } else {
            None
        };
        if let Some(session) = &browser {
            registry.register_browser_tools(session.clone());
        }

        Ok(Self { cache, registry, browser })
    }

    /// Release the cache and the browser.
    pub async fn shutdown(&self) {
        self.cache.clear().await;
        if let Some(browser) = &self.browser {
            browser.stop().await;
        }
    }
}

async fn start_browser(config: &Config, guard: UrlGuard) -> Option<Arc<BrowserSessionManager>> {
    let cfg = &config.browser;
    if !cfg.enabled {
        info!("Browser disabled by configuration");
        return None;
    }
    let driver = Arc::new(ChromeDriver::new(cfg.executable.clone(), Paths::new().browser_dir()));
    let settings = BrowserSettings {
        headless: cfg.headless,
        nav_timeout: Duration::from_millis(cfg.nav_timeout_ms),
        action_timeout: Duration::from_millis(cfg.action_timeout_ms),
    };
    let session = Arc::new(BrowserSessionManager::new(driver, settings, guard));
    match session.start().await {
        Ok(()) => Some(session),
        Err(e) => {
            warn!(error = %e, "Continuing without browser tools");
            None
        }
    }
}
