use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    /// OpenAI-compatible base URL. Defaults to Groq.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_api_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    /// Maximum LLM calls per mission before the step budget is exhausted.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Overall wall-clock budget for one streamed mission.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_llm_retry_delay_ms")]
    pub llm_retry_delay_ms: u64,
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_max_steps() -> u32 {
    15
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_llm_max_retries() -> u32 {
    2
}

fn default_llm_retry_delay_ms() -> u64 {
    1000
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            max_steps: default_max_steps(),
            request_timeout_secs: default_request_timeout_secs(),
            llm_max_retries: default_llm_max_retries(),
            llm_retry_delay_ms: default_llm_retry_delay_ms(),
        }
    }
}

impl AgentDefaults {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_nav_timeout_ms")]
    pub nav_timeout_ms: u64,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// Explicit Chrome/Chromium binary. Searched on PATH when unset.
    #[serde(default)]
    pub executable: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_nav_timeout_ms() -> u64 {
    60_000
}

fn default_action_timeout_ms() -> u64 {
    10_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            headless: true,
            nav_timeout_ms: default_nav_timeout_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            executable: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Keys accepted in the `X-API-Key` header.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

fn default_gateway_host() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_rate_limit_rpm() -> u32 {
    20
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_prompt_chars() -> usize {
    2000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            api_keys: Vec::new(),
            rate_limit_rpm: default_rate_limit_rpm(),
            cors_origins: default_cors_origins(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// 0 disables the cap.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_fetch_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_crawl_page_chars")]
    pub crawl_page_chars: usize,
    #[serde(default = "default_crawl_max_chars")]
    pub crawl_max_chars: usize,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    512
}

fn default_fetch_max_chars() -> usize {
    20_000
}

fn default_crawl_page_chars() -> usize {
    3_000
}

fn default_crawl_max_chars() -> usize {
    30_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            max_chars: default_fetch_max_chars(),
            crawl_page_chars: default_crawl_page_chars(),
            crawl_max_chars: default_crawl_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub agents: AgentDefaults,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `WEBSCOUT_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(keys) = lookup("WEBSCOUT_API_KEYS") {
            self.gateway.api_keys = split_list(&keys);
        }
        if let Some(key) = lookup("WEBSCOUT_PROVIDER_API_KEY").or_else(|| lookup("GROQ_API_KEY")) {
            self.provider.api_key = key.trim().to_string();
        }
        if let Some(base) = lookup("WEBSCOUT_PROVIDER_API_BASE") {
            self.provider.api_base = base.trim().to_string();
        }
        if let Some(model) = lookup("WEBSCOUT_MODEL") {
            self.agents.model = model.trim().to_string();
        }
        if let Some(origins) = lookup("WEBSCOUT_CORS_ORIGINS") {
            self.gateway.cors_origins = split_list(&origins);
        }
        if let Some(rpm) = lookup("WEBSCOUT_RATE_LIMIT_RPM") {
            self.gateway.rate_limit_rpm = rpm.trim().parse().map_err(|_| {
                Error::Config(format!("WEBSCOUT_RATE_LIMIT_RPM must be an integer, got '{}'", rpm))
            })?;
        }
        if let Some(enabled) = lookup("WEBSCOUT_BROWSER_ENABLED") {
            self.browser.enabled = parse_bool("WEBSCOUT_BROWSER_ENABLED", &enabled)?;
        }
        if let Some(headless) = lookup("WEBSCOUT_BROWSER_HEADLESS") {
            self.browser.headless = parse_bool("WEBSCOUT_BROWSER_HEADLESS", &headless)?;
        }
        Ok(())
    }

    /// Check the settings a running gateway cannot do without.
    pub fn validate_for_gateway(&self) -> Result<()> {
        if self.gateway.api_keys.is_empty() {
            return Err(Error::Config(
                "no API keys configured (gateway.apiKeys or WEBSCOUT_API_KEYS)".to_string(),
            ));
        }
        if self.gateway.rate_limit_rpm == 0 {
            return Err(Error::Config("gateway.rateLimitRpm must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{} must be a boolean, got '{}'", name, other))),
    }
}
