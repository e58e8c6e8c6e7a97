pub mod browser;
pub mod cache;
pub mod crawl;
pub mod extract;
pub mod fetch;
pub mod registry;
pub mod url_guard;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;

use async_trait::async_trait;
use serde_json::Value;
use webscout_core::{Error, Result};

pub use registry::ToolRegistry;

/// Cut `s` to its first `max_chars` characters, respecting UTF-8 boundaries.
/// Returns `None` when `s` already fits.
pub fn truncate_chars(s: &str, max_chars: usize) -> Option<&str> {
    s.char_indices().nth(max_chars).map(|(idx, _)| &s[..idx])
}

/// Required string parameter, as a validation error when absent.
pub fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation(format!("Missing required parameter: {}", name)))
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// A named capability the agent can invoke.
///
/// `execute` returns caller-facing text. Anticipated failures (blocked URLs,
/// HTTP errors, browser timeouts) are part of that text; `Err` is reserved
/// for bad parameters and faults nobody planned for.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, params: Value) -> Result<String>;
}
