//! Browser tools over the shared [`BrowserSessionManager`] page.
//!
//! Every tool takes a page lease, runs one bounded operation and turns the
//! outcome into text. A destroyed page context resets the session and asks
//! the model to navigate again; other failures are reported as they are.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use webscout_core::{Error, Result};

use super::driver::{BrowserError, BrowserResult};
use super::session::{BrowserSessionManager, PageLease};
use crate::{str_param, truncate_chars, Tool, ToolSchema};

const MAX_OUTPUT_CHARS: usize = 20_000;
const CONTEXT_RESET: &str =
    "Browser context was destroyed and has been reset. Please navigate to the URL again.";

async fn bounded<T>(budget: Duration, op: impl Future<Output = BrowserResult<T>>) -> BrowserResult<T> {
    tokio::time::timeout(budget, op)
        .await
        .unwrap_or(Err(BrowserError::Timeout(budget)))
}

/// Text for a failed operation. `timed_out` is used for the timeout bucket;
/// `doing` completes "Browser error ..." for the rest.
async fn recover(lease: &mut PageLease<'_>, err: BrowserError, timed_out: String, doing: &str) -> String {
    match err {
        BrowserError::Timeout(_) => timed_out,
        BrowserError::ContextDestroyed(detail) => {
            warn!(detail = %detail, "Browser context destroyed; resetting");
            if let Err(e) = lease.reset().await {
                warn!(error = %e, "Browser reset failed");
            }
            CONTEXT_RESET.to_string()
        }
        other => format!("Browser error {}: {}", doing, other),
    }
}

fn cap_output(text: String) -> String {
    match truncate_chars(&text, MAX_OUTPUT_CHARS) {
        Some(head) => format!("{}\n\n[Truncated]", head),
        None => text,
    }
}

fn ms(d: Duration) -> u128 {
    d.as_millis()
}

// ============ navigate_browser ============

pub struct NavigateBrowserTool {
    session: Arc<BrowserSessionManager>,
}

impl NavigateBrowserTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for NavigateBrowserTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "navigate_browser",
            description: "Open a URL in the headless browser. Use for JavaScript-heavy pages that fetch cannot render.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "URL to open (http or https)" }
                },
                "required": ["url"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "url").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let url = str_param(&params, "url")?;
        if let Err(reason) = self.session.guard().check(url).await {
            return Ok(reason.to_string());
        }

        let doing = format!("navigating to {}", url);
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().nav_timeout;
        let outcome = match lease.page() {
            Ok(page) => bounded(budget, page.goto(url)).await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(()) => {
                debug!(url, "Browser navigated");
                format!("Navigated to {}", url)
            }
            Err(e) => {
                let timed_out = format!(
                    "Timed out navigating to {} after {}ms. The page may be partially loaded; try extract_text to see what is available.",
                    url,
                    ms(budget)
                );
                recover(&mut lease, e, timed_out, &doing).await
            }
        })
    }
}

// ============ click_element ============

pub struct ClickElementTool {
    session: Arc<BrowserSessionManager>,
}

impl ClickElementTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ClickElementTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "click_element",
            description: "Click the first visible element matching a CSS selector on the current browser page.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string", "description": "CSS selector" }
                },
                "required": ["selector"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "selector").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let selector = str_param(&params, "selector")?;
        let doing = format!("clicking '{}'", selector);
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().action_timeout;
        let outcome = match lease.page() {
            Ok(page) => bounded(budget, page.click(selector)).await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(()) => format!("Clicked element matching '{}'", selector),
            Err(e) => {
                let timed_out = format!(
                    "Timed out clicking '{}' after {}ms. The element may not be visible or may not exist.",
                    selector,
                    ms(budget)
                );
                recover(&mut lease, e, timed_out, &doing).await
            }
        })
    }
}

// ============ get_elements ============

pub struct GetElementsTool {
    session: Arc<BrowserSessionManager>,
}

impl GetElementsTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for GetElementsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_elements",
            description: "List elements on the current browser page matching a CSS selector, as a JSON array of the requested attributes.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string", "description": "CSS selector" },
                    "attributes": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Attributes to read per element; 'innerText' is the rendered text (default ['innerText'])"
                    }
                },
                "required": ["selector"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "selector")?;
        match params.get("attributes") {
            None | Some(Value::Null) | Some(Value::Array(_)) => Ok(()),
            Some(_) => Err(Error::Validation("attributes must be an array of strings".to_string())),
        }
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let selector = str_param(&params, "selector")?;
        let mut attributes: Vec<String> = params
            .get("attributes")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if attributes.is_empty() {
            attributes.push("innerText".to_string());
        }

        let doing = format!("querying '{}'", selector);
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().action_timeout;
        let outcome = match lease.page() {
            Ok(page) => bounded(budget, page.query_all(selector, &attributes)).await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(items) => cap_output(serde_json::to_string(&items)?),
            Err(e) => {
                let timed_out = format!("Timed out querying elements for '{}' after {}ms.", selector, ms(budget));
                recover(&mut lease, e, timed_out, &doing).await
            }
        })
    }
}

// ============ extract_text ============

pub struct ExtractTextTool {
    session: Arc<BrowserSessionManager>,
}

impl ExtractTextTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ExtractTextTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "extract_text",
            description: "Return all visible text of the current browser page.",
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        let doing = "extracting text";
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().action_timeout;
        let outcome = match lease.page() {
            Ok(page) => bounded(budget, page.inner_text()).await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(text) => cap_output(text.split_whitespace().collect::<Vec<_>>().join(" ")),
            Err(e) => {
                let timed_out = format!("Timed out extracting text after {}ms.", ms(budget));
                recover(&mut lease, e, timed_out, doing).await
            }
        })
    }
}

// ============ extract_hyperlinks ============

pub struct ExtractHyperlinksTool {
    session: Arc<BrowserSessionManager>,
}

impl ExtractHyperlinksTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for ExtractHyperlinksTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "extract_hyperlinks",
            description: "List the hyperlinks on the current browser page as JSON [{text, href}].",
            parameters: json!({
                "type": "object",
                "properties": {
                    "absolute_urls": {
                        "type": "boolean",
                        "description": "Resolve each href against the page URL (default false)"
                    }
                }
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        match params.get("absolute_urls") {
            None | Some(Value::Null) | Some(Value::Bool(_)) => Ok(()),
            Some(_) => Err(Error::Validation("absolute_urls must be a boolean".to_string())),
        }
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let absolute = params
            .get("absolute_urls")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let doing = "extracting hyperlinks";
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().action_timeout;
        let outcome = match lease.page() {
            Ok(page) => bounded(budget, page.links()).await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(links) => {
                let items: Vec<Value> = links
                    .into_iter()
                    .map(|l| {
                        let href = if absolute { l.absolute } else { l.href };
                        json!({ "text": l.text, "href": href })
                    })
                    .collect();
                cap_output(serde_json::to_string(&items)?)
            }
            Err(e) => {
                let timed_out = format!("Timed out extracting hyperlinks after {}ms.", ms(budget));
                recover(&mut lease, e, timed_out, doing).await
            }
        })
    }
}

// ============ current_webpage ============

pub struct CurrentWebpageTool {
    session: Arc<BrowserSessionManager>,
}

impl CurrentWebpageTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for CurrentWebpageTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "current_webpage",
            description: "Return the URL of the current browser page.",
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        let doing = "getting current URL";
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().action_timeout;
        let outcome = match lease.page() {
            Ok(page) => bounded(budget, page.url()).await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(url) => url,
            Err(e) => {
                let timed_out = format!("Timed out getting current URL after {}ms.", ms(budget));
                recover(&mut lease, e, timed_out, doing).await
            }
        })
    }
}

// ============ previous_webpage ============

pub struct PreviousWebpageTool {
    session: Arc<BrowserSessionManager>,
}

impl PreviousWebpageTool {
    pub fn new(session: Arc<BrowserSessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for PreviousWebpageTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "previous_webpage",
            description: "Go back one page in the browser history.",
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        let doing = "navigating back";
        let mut lease = match self.session.get_page().await {
            Ok(lease) => lease,
            Err(e) => return Ok(format!("Browser error {}: {}", doing, e)),
        };
        let budget = self.session.settings().nav_timeout;
        let outcome = match lease.page() {
            Ok(page) => match bounded(budget, page.go_back()).await {
                Ok(true) => bounded(budget, page.url()).await.map(Some),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(Some(url)) => format!("Navigated back to {}", url),
            Ok(None) => "No previous page in browser history.".to_string(),
            Err(e) => {
                let timed_out = format!("Timed out navigating back after {}ms.", ms(budget));
                recover(&mut lease, e, timed_out, doing).await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::session::fake::{manager, FakeDriver};
    use std::sync::atomic::Ordering;

    async fn started(driver: &FakeDriver) -> Arc<BrowserSessionManager> {
        let session = Arc::new(manager(driver.clone()));
        session.start().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_navigate_and_current_and_back() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        let nav = NavigateBrowserTool::new(session.clone());
        let current = CurrentWebpageTool::new(session.clone());
        let back = PreviousWebpageTool::new(session.clone());

        assert_eq!(
            nav.execute(json!({"url": "https://example.com/a"})).await.unwrap(),
            "Navigated to https://example.com/a"
        );
        assert_eq!(current.execute(json!({})).await.unwrap(), "https://example.com/a");
        assert_eq!(back.execute(json!({})).await.unwrap(), "Navigated back to about:blank");
        assert_eq!(
            back.execute(json!({})).await.unwrap(),
            "No previous page in browser history."
        );
    }

    #[tokio::test]
    async fn test_navigate_refuses_internal_addresses() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        let nav = NavigateBrowserTool::new(session.clone());

        let out = nav.execute(json!({"url": "http://169.254.169.254/latest"})).await.unwrap();
        assert!(out.starts_with("Blocked: URL resolves to a private/internal address"));
        let out = nav.execute(json!({"url": "file:///etc/passwd"})).await.unwrap();
        assert!(out.starts_with("Blocked: URL scheme 'file'"));
    }

    #[tokio::test]
    async fn test_navigate_timeout_is_reported() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        driver.control.hang_next.store(true, Ordering::SeqCst);

        let out = NavigateBrowserTool::new(session)
            .execute(json!({"url": "https://example.com/slow"}))
            .await
            .unwrap();
        assert!(out.starts_with("Timed out navigating to https://example.com/slow after 200ms"));
    }

    #[tokio::test]
    async fn test_context_destroyed_resets_and_next_call_works() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        let text = ExtractTextTool::new(session.clone());

        driver.control.destroy_next.store(true, Ordering::SeqCst);
        assert_eq!(text.execute(json!({})).await.unwrap(), CONTEXT_RESET);
        assert_eq!(driver.control.pages_created.load(Ordering::SeqCst), 2);

        assert_eq!(text.execute(json!({})).await.unwrap(), "text of about:blank");
    }

    #[tokio::test]
    async fn test_other_browser_errors_are_text() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        let out = ClickElementTool::new(session)
            .execute(json!({"selector": "#missing"}))
            .await
            .unwrap();
        assert_eq!(out, "Browser error clicking '#missing': No element matches selector '#missing'");
    }

    #[tokio::test]
    async fn test_get_elements_defaults_to_inner_text() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        let tool = GetElementsTool::new(session);

        let out = tool.execute(json!({"selector": "li"})).await.unwrap();
        let items: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(items, json!([{"innerText": "li#1 innerText"}, {"innerText": "li#2 innerText"}]));

        let out = tool
            .execute(json!({"selector": "a", "attributes": ["href", "title"]}))
            .await
            .unwrap();
        let items: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(items[1]["title"], "a#2 title");
    }

    #[tokio::test]
    async fn test_get_elements_timeout_reports_budget() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        driver.control.hang_next.store(true, Ordering::SeqCst);

        let out = GetElementsTool::new(session)
            .execute(json!({"selector": "li"}))
            .await
            .unwrap();
        assert_eq!(out, "Timed out querying elements for 'li' after 200ms.");
    }

    #[tokio::test]
    async fn test_extract_hyperlinks_relative_and_absolute() {
        let driver = FakeDriver::default();
        let session = started(&driver).await;
        let tool = ExtractHyperlinksTool::new(session);

        let raw: Value = serde_json::from_str(&tool.execute(json!({})).await.unwrap()).unwrap();
        assert_eq!(raw, json!([{"text": "Docs", "href": "/docs"}]));
        let abs: Value =
            serde_json::from_str(&tool.execute(json!({"absolute_urls": true})).await.unwrap()).unwrap();
        assert_eq!(abs[0]["href"], "https://example.com/docs");
    }

    #[tokio::test]
    async fn test_tools_report_unavailable_browser() {
        let session = Arc::new(manager(FakeDriver::default()));
        let out = CurrentWebpageTool::new(session).execute(json!({})).await.unwrap();
        assert!(out.starts_with("Browser error getting current URL: browser unavailable"));
    }
}
