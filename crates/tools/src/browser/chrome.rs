//! Chrome/Chromium backend over the DevTools Protocol.
//!
//! One browser process per driver launch. Contexts are CDP browser contexts
//! (`Target.createBrowserContext`), pages are targets inside them with their
//! own WebSocket connection.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cdp::CdpClient;
use super::driver::{
    BrowserDriver, BrowserError, BrowserHandle, BrowserResult, ContextHandle, PageHandle, PageLink,
};

const CDP_READY_SECS: u64 = 15;

/// CDP failures that mean the page's execution context is gone.
const CONTEXT_DESTROYED_MARKERS: &[&str] = &[
    "Execution context was destroyed",
    "Cannot find context with specified id",
    "Inspected target navigated or closed",
    "Target closed",
];

pub(crate) fn classify_cdp_error(msg: String) -> BrowserError {
    if CONTEXT_DESTROYED_MARKERS.iter().any(|m| msg.contains(m)) {
        BrowserError::ContextDestroyed(msg)
    } else {
        BrowserError::Failed(msg)
    }
}

/// JS string literal for embedding user input in an expression.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

pub struct ChromeDriver {
    executable: Option<String>,
    profile_root: PathBuf,
}

impl ChromeDriver {
    /// `executable` overrides the PATH search; profiles go under `profile_root`.
    pub fn new(executable: Option<String>, profile_root: PathBuf) -> Self {
        Self {
            executable,
            profile_root,
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn launch(&self, headless: bool) -> BrowserResult<Box<dyn BrowserHandle>> {
        let binary = match &self.executable {
            Some(path) => path.clone(),
            None => find_browser_binary().ok_or_else(|| {
                BrowserError::Unavailable("Chrome/Chromium not found. Please install it.".to_string())
            })?,
        };

        let user_data_dir = self.profile_root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&user_data_dir).await.map_err(|e| {
            BrowserError::Unavailable(format!("Failed to create profile dir: {}", e))
        })?;

        let port = find_free_port().await.map_err(BrowserError::Unavailable)?;
        let args = build_browser_args(port, &user_data_dir, headless);
        info!(binary = %binary, port, headless, "Launching browser");

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Unavailable(format!("Failed to launch {}: {}", binary, e)))?;

        let ws_url = wait_for_cdp_ready(port, CDP_READY_SECS)
            .await
            .map_err(BrowserError::Unavailable)?;
        let cdp = CdpClient::connect(&ws_url)
            .await
            .map_err(BrowserError::Unavailable)?;
        info!(ws_url = %ws_url, "CDP connection established");

        Ok(Box::new(ChromeBrowser {
            cdp: Arc::new(cdp),
            port,
            child: Mutex::new(child),
            user_data_dir,
        }))
    }
}

struct ChromeBrowser {
    cdp: Arc<CdpClient>,
    port: u16,
    child: Mutex<Child>,
    user_data_dir: PathBuf,
}

#[async_trait]
impl BrowserHandle for ChromeBrowser {
    async fn new_context(&self, user_agent: &str) -> BrowserResult<Box<dyn ContextHandle>> {
        let result = self
            .cdp
            .send_command("Target.createBrowserContext", json!({ "disposeOnDetach": true }))
            .await
            .map_err(classify_cdp_error)?;
        let context_id = result
            .get("browserContextId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrowserError::Failed("No browserContextId returned".to_string()))?
            .to_string();
        debug!(context = %context_id, "Created browser context");
        Ok(Box::new(ChromeContext {
            browser: self.cdp.clone(),
            port: self.port,
            context_id,
            user_agent: user_agent.to_string(),
        }))
    }

    fn is_connected(&self) -> bool {
        !self.cdp.is_closed()
    }

    async fn close(&self) -> BrowserResult<()> {
        if let Err(e) = self.cdp.send_command("Browser.close", json!({})).await {
            debug!(error = %e, "CDP Browser.close failed (may already be closed)");
        }
        let kill = self.child.lock().await.kill().await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!(error = %e, "Could not remove browser profile dir");
        }
        kill.map_err(|e| BrowserError::Failed(format!("Failed to kill browser: {}", e)))
    }
}

struct ChromeContext {
    browser: Arc<CdpClient>,
    port: u16,
    context_id: String,
    user_agent: String,
}

#[async_trait]
impl ContextHandle for ChromeContext {
    async fn new_page(&self) -> BrowserResult<Box<dyn PageHandle>> {
        let target_id = self
            .browser
            .create_target("about:blank", Some(&self.context_id))
            .await
            .map_err(classify_cdp_error)?;
        let ws_url = get_target_ws_url(self.port, &target_id)
            .await
            .map_err(BrowserError::Failed)?;
        let cdp = CdpClient::connect(&ws_url).await.map_err(BrowserError::Failed)?;

        cdp.enable_domain("Page").await.map_err(classify_cdp_error)?;
        cdp.enable_domain("Runtime").await.map_err(classify_cdp_error)?;
        cdp.send_command(
            "Network.setUserAgentOverride",
            json!({ "userAgent": self.user_agent }),
        )
        .await
        .map_err(classify_cdp_error)?;

        debug!(target = %target_id, "Opened page");
        Ok(Box::new(ChromePage {
            cdp,
            browser: self.browser.clone(),
            target_id,
        }))
    }

    async fn close(&self) -> BrowserResult<()> {
        self.browser
            .send_command(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
            )
            .await
            .map_err(classify_cdp_error)?;
        Ok(())
    }
}

struct ChromePage {
    cdp: CdpClient,
    browser: Arc<CdpClient>,
    target_id: String,
}

impl ChromePage {
    async fn eval(&self, expression: &str) -> BrowserResult<Value> {
        self.cdp.evaluate_js(expression).await.map_err(classify_cdp_error)
    }

    /// Navigate and, if a new document starts loading, wait for its load event.
    async fn navigate_and_wait(&self, url: &str) -> BrowserResult<()> {
        let mut loaded = self.cdp.subscribe_event("Page.loadEventFired").await;
        let result = self.cdp.navigate(url).await.map_err(classify_cdp_error)?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(BrowserError::Failed(format!("Navigation failed: {}", err)));
        }
        // Same-document navigations have no loader and fire no load event.
        if result.get("loaderId").is_some() {
            loaded.recv().await.ok_or_else(|| {
                BrowserError::ContextDestroyed("page closed while loading".to_string())
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    fn id(&self) -> String {
        self.target_id.clone()
    }

    fn is_closed(&self) -> bool {
        self.cdp.is_closed()
    }

    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.navigate_and_wait(url).await
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; \
             el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()",
            js_str(selector)
        );
        match self.eval(&expr).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(BrowserError::Failed(format!(
                "No element matches selector '{}'",
                selector
            ))),
        }
    }

    async fn query_all(&self, selector: &str, attributes: &[String]) -> BrowserResult<Vec<Map<String, Value>>> {
        let attrs = serde_json::to_string(attributes).unwrap_or_else(|_| "[]".to_string());
        let expr = format!(
            "Array.from(document.querySelectorAll({})).map(el => {{ const out = {{}}; \
             for (const a of {}) {{ out[a] = a === 'innerText' ? el.innerText : el.getAttribute(a); }} \
             return out; }})",
            js_str(selector),
            attrs
        );
        match self.eval(&expr).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn inner_text(&self) -> BrowserResult<String> {
        let v = self
            .eval("document.body ? document.body.innerText : ''")
            .await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn links(&self) -> BrowserResult<Vec<PageLink>> {
        let v = self
            .eval(
                "Array.from(document.querySelectorAll('a[href]')).map(a => \
                 ({ text: (a.innerText || '').trim(), href: a.getAttribute('href'), absolute: a.href }))",
            )
            .await?;
        let field = |item: &Value, key: &str| item.get(key).and_then(|x| x.as_str()).unwrap_or_default().to_string();
        Ok(v.as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| PageLink {
                        text: field(item, "text"),
                        href: field(item, "href"),
                        absolute: field(item, "absolute"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn url(&self) -> BrowserResult<String> {
        let v = self.eval("window.location.href").await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn go_back(&self) -> BrowserResult<bool> {
        let history = self
            .cdp
            .send_command("Page.getNavigationHistory", json!({}))
            .await
            .map_err(classify_cdp_error)?;
        let current = history.get("currentIndex").and_then(|v| v.as_i64()).unwrap_or(0);
        if current <= 0 {
            return Ok(false);
        }
        let entry_id = history
            .get("entries")
            .and_then(|e| e.get((current - 1) as usize))
            .and_then(|e| e.get("id"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| BrowserError::Failed("Navigation history entry missing".to_string()))?;

        let mut loaded = self.cdp.subscribe_event("Page.loadEventFired").await;
        self.cdp
            .send_command("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await
            .map_err(classify_cdp_error)?;
        // Back/forward cache restores fire no load event; don't wait forever for one.
        let _ = tokio::time::timeout(Duration::from_secs(5), loaded.recv()).await;
        Ok(true)
    }

    async fn close(&self) -> BrowserResult<()> {
        self.browser
            .close_target(&self.target_id)
            .await
            .map_err(classify_cdp_error)
    }
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        "--disable-dev-shm-usage".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

pub fn find_browser_binary() -> Option<String> {
    let candidates = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16, String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("Failed to bind to find free port: {}", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local addr: {}", e))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll `/json/version` until the browser-level WebSocket URL appears.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<String, String> {
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(format!(
                "Chrome CDP not ready after {}s on port {}",
                timeout_secs, port
            ));
        }
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Resolve a targetId to its WebSocket debugger URL via `/json/list`.
async fn get_target_ws_url(port: u16, target_id: &str) -> Result<String, String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        let found = targets
            .iter()
            .find(|t| t.get("id").and_then(|v| v.as_str()) == Some(target_id))
            .and_then(|t| t.get("webSocketDebuggerUrl"))
            .and_then(|v| v.as_str());
        if let Some(ws_url) = found {
            return Ok(ws_url.to_string());
        }
    }

    warn!(target = %target_id, "Target never appeared in /json/list");
    Err(format!(
        "No WebSocket URL found for target '{}' after retries",
        target_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cdp_error() {
        assert!(matches!(
            classify_cdp_error("Execution context was destroyed.".to_string()),
            BrowserError::ContextDestroyed(_)
        ));
        assert!(matches!(
            classify_cdp_error("Target closed".to_string()),
            BrowserError::ContextDestroyed(_)
        ));
        assert_eq!(
            classify_cdp_error("Cannot navigate to invalid URL".to_string()),
            BrowserError::Failed("Cannot navigate to invalid URL".to_string())
        );
    }

    #[test]
    fn test_headless_flag() {
        let dir = Path::new("/tmp/profile");
        let args = build_browser_args(9222, dir, true);
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
        assert!(!build_browser_args(9222, dir, false).contains(&"--headless=new".to_string()));
    }

    #[test]
    fn test_js_str_escapes_quotes() {
        assert_eq!(js_str(r#"a[title="x"]"#), r#""a[title=\"x\"]""#);
    }
}
