//! Backend-neutral browser interface.
//!
//! The session manager only talks to these traits. The shipped backend is
//! [`super::chrome::ChromeDriver`]; tests use in-memory fakes.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    /// The operation did not finish within its budget.
    Timeout(Duration),
    /// The page's JavaScript context went away mid-operation. Recover with a reset.
    ContextDestroyed(String),
    /// No running browser to talk to.
    Unavailable(String),
    /// Any other browser-side failure.
    Failed(String),
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserError::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            BrowserError::ContextDestroyed(msg) => write!(f, "browser context destroyed: {}", msg),
            BrowserError::Unavailable(msg) => write!(f, "browser unavailable: {}", msg),
            BrowserError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BrowserError {}

pub type BrowserResult<T> = std::result::Result<T, BrowserError>;

/// One anchor on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    pub text: String,
    /// `href` exactly as written in the markup.
    pub href: String,
    /// `href` resolved against the page URL.
    pub absolute: String,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, headless: bool) -> BrowserResult<Box<dyn BrowserHandle>>;
}

#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Fresh isolated context (cookies, storage) whose pages use `user_agent`.
    async fn new_context(&self, user_agent: &str) -> BrowserResult<Box<dyn ContextHandle>>;
    fn is_connected(&self) -> bool;
    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait]
pub trait ContextHandle: Send + Sync {
    async fn new_page(&self) -> BrowserResult<Box<dyn PageHandle>>;
    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Stable identifier, distinct for every page the backend creates.
    fn id(&self) -> String;
    fn is_closed(&self) -> bool;
    /// Navigate and wait for the load event.
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    async fn click(&self, selector: &str) -> BrowserResult<()>;
    /// For each match, the requested attributes. `innerText` is the rendered text.
    async fn query_all(&self, selector: &str, attributes: &[String]) -> BrowserResult<Vec<Map<String, Value>>>;
    async fn inner_text(&self) -> BrowserResult<String>;
    async fn links(&self) -> BrowserResult<Vec<PageLink>>;
    async fn url(&self) -> BrowserResult<String>;
    /// Go one entry back. `Ok(false)` when there is no previous entry.
    async fn go_back(&self) -> BrowserResult<bool>;
    async fn close(&self) -> BrowserResult<()>;
}
