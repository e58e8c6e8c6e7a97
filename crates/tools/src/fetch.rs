use rand::seq::SliceRandom;
use reqwest::{redirect, Client, ClientBuilder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::FetchCache;
use crate::truncate_chars;
use crate::url_guard::{redirect_allowed, BlockReason, UrlGuard};

/// Realistic desktop browser strings. One is picked per request.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.67",
];

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const MAX_REDIRECTS: usize = 10;

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// The URL as requested, which is also the cache key.
    pub url: String,
    pub body: String,
    pub from_cache: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Blocked(BlockReason),
    HttpStatus { code: u16, reason: String },
    Network(String),
    Timeout,
}

impl FetchError {
    /// Short classification label: `blocked`, `http_status:<code>`, `network_error`, `timeout`.
    pub fn kind(&self) -> String {
        match self {
            FetchError::Blocked(_) => "blocked".to_string(),
            FetchError::HttpStatus { code, .. } => format!("http_status:{}", code),
            FetchError::Network(_) => "network_error".to_string(),
            FetchError::Timeout => "timeout".to_string(),
        }
    }

    /// Caller-facing sentence naming the URL.
    pub fn describe(&self, url: &str) -> String {
        match self {
            FetchError::Blocked(reason) => reason.to_string(),
            FetchError::HttpStatus { code, reason } => {
                format!("HTTP error {} fetching {}: {}", code, url, reason)
            }
            FetchError::Network(msg) => format!("Request error fetching {}: {}", url, msg),
            FetchError::Timeout => format!("Request timed out fetching {}", url),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Blocked(reason) => write!(f, "{}", reason),
            FetchError::HttpStatus { code, reason } => write!(f, "HTTP error {}: {}", code, reason),
            FetchError::Network(msg) => write!(f, "network error: {}", msg),
            FetchError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// Client settings shared by every fetcher: overall timeout and a redirect
/// policy that re-screens each hop.
pub fn client_builder(timeout: Duration) -> ClientBuilder {
    let policy = redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !redirect_allowed(attempt.url()) {
            let target = attempt.url().to_string();
            warn!(target = %target, "Refusing redirect to internal or non-http target");
            attempt.error(format!("redirect to {} is not allowed", target))
        } else {
            attempt.follow()
        }
    });
    Client::builder().redirect(policy).timeout(timeout)
}

/// Guarded, cached single-GET fetcher.
pub struct Fetcher {
    client: Client,
    guard: UrlGuard,
    cache: Arc<FetchCache>,
    max_chars: usize,
}

impl Fetcher {
    pub fn new(guard: UrlGuard, cache: Arc<FetchCache>, timeout: Duration, max_chars: usize) -> reqwest::Result<Self> {
        let client = client_builder(timeout).build()?;
        Ok(Self::with_client(client, guard, cache, max_chars))
    }

    pub fn with_client(client: Client, guard: UrlGuard, cache: Arc<FetchCache>, max_chars: usize) -> Self {
        Self {
            client,
            guard,
            cache,
            max_chars,
        }
    }

    pub fn guard(&self) -> &UrlGuard {
        &self.guard
    }

    pub fn cache(&self) -> &Arc<FetchCache> {
        &self.cache
    }

    /// Fetch `url`, truncating the body to the configured character budget.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut page = self.fetch_full(url).await?;
        if let Some(head) = truncate_chars(&page.body, self.max_chars) {
            page.body = format!(
                "{}\n\n[Truncated: showing first {} characters]",
                head, self.max_chars
            );
            page.truncated = true;
        }
        Ok(page)
    }

    /// Same pipeline as [`fetch`](Self::fetch) without truncation.
    pub async fn fetch_full(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let target = self.guard.check(url).await.map_err(FetchError::Blocked)?;

        if let Some(body) = self.cache.get(url).await {
            debug!(url = %url, "Serving page from cache");
            return Ok(FetchedPage {
                url: url.to_string(),
                body,
                from_cache: true,
                truncated: false,
            });
        }

        let response = self
            .client
            .get(target)
            .header("User-Agent", random_user_agent())
            .header("Accept", ACCEPT)
            .header("Accept-Language", ACCEPT_LANGUAGE)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Fetch failed");
                FetchError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "Fetch returned error status");
            return Err(FetchError::HttpStatus {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        let body = response.text().await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to read response body");
            FetchError::from(e)
        })?;

        info!(url = %url, status = status.as_u16(), bytes = body.len(), "Fetched page");
        self.cache.set(url, body.clone()).await;

        Ok(FetchedPage {
            url: url.to_string(),
            body,
            from_cache: false,
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[tokio::test]
    async fn test_second_fetch_is_served_from_cache() {
        let fixture = Fixture::start(&[("/a", "<p>hello</p>")]).await;
        let fetcher = fixture.fetcher(20_000);

        let first = fetcher.fetch(&fixture.url("/a")).await.unwrap();
        let second = fetcher.fetch(&fixture.url("/a")).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.body, "<p>hello</p>");
        assert_eq!(fixture.hits(), 1);
    }

    #[tokio::test]
    async fn test_clear_forces_one_new_network_call() {
        let fixture = Fixture::start(&[("/a", "x")]).await;
        let fetcher = fixture.fetcher(20_000);

        fetcher.fetch(&fixture.url("/a")).await.unwrap();
        fetcher.cache().clear().await;
        fetcher.fetch(&fixture.url("/a")).await.unwrap();
        fetcher.fetch(&fixture.url("/a")).await.unwrap();

        assert_eq!(fixture.hits(), 2);
    }

    #[tokio::test]
    async fn test_blocked_url_makes_no_network_call() {
        let fixture = Fixture::start(&[("/a", "x")]).await;
        let fetcher = fixture.fetcher(20_000);

        let err = fetcher.fetch("http://127.0.0.1/a").await.unwrap_err();
        assert_eq!(err.kind(), "blocked");
        let err = fetcher.fetch("gopher://fixture.test/").await.unwrap_err();
        assert!(err.describe("gopher://fixture.test/").contains("scheme 'gopher'"));
        assert_eq!(fixture.hits(), 0);
    }

    #[tokio::test]
    async fn test_http_status_is_classified_and_not_cached() {
        let fixture = Fixture::start(&[]).await;
        let fetcher = fixture.fetcher(20_000);

        let err = fetcher.fetch(&fixture.url("/missing")).await.unwrap_err();
        assert_eq!(err, FetchError::HttpStatus { code: 404, reason: "Not Found".into() });
        assert_eq!(err.kind(), "http_status:404");
        assert!(fetcher.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_truncation_marker() {
        let body = "a".repeat(50);
        let fixture = Fixture::start(&[("/long", body.as_str())]).await;
        let fetcher = fixture.fetcher(10);

        let page = fetcher.fetch(&fixture.url("/long")).await.unwrap();
        assert!(page.truncated);
        assert!(page.body.starts_with("aaaaaaaaaa\n\n[Truncated: showing first 10 characters]"));

        let full = fetcher.fetch_full(&fixture.url("/long")).await.unwrap();
        assert_eq!(full.body.len(), 50);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let fixture = Fixture::start(&[("/slow", "late")]).await;
        let fetcher = fixture.fetcher_with_timeout(Duration::from_millis(200), 20_000);

        let err = fetcher.fetch(&fixture.url("/slow")).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
    }

    #[test]
    fn test_user_agent_comes_from_pool() {
        assert!(USER_AGENTS.contains(&random_user_agent()));
    }
}
