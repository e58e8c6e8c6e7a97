use scraper::{Html, Selector};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::fetch::{FetchError, Fetcher};
use crate::truncate_chars;

pub const MAX_PAGES_LIMIT: usize = 10;
pub const DEFAULT_SELECTOR: &str = "body";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlError {
    InvalidStartUrl(String),
    InvalidSelector(String),
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::InvalidStartUrl(url) => write!(f, "Invalid start URL '{}'.", url),
            CrawlError::InvalidSelector(sel) => write!(f, "Invalid CSS selector '{}'.", sel),
        }
    }
}

impl std::error::Error for CrawlError {}

#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub url: String,
    pub result: Result<String, FetchError>,
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub start_url: String,
    pub pages: Vec<PageOutcome>,
}

impl CrawlReport {
    /// Human-readable report, cut to `max_chars` with a marker.
    pub fn render(&self, max_chars: usize) -> String {
        let mut out = format!(
            "Crawled {} page(s) starting at {}\n",
            self.pages.len(),
            self.start_url
        );
        for (i, page) in self.pages.iter().enumerate() {
            out.push_str(&format!("\n## [{}] {}\n", i + 1, page.url));
            match &page.result {
                Ok(text) => out.push_str(text),
                Err(e) => out.push_str(&format!("Error: {}", e.describe(&page.url))),
            }
            out.push('\n');
        }
        match truncate_chars(&out, max_chars) {
            Some(head) => format!("{}\n\n[Truncated: showing first {} characters]", head, max_chars),
            None => out,
        }
    }
}

/// Breadth-first, same-domain, page-bounded traversal over a [`Fetcher`].
pub struct Crawler {
    fetcher: Arc<Fetcher>,
    page_chars: usize,
    max_chars: usize,
}

impl Crawler {
    pub fn new(fetcher: Arc<Fetcher>, page_chars: usize, max_chars: usize) -> Self {
        Self {
            fetcher,
            page_chars,
            max_chars,
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub async fn crawl(&self, start_url: &str, max_pages: usize, selector: &str) -> Result<CrawlReport, CrawlError> {
        let start = Url::parse(start_url.trim())
            .ok()
            .filter(|u| u.host_str().is_some())
            .ok_or_else(|| CrawlError::InvalidStartUrl(start_url.to_string()))?;
        if Selector::parse(selector).is_err() {
            return Err(CrawlError::InvalidSelector(selector.to_string()));
        }

        let max_pages = max_pages.clamp(1, MAX_PAGES_LIMIT);
        let mut visited: HashSet<String> = HashSet::new();
        // The start URL is fetched as given; normalized forms only decide
        // whether a page was already visited.
        let mut queue: VecDeque<String> = VecDeque::from([start.to_string()]);
        let mut pages = Vec::new();

        while visited.len() < max_pages {
            let Some(next) = queue.pop_front() else {
                break;
            };
            let key = match Url::parse(&next) {
                Ok(u) => normalize_url(&u),
                Err(_) => continue,
            };
            if !visited.insert(key) {
                continue;
            }

            match self.fetcher.fetch_full(&next).await {
                Err(e) => {
                    debug!(url = %next, error = %e, "Crawl fetch failed");
                    pages.push(PageOutcome { url: next, result: Err(e) });
                }
                Ok(page) => {
                    let (text, links) = parse_page(&page.body, selector, &next);
                    for link in links {
                        if same_site(&start, &link) {
                            let target = normalize_url(&link);
                            if !visited.contains(&target) && !queue.contains(&target) {
                                queue.push_back(target);
                            }
                        }
                    }
                    let text = match truncate_chars(&text, self.page_chars) {
                        Some(head) => format!("{}...", head),
                        None if text.is_empty() => {
                            format!("(no text matched selector '{}')", selector)
                        }
                        None => text,
                    };
                    pages.push(PageOutcome { url: next, result: Ok(text) });
                }
            }
        }

        info!(start = %start, pages = pages.len(), "Crawl finished");
        Ok(CrawlReport {
            start_url: start.to_string(),
            pages,
        })
    }
}

/// Drop query and fragment.
pub fn normalize_url(url: &Url) -> String {
    let mut u = url.clone();
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

fn same_site(start: &Url, candidate: &Url) -> bool {
    matches!(candidate.scheme(), "http" | "https")
        && candidate.host_str() == start.host_str()
        && candidate.port_or_known_default() == start.port_or_known_default()
}

/// Selector text and absolute links of one page. Kept synchronous: the parsed
/// document never lives across an await.
fn parse_page(html: &str, selector: &str, base: &str) -> (String, Vec<Url>) {
    let doc = Html::parse_document(html);
    let base = Url::parse(base).ok();

    let text = match Selector::parse(selector) {
        Ok(sel) => doc
            .select(&sel)
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Err(_) => String::new(),
    };

    let mut links = Vec::new();
    if let (Some(base), Ok(anchor)) = (base, Selector::parse("a[href]")) {
        for el in doc.select(&anchor) {
            if let Some(href) = el.value().attr("href") {
                if let Ok(abs) = base.join(href.trim()) {
                    links.push(abs);
                }
            }
        }
    }
    (text, links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    fn crawler(fixture: &Fixture) -> Crawler {
        Crawler::new(Arc::new(fixture.fetcher(20_000)), 3_000, 30_000)
    }

    #[tokio::test]
    async fn test_internal_links_followed_external_ignored() {
        let fixture = Fixture::start(&[
            (
                "/",
                r#"<body><h1>Home</h1><a href="/a">A</a><a href="b">B</a><a href="http://elsewhere.test/x">X</a></body>"#,
            ),
            ("/a", "<body>page a</body>"),
            ("/b", "<body>page b</body>"),
            ("/x", "<body>external</body>"),
        ])
        .await;

        let report = crawler(&fixture).crawl(&fixture.url("/"), 3, "body").await.unwrap();

        assert_eq!(report.pages.len(), 3);
        assert_eq!(fixture.requested(), vec!["/", "/a", "/b"]);
        assert!(report.pages.iter().all(|p| p.url.starts_with("http://fixture.test")));
        assert_eq!(report.pages[1].result.as_deref().unwrap(), "page a");
    }

    #[tokio::test]
    async fn test_page_count_is_clamped() {
        let pages: Vec<(String, String)> = (0..15)
            .map(|i| {
                let path = if i == 0 { "/".to_string() } else { format!("/p{}", i) };
                (path, format!(r#"<body>n{}<a href="/p{}">next</a></body>"#, i, i + 1))
            })
            .collect();
        let refs: Vec<(&str, &str)> = pages.iter().map(|(p, b)| (p.as_str(), b.as_str())).collect();
        let fixture = Fixture::start(&refs).await;
        let c = crawler(&fixture);

        let report = c.crawl(&fixture.url("/"), 50, "body").await.unwrap();
        assert_eq!(report.pages.len(), MAX_PAGES_LIMIT);

        let report = c.crawl(&fixture.url("/"), 0, "body").await.unwrap();
        assert_eq!(report.pages.len(), 1);
    }

    #[tokio::test]
    async fn test_query_and_fragment_variants_visited_once() {
        let fixture = Fixture::start(&[
            ("/", r#"<body><a href="/a?x=1">1</a><a href="/a#top">2</a><a href="/a">3</a></body>"#),
            ("/a", "<body>a</body>"),
        ])
        .await;

        let report = crawler(&fixture).crawl(&fixture.url("/"), 10, "body").await.unwrap();
        assert_eq!(report.pages.len(), 2);
        assert_eq!(fixture.hits(), 2);
    }

    #[tokio::test]
    async fn test_start_url_keeps_its_query() {
        let fixture = Fixture::start(&[("/list", r#"<body>listing<a href="/list?page=3">next</a></body>"#)]).await;

        let start = fixture.url("/list?page=2");
        let report = crawler(&fixture).crawl(&start, 5, "body").await.unwrap();

        assert_eq!(report.pages.len(), 1);
        assert_eq!(report.pages[0].url, start);
        assert_eq!(fixture.requested_uris(), vec!["/list?page=2"]);
    }

    #[tokio::test]
    async fn test_failed_page_is_recorded_and_crawl_continues() {
        let fixture = Fixture::start(&[
            ("/", r#"<body><a href="/gone">g</a><a href="/ok">o</a></body>"#),
            ("/ok", "<body>fine</body>"),
        ])
        .await;

        let report = crawler(&fixture).crawl(&fixture.url("/"), 5, "body").await.unwrap();
        assert_eq!(report.pages.len(), 3);
        assert!(matches!(
            report.pages[1].result,
            Err(FetchError::HttpStatus { code: 404, .. })
        ));
        assert!(report.pages[2].result.is_ok());
        assert!(report.render(30_000).contains("HTTP error 404"));
    }

    #[tokio::test]
    async fn test_selector_limits_text() {
        let fixture = Fixture::start(&[(
            "/",
            "<body><nav>menu</nav><main><p>Body   text</p></main></body>",
        )])
        .await;
        let report = crawler(&fixture).crawl(&fixture.url("/"), 1, "main p").await.unwrap();
        assert_eq!(report.pages[0].result.as_deref().unwrap(), "Body text");
    }

    #[tokio::test]
    async fn test_bad_inputs_are_errors_not_faults() {
        let fixture = Fixture::start(&[]).await;
        let c = crawler(&fixture);
        assert!(matches!(
            c.crawl("not a url", 3, "body").await,
            Err(CrawlError::InvalidStartUrl(_))
        ));
        assert!(matches!(
            c.crawl(&fixture.url("/"), 3, "div[").await,
            Err(CrawlError::InvalidSelector(_))
        ));
        assert_eq!(fixture.hits(), 0);
    }

    #[test]
    fn test_render_truncates_whole_report() {
        let report = CrawlReport {
            start_url: "https://e.com/".into(),
            pages: vec![PageOutcome {
                url: "https://e.com/".into(),
                result: Ok("x".repeat(100)),
            }],
        };
        let out = report.render(40);
        assert!(out.ends_with("[Truncated: showing first 40 characters]"));
    }
}
