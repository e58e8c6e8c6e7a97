use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use webscout_core::{Error, Result};

use crate::crawl::{Crawler, DEFAULT_SELECTOR};
use crate::extract::{self, SelectMode};
use crate::fetch::Fetcher;
use crate::{str_param, truncate_chars, Tool, ToolSchema};

const DEFAULT_CRAWL_PAGES: i64 = 5;
const STRUCTURED_MAX_CHARS: usize = 20_000;

// ============ fetch ============

pub struct FetchTool {
    fetcher: Arc<Fetcher>,
}

impl FetchTool {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fetch",
            description: "Fetch the raw HTML of a page over HTTP. Fast; try this first and fall back to the browser tools for JavaScript-heavy sites. Results are cached for a few minutes.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL to fetch (http or https)"
                    }
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
        Ok(match self.fetcher.fetch(url).await {
            Ok(page) => page.body,
            Err(e) => e.describe(url),
        })
    }
}

// ============ crawl ============

pub struct CrawlTool {
    crawler: Arc<Crawler>,
}

impl CrawlTool {
    pub fn new(crawler: Arc<Crawler>) -> Self {
        Self { crawler }
    }
}

#[async_trait]
impl Tool for CrawlTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "crawl",
            description: "Crawl a site breadth-first starting at a URL, following links on the same domain only, and return the text matched by a CSS selector on each page.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Start URL"
                    },
                    "max_pages": {
                        "type": "integer",
                        "description": "Pages to visit (1-10, default 5)"
                    },
                    "selector": {
                        "type": "string",
                        "description": "CSS selector for the text to keep on each page (default 'body')"
                    }
                },
                "required": ["url"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "url")?;
        if let Some(v) = params.get("max_pages") {
            if !v.is_null() && v.as_i64().is_none() {
                return Err(Error::Validation("max_pages must be an integer".to_string()));
            }
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let url = str_param(&params, "url")?;
        let max_pages = params
            .get("max_pages")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_CRAWL_PAGES)
            .max(0) as usize;
        let selector = params
            .get("selector")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SELECTOR);

        Ok(match self.crawler.crawl(url, max_pages, selector).await {
            Ok(report) => report.render(self.crawler.max_chars()),
            Err(e) => e.to_string(),
        })
    }
}

// ============ select ============

pub struct SelectTool;

#[async_trait]
impl Tool for SelectTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "select",
            description: "Query HTML with a CSS selector. Returns up to 50 matches separated by '---'.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "html": { "type": "string", "description": "HTML to parse" },
                    "selector": { "type": "string", "description": "CSS selector" },
                    "mode": {
                        "type": "string",
                        "enum": ["text", "html", "attrs"],
                        "description": "What to return for each match (default 'text')"
                    }
                },
                "required": ["html", "selector"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "html")?;
        str_param(params, "selector")?;
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let html = str_param(&params, "html")?;
        let selector = str_param(&params, "selector")?;
        let mode = SelectMode::parse(params.get("mode").and_then(|v| v.as_str()).unwrap_or("text"));
        Ok(extract::select(html, selector, mode).unwrap_or_else(|msg| msg))
    }
}

// ============ extract_table ============

pub struct ExtractTableTool;

#[async_trait]
impl Tool for ExtractTableTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "extract_table",
            description: "Extract one HTML table as a markdown table.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "html": { "type": "string", "description": "HTML containing the table" },
                    "table_index": { "type": "integer", "description": "0-based table index (default 0)" }
                },
                "required": ["html"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "html").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let html = str_param(&params, "html")?;
        let index = params.get("table_index").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(extract::extract_table(html, index))
    }
}

// ============ extract_metadata ============

pub struct ExtractMetadataTool;

#[async_trait]
impl Tool for ExtractMetadataTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "extract_metadata",
            description: "Extract page metadata (title, description, canonical URL, Open Graph tags, link/image/table counts) as JSON.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "html": { "type": "string", "description": "Page HTML" }
                },
                "required": ["html"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "html").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<String> {
        Ok(extract::extract_metadata(str_param(&params, "html")?))
    }
}

// ============ extract_structured ============

pub struct ExtractStructuredTool {
    fetcher: Arc<Fetcher>,
}

impl ExtractStructuredTool {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for ExtractStructuredTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "extract_structured",
            description: "Fetch a page and return its structured data (JSON-LD and microdata) as JSON, optionally keeping only the named fields.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Page URL" },
                    "fields": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Property names to keep, e.g. [\"name\", \"price\"]"
                    }
                },
                "required": ["url"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        str_param(params, "url")?;
        match params.get("fields") {
            None | Some(Value::Null) | Some(Value::Array(_)) => Ok(()),
            Some(_) => Err(Error::Validation("fields must be an array of strings".to_string())),
        }
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let url = str_param(&params, "url")?;
        let fields: Option<Vec<String>> = params.get("fields").and_then(|v| v.as_array()).map(|a| {
            a.iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect()
        });

        let page = match self.fetcher.fetch_full(url).await {
            Ok(page) => page,
            Err(e) => return Ok(e.describe(url)),
        };

        let data = extract::extract_structured(&page.body, fields.as_deref());
        let empty = |key: &str| data[key].as_array().map_or(true, |a| a.is_empty());
        if empty("json_ld") && empty("microdata") {
            return Ok(format!("No structured data (JSON-LD or microdata) found on {}.", url));
        }

        let out = serde_json::to_string_pretty(&data)?;
        Ok(match truncate_chars(&out, STRUCTURED_MAX_CHARS) {
            Some(head) => format!(
                "{}\n\n[Truncated: showing first {} characters]",
                head, STRUCTURED_MAX_CHARS
            ),
            None => out,
        })
    }
}
