//! Synchronous HTML extraction helpers.
//!
//! All of these parse the document locally and return caller-facing text.
//! None of them are async, which keeps the non-`Send` parsed tree out of
//! any future.

use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::truncate_chars;

pub const MAX_ELEMENTS: usize = 50;
pub const MAX_CHARS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Text,
    Html,
    Attrs,
}

impl SelectMode {
    /// Unknown values fall back to text.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "html" => SelectMode::Html,
            "attrs" => SelectMode::Attrs,
            _ => SelectMode::Text,
        }
    }
}

fn parse_selector(s: &str) -> Result<Selector, String> {
    Selector::parse(s).map_err(|_| format!("Invalid CSS selector '{}'.", s))
}

fn limit(output: String, max_chars: usize) -> String {
    match truncate_chars(&output, max_chars) {
        Some(head) => format!("{}\n\n[Truncated: showing first {} characters]", head, max_chars),
        None => output,
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `selector` over `html`, rendering at most [`MAX_ELEMENTS`] matches.
pub fn select(html: &str, selector: &str, mode: SelectMode) -> Result<String, String> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);

    let parts: Vec<String> = doc
        .select(&sel)
        .take(MAX_ELEMENTS)
        .map(|el| match mode {
            SelectMode::Html => el.html(),
            SelectMode::Attrs => {
                let attrs: BTreeMap<&str, &str> = el.value().attrs().collect();
                serde_json::to_string(&attrs).unwrap_or_default()
            }
            SelectMode::Text => element_text(&el),
        })
        .collect();

    if parts.is_empty() {
        return Ok(format!("No elements found matching selector '{}'.", selector));
    }
    Ok(limit(parts.join("\n---\n"), MAX_CHARS))
}

/// Render the `index`-th table (0-based) as a markdown table.
pub fn extract_table(html: &str, index: i64) -> String {
    let doc = Html::parse_document(html);
    let (Ok(table_sel), Ok(row_sel), Ok(cell_sel)) = (
        Selector::parse("table"),
        Selector::parse("tr"),
        Selector::parse("th, td"),
    ) else {
        return "No tables found in the HTML.".to_string();
    };

    let tables: Vec<ElementRef<'_>> = doc.select(&table_sel).collect();
    if tables.is_empty() {
        return "No tables found in the HTML.".to_string();
    }
    if index < 0 || index as usize >= tables.len() {
        return format!(
            "table_index {} is out of range. Found {} table(s) (indices 0-{}).",
            index,
            tables.len(),
            tables.len() - 1
        );
    }

    let rows: Vec<ElementRef<'_>> = tables[index as usize].select(&row_sel).collect();
    if rows.is_empty() {
        return "Table has no rows.".to_string();
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    for (i, row) in rows.iter().enumerate() {
        let values: Vec<String> = row
            .select(&cell_sel)
            .map(|c| element_text(&c).replace('|', "\\|"))
            .collect();
        lines.push(format!("| {} |", values.join(" | ")));
        if i == 0 {
            let sep = vec!["---"; values.len()];
            lines.push(format!("| {} |", sep.join(" | ")));
        }
    }
    limit(lines.join("\n"), MAX_CHARS)
}

/// Title, description, canonical URL, Open Graph tags and element counts as JSON.
pub fn extract_metadata(html: &str) -> String {
    let doc = Html::parse_document(html);

    let title = first(&doc, "title").map(|t| element_text(&t));
    let description = first(&doc, r#"meta[name="description"]"#)
        .and_then(|m| m.value().attr("content").map(str::to_string));
    let canonical = first(&doc, r#"link[rel="canonical"]"#)
        .and_then(|l| l.value().attr("href").map(str::to_string));

    let mut og = Map::new();
    if let Ok(sel) = Selector::parse("meta[property]") {
        for tag in doc.select(&sel) {
            let prop = tag.value().attr("property").unwrap_or_default();
            if prop.starts_with("og:") {
                let content = tag.value().attr("content").unwrap_or_default();
                og.insert(prop.to_string(), Value::String(content.to_string()));
            }
        }
    }

    let metadata = json!({
        "title": title,
        "description": description,
        "canonical_url": canonical,
        "og": if og.is_empty() { Value::Null } else { Value::Object(og) },
        "counts": {
            "links": count(&doc, "a"),
            "images": count(&doc, "img"),
            "tables": count(&doc, "table"),
        }
    });
    serde_json::to_string_pretty(&metadata).unwrap_or_default()
}

fn first<'a>(doc: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    Selector::parse(css).ok().and_then(|s| doc.select(&s).next())
}

fn count(doc: &Html, css: &str) -> usize {
    Selector::parse(css).map(|s| doc.select(&s).count()).unwrap_or(0)
}

/// JSON-LD blocks and microdata items, optionally narrowed to `fields`.
pub fn extract_structured(html: &str, fields: Option<&[String]>) -> Value {
    let doc = Html::parse_document(html);

    let mut json_ld = Vec::new();
    if let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) {
        for script in doc.select(&sel) {
            let raw: String = script.text().collect();
            match serde_json::from_str::<Value>(raw.trim()) {
                Ok(Value::Array(items)) => json_ld.extend(items),
                Ok(Value::Object(mut obj)) => match obj.remove("@graph") {
                    Some(Value::Array(graph)) => json_ld.extend(graph),
                    Some(other) => {
                        obj.insert("@graph".to_string(), other);
                        json_ld.push(Value::Object(obj));
                    }
                    None => json_ld.push(Value::Object(obj)),
                },
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Skipping malformed JSON-LD block"),
            }
        }
    }

    let mut microdata = Vec::new();
    if let Ok(scope_sel) = Selector::parse("[itemscope]") {
        for scope in doc.select(&scope_sel) {
            // Nested scopes are reported through their parent.
            let nested = scope
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|a| a.value().attr("itemscope").is_some());
            if !nested {
                microdata.push(microdata_item(scope));
            }
        }
    }

    if let Some(fields) = fields.filter(|f| !f.is_empty()) {
        json_ld = json_ld.into_iter().map(|v| pick_fields(v, fields)).collect();
        microdata = microdata.into_iter().map(|v| pick_fields(v, fields)).collect();
    }

    json!({ "json_ld": json_ld, "microdata": microdata })
}

fn microdata_item(scope: ElementRef<'_>) -> Value {
    let mut item = Map::new();
    if let Some(t) = scope.value().attr("itemtype") {
        item.insert("@type".to_string(), Value::String(t.to_string()));
    }
    collect_props(scope, &mut item);
    Value::Object(item)
}

fn collect_props(parent: ElementRef<'_>, item: &mut Map<String, Value>) {
    for child in parent.children().filter_map(ElementRef::wrap) {
        let el = child.value();
        let is_scope = el.attr("itemscope").is_some();
        if let Some(prop) = el.attr("itemprop") {
            let value = if is_scope {
                microdata_item(child)
            } else {
                Value::String(microdata_value(&child))
            };
            match item.get_mut(prop) {
                Some(Value::Array(existing)) => existing.push(value),
                Some(existing) => {
                    let prev = existing.take();
                    *existing = Value::Array(vec![prev, value]);
                }
                None => {
                    item.insert(prop.to_string(), value);
                }
            }
        }
        if !is_scope {
            collect_props(child, item);
        }
    }
}

fn microdata_value(el: &ElementRef<'_>) -> String {
    let v = el.value();
    let attr = match v.name() {
        "meta" => v.attr("content"),
        "a" | "link" | "area" => v.attr("href"),
        "img" | "audio" | "video" | "source" | "iframe" | "embed" => v.attr("src"),
        "time" => v.attr("datetime"),
        "data" | "meter" => v.attr("value"),
        _ => None,
    };
    attr.map(str::to_string).unwrap_or_else(|| element_text(el))
}

fn pick_fields(value: Value, fields: &[String]) -> Value {
    match value {
        Value::Object(obj) => Value::Object(
            obj.into_iter()
                .filter(|(k, _)| k == "@type" || fields.iter().any(|f| f == k))
                .collect(),
        ),
        other => other,
    }
}
