use serde_json::Value;
use webscout_core::Config;

use super::Toolkit;

fn schema_function(schema: &Value) -> &Value {
    schema.get("function").unwrap_or(schema)
}

/// List every tool the agent would see, browser tools included when the
/// browser starts.
pub async fn list(config: &Config) -> anyhow::Result<()> {
    let toolkit = Toolkit::build(config, true).await?;
    let mut schemas = toolkit.registry.get_tool_schemas();
    schemas.sort_by(|a, b| {
        let name = |s: &Value| schema_function(s)["name"].as_str().unwrap_or("").to_string();
        name(a).cmp(&name(b))
    });

    println!();
    println!("Registered tools ({} total)", schemas.len());
    println!();
    for schema in &schemas {
        let func = schema_function(schema);
        let name = func["name"].as_str().unwrap_or("");
        let desc = func["description"].as_str().unwrap_or("");
        let short_desc: String = desc.chars().take(60).collect();
        let ellipsis = if desc.chars().count() > 60 { "..." } else { "" };
        println!("  {:<22} {}{}", name, short_desc, ellipsis);
    }
    println!();

    toolkit.shutdown().await;
    Ok(())
}

/// Call one tool directly with JSON params and print its output.
pub async fn run(config: &Config, tool_name: &str, params: &str) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params)
        .map_err(|e| anyhow::anyhow!("Invalid JSON params: {}", e))?;

    let needs_browser = !matches!(
        tool_name,
        "fetch" | "crawl" | "select" | "extract_table" | "extract_metadata" | "extract_structured"
    );
    let toolkit = Toolkit::build(config, needs_browser).await?;

    if toolkit.registry.get(tool_name).is_none() {
        toolkit.shutdown().await;
        anyhow::bail!("Tool '{}' not found. Use `webscout tools list` to see available tools.", tool_name);
    }

    let result = toolkit.registry.execute(tool_name, params).await;
    toolkit.shutdown().await;
    println!("{}", result?);
    Ok(())
}
