use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use webscout_core::{Error, Result};

use crate::browser::tool::{
    ClickElementTool, CurrentWebpageTool, ExtractHyperlinksTool, ExtractTextTool,
    GetElementsTool, NavigateBrowserTool, PreviousWebpageTool,
};
use crate::browser::BrowserSessionManager;
use crate::crawl::Crawler;
use crate::fetch::Fetcher;
use crate::web::{
    CrawlTool, ExtractMetadataTool, ExtractStructuredTool, ExtractTableTool, FetchTool, SelectTool,
};
use crate::Tool;

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP-side tools: fetch, crawl and the HTML extractors.
    pub fn with_web_tools(fetcher: Arc<Fetcher>, crawler: Arc<Crawler>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FetchTool::new(fetcher.clone())));
        registry.register(Arc::new(CrawlTool::new(crawler)));
        registry.register(Arc::new(SelectTool));
        registry.register(Arc::new(ExtractTableTool));
        registry.register(Arc::new(ExtractMetadataTool));
        registry.register(Arc::new(ExtractStructuredTool::new(fetcher)));
        registry
    }

    /// Browser tools share one session; only register them once it started.
    pub fn register_browser_tools(&mut self, session: Arc<BrowserSessionManager>) {
        self.register(Arc::new(NavigateBrowserTool::new(session.clone())));
        self.register(Arc::new(ClickElementTool::new(session.clone())));
        self.register(Arc::new(GetElementsTool::new(session.clone())));
        self.register(Arc::new(ExtractTextTool::new(session.clone())));
        self.register(Arc::new(ExtractHyperlinksTool::new(session.clone())));
        self.register(Arc::new(CurrentWebpageTool::new(session.clone())));
        self.register(Arc::new(PreviousWebpageTool::new(session)));
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// OpenAI function-calling schemas, sorted by name.
    pub fn get_tool_schemas(&self) -> Vec<Value> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let schema = tool.schema();
                json!({
                    "type": "function",
                    "function": {
                        "name": schema.name,
                        "description": schema.description,
                        "parameters": schema.parameters
                    }
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, name: &str, params: Value) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {}", name)))?;

        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        debug!(tool = name, "Executing tool");
        tool.execute(params).await
    }

    /// Like [`execute`](Self::execute) but always yields text for the model.
    pub async fn dispatch(&self, name: &str, params: Value) -> String {
        match self.execute(name, params).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                format!("Error: {}", e)
            }
        }
    }
}
