use serde::{Deserialize, Serialize};
use tracing::warn;

/// A tool call request that serializes to the OpenAI-compatible format:
/// `{id, type: "function", function: {name, arguments}}`
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &serde_json::json!({
            "name": self.name,
            "arguments": self.arguments.to_string()
        }))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value.as_object().ok_or_else(|| serde::de::Error::custom("expected object"))?;

        let id = obj.get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if let Some(func) = obj.get("function").and_then(|v| v.as_object()) {
            let name = func.get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = match func.get("arguments") {
                Some(serde_json::Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or_else(|e| {
                        warn!(error = %e, raw = %s, "Failed to parse tool call arguments as JSON, using empty object");
                        serde_json::Value::Object(serde_json::Map::new())
                    })
                }
                Some(v) => v.clone(),
                None => serde_json::Value::Object(serde_json::Map::new()),
            };
            return Ok(ToolCallRequest { id, name, arguments });
        }

        // Flat {id, name, arguments}, as produced by some OpenAI-compatible servers.
        let name = obj.get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = obj.get("arguments")
            .cloned()
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        Ok(ToolCallRequest { id, name, arguments })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: serde_json::Value,
}

impl Default for LLMResponse {
    fn default() -> Self {
        Self {
            content: None,
            reasoning_content: None,
            tool_calls: Vec::new(),
            finish_reason: String::new(),
            usage: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: serde_json::Value::String(content.to_string()),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::text("user", content)
    }

    /// Assistant turn that requested tools; content may be empty.
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::text("assistant", content);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    pub fn tool_result(tool_call_id: &str, name: &str, content: &str) -> Self {
        let mut msg = Self::text("tool", content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg.name = Some(name.to_string());
        msg
    }

    pub fn content_text(&self) -> &str {
        self.content.as_str().unwrap_or_default()
    }
}

/// One step of a running mission, in the order the relay must forward it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    ToolStart(String),
    ToolEnd(String),
    Done,
    Error(String),
}

impl StreamEvent {
    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Token(_) => "token",
            StreamEvent::ToolStart(_) => "tool_start",
            StreamEvent::ToolEnd(_) => "tool_end",
            StreamEvent::Done => "done",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            StreamEvent::Token(s)
            | StreamEvent::ToolStart(s)
            | StreamEvent::ToolEnd(s)
            | StreamEvent::Error(s) => s,
            StreamEvent::Done => "",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

/// Wire payload of one server-sent frame: `{"type": ..., "content": ...}`.
impl Serialize for StreamEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.kind())?;
        map.serialize_entry("content", self.content())?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_serializes_openai_shape() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "fetch".to_string(),
            arguments: serde_json::json!({"url": "https://example.com"}),
        };
        let v = serde_json::to_value(&call).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "fetch");
        assert_eq!(v["function"]["arguments"], r#"{"url":"https://example.com"}"#);
    }

    #[test]
    fn test_tool_call_bad_arguments_become_empty_object() {
        let raw = serde_json::json!({
            "id": "c", "type": "function",
            "function": {"name": "crawl", "arguments": "{not json"}
        });
        let call: ToolCallRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(call.name, "crawl");
        assert!(call.arguments.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_stream_event_wire_shape() {
        assert_eq!(
            serde_json::to_string(&StreamEvent::ToolStart("fetch".into())).unwrap(),
            r#"{"type":"tool_start","content":"fetch"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::Done).unwrap(),
            r#"{"type":"done","content":""}"#
        );
        assert!(StreamEvent::Error("x".into()).is_terminal());
        assert!(!StreamEvent::Token("x".into()).is_terminal());
    }
}
