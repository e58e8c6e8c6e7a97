use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webscout_core::{ChatMessage, Error, LLMResponse, Result, ToolCallRequest};

use crate::Provider;

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(
        api_key: &str,
        api_base: &str,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Pull `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` blocks out
    /// of plain content. Some open models answer this way instead of using the
    /// native `tool_calls` field. Returns (remaining_text, parsed_tool_calls).
    fn parse_text_tool_calls(content: &str) -> (String, Vec<ToolCallRequest>) {
        let mut tool_calls = Vec::new();
        let mut remaining = String::new();
        let mut rest = content;

        while let Some(start) = rest.find("<tool_call>") {
            remaining.push_str(&rest[..start]);
            let after_tag = &rest[start + "<tool_call>".len()..];
            let Some(end) = after_tag.find("</tool_call>") else {
                remaining.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let json_str = after_tag[..end].trim();
            match serde_json::from_str::<Value>(json_str) {
                Ok(val) => {
                    let name = val
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let arguments = val
                        .get("arguments")
                        .cloned()
                        .unwrap_or(Value::Object(serde_json::Map::new()));
                    tool_calls.push(ToolCallRequest {
                        id: format!("text_call_{}", tool_calls.len()),
                        name,
                        arguments,
                    });
                }
                Err(_) => {
                    warn!(json = %json_str, "Failed to parse tool_call JSON");
                    remaining.push_str(&rest[start..start + "<tool_call>".len() + end + "</tool_call>".len()]);
                }
            }
            rest = &after_tag[end + "</tool_call>".len()..];
        }
        remaining.push_str(rest);

        (remaining.trim().to_string(), tool_calls)
    }

    fn build_request(&self, messages: &[ChatMessage], tools: &[Value], stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            tool_choice: if tools.is_empty() { None } else { Some("auto".to_string()) },
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        }
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);
        info!(
            url = %url,
            model = %self.model,
            tools_count = request.tools.len(),
            messages_count = request.messages.len(),
            stream = request.stream,
            "Calling LLM"
        );

        let request_body = serde_json::to_string(request)
            .map_err(|e| Error::Provider(format!("Failed to serialize request: {}", e)))?;
        debug!(body_len = request_body.len(), "Request body prepared");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .body(request_body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let raw_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %raw_body, "LLM API error");
            return Err(Error::Provider(format!("API error {}: {}", status, raw_body)));
        }
        Ok(response)
    }

    /// Text-mode fallback when the model answered without native tool calls.
    fn finish(
        content: String,
        reasoning_content: Option<String>,
        native_calls: Vec<ToolCallRequest>,
        finish_reason: Option<String>,
        usage: Option<Value>,
        tools_offered: bool,
    ) -> LLMResponse {
        let (content, tool_calls, finish_reason) = if native_calls.is_empty() && tools_offered {
            let (remaining, parsed) = Self::parse_text_tool_calls(&content);
            if parsed.is_empty() {
                (content, parsed, finish_reason)
            } else {
                info!(count = parsed.len(), "Parsed text-based tool calls");
                (remaining, parsed, Some("tool_calls".to_string()))
            }
        } else {
            (content, native_calls, finish_reason)
        };

        LLMResponse {
            content: if content.is_empty() { None } else { Some(content) },
            reasoning_content,
            tool_calls,
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: usage.unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCallRequest>>,
}

// ---- streaming ----

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Value>,
    /// Groq reports usage here on the final chunk.
    x_groq: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Splits an SSE byte stream into `data:` payloads.
#[derive(Default)]
struct SseLines {
    buf: String,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

/// Folds streamed deltas into one response.
#[derive(Default)]
struct StreamAccumulator {
    content: String,
    reasoning: String,
    calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Value>,
}

impl StreamAccumulator {
    /// Apply one chunk; returns the content fragment it carried, if any.
    fn apply(&mut self, chunk: StreamChunk) -> Option<String> {
        if let Some(usage) = chunk.usage.or_else(|| chunk.x_groq.and_then(|x| x.get("usage").cloned())) {
            self.usage = Some(usage);
        }
        let mut token = None;
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(r) = choice.delta.reasoning_content {
                self.reasoning.push_str(&r);
            }
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.content.push_str(&text);
                token = Some(text);
            }
            for delta in choice.delta.tool_calls {
                let call = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = id;
                }
                if let Some(f) = delta.function {
                    if let Some(name) = f.name {
                        call.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        call.arguments.push_str(&args);
                    }
                }
            }
        }
        token
    }

    fn tool_calls(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.calls)
            .into_values()
            .enumerate()
            .map(|(i, c)| {
                let arguments = if c.arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or_else(|e| {
                        warn!(error = %e, raw = %c.arguments, "Failed to parse streamed tool arguments, using empty object");
                        Value::Object(serde_json::Map::new())
                    })
                };
                ToolCallRequest {
                    id: if c.id.is_empty() { format!("call_{}", i) } else { c.id },
                    name: c.name,
                    arguments,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse> {
        let response = self.post(&self.build_request(messages, tools, false)).await?;
        let raw_body = response
            .text()
            .await
            .map_err(|e| Error::Provider(format!("Failed to read response: {}", e)))?;

        {
            let end = truncate_at_char_boundary(&raw_body, 500);
            debug!(body_len = raw_body.len(), preview = %&raw_body[..end], "LLM raw response");
        }

        let chat_response: ChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 500);
            Error::Provider(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
        })?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;

        Ok(Self::finish(
            choice.message.content.unwrap_or_default(),
            choice.message.reasoning_content,
            choice.message.tool_calls.unwrap_or_default(),
            choice.finish_reason,
            chat_response.usage,
            !tools.is_empty(),
        ))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        tokens: &mpsc::Sender<String>,
    ) -> Result<LLMResponse> {
        let response = self.post(&self.build_request(messages, tools, true)).await?;
        let mut body = response.bytes_stream();
        let mut lines = SseLines::default();
        let mut acc = StreamAccumulator::default();

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| Error::Provider(format!("Stream read failed: {}", e)))?;
            for data in lines.push(&bytes) {
                if data == "[DONE]" {
                    break 'read;
                }
                let chunk: StreamChunk = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, data = %data, "Skipping unparseable stream chunk");
                        continue;
                    }
                };
                if let Some(token) = acc.apply(chunk) {
                    // A dropped receiver only means nobody is listening any more.
                    let _ = tokens.send(token).await;
                }
            }
        }

        let calls = acc.tool_calls();
        let reasoning = (!acc.reasoning.is_empty()).then(|| std::mem::take(&mut acc.reasoning));
        Ok(Self::finish(
            std::mem::take(&mut acc.content),
            reasoning,
            calls,
            acc.finish_reason.take(),
            acc.usage.take(),
            !tools.is_empty(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn provider(base: &str) -> OpenAIProvider {
        OpenAIProvider::new("sk-test", base, "test-model", 256, 0.0, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_xml_tool_call() {
        let content = r#"I'll fetch that.
<tool_call>
{"name": "fetch", "arguments": {"url": "https://example.com"}}
</tool_call>
Done."#;
        let (remaining, calls) = OpenAIProvider::parse_text_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "fetch");
        assert_eq!(calls[0].arguments["url"], "https://example.com");
        assert!(remaining.contains("I'll fetch"));
        assert!(remaining.contains("Done."));
    }

    #[test]
    fn test_no_tool_calls_returns_content() {
        let content = "This is just a normal response with no tool calls.";
        let (remaining, calls) = OpenAIProvider::parse_text_tool_calls(content);
        assert!(calls.is_empty());
        assert_eq!(remaining, content);
    }

    #[test]
    fn test_sse_lines_split_across_chunks() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        assert_eq!(lines.push(b":1}\n\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
        assert!(lines.push(b": keep-alive\r\n").is_empty());
    }

    #[test]
    fn test_accumulator_merges_tool_call_deltas() {
        let mut acc = StreamAccumulator::default();
        let chunks = [
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_a", "function": {"name": "fetch", "arguments": "{\"url\":"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"https://example.com\"}"}}]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}], "x_groq": {"usage": {"total_tokens": 9}}}),
        ];
        for c in chunks {
            assert!(acc.apply(serde_json::from_value(c).unwrap()).is_none());
        }
        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments["url"], "https://example.com");
        assert_eq!(acc.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(acc.usage, Some(json!({"total_tokens": 9})));
    }

    #[tokio::test]
    async fn test_chat_native_tool_calls() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["authorization"], "Bearer sk-test");
                assert_eq!(body["tool_choice"], "auto");
                assert!(body.get("stream").is_none());
                Json(json!({
                    "choices": [{
                        "message": {
                            "content": null,
                            "tool_calls": [{
                                "id": "call_1",
                                "type": "function",
                                "function": {"name": "fetch", "arguments": "{\"url\":\"https://example.com\"}"}
                            }]
                        },
                        "finish_reason": "tool_calls"
                    }],
                    "usage": {"total_tokens": 12}
                }))
            }),
        );
        let base = serve(router).await;
        let tools = vec![json!({"type": "function", "function": {"name": "fetch"}})];

        let resp = provider(&base)
            .chat(&[ChatMessage::user("hi")], &tools)
            .await
            .unwrap();
        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "fetch");
        assert_eq!(resp.finish_reason, "tool_calls");
    }

    #[tokio::test]
    async fn test_chat_api_error_is_provider_error() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = serve(router).await;
        let err = provider(&base).chat(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m.contains("429")));
    }

    #[tokio::test]
    async fn test_chat_stream_forwards_tokens() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], true);
                let frames = [
                    json!({"choices": [{"delta": {"content": "Hel"}}]}),
                    json!({"choices": [{"delta": {"content": "lo"}}]}),
                    json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
                ];
                let mut out = String::new();
                for f in frames {
                    out.push_str(&format!("data: {}\n\n", f));
                }
                out.push_str("data: [DONE]\n\n");
                ([("content-type", "text/event-stream")], out)
            }),
        );
        let base = serve(router).await;
        let (tx, mut rx) = mpsc::channel(16);

        let resp = provider(&base)
            .chat_stream(&[ChatMessage::user("hi")], &[], &tx)
            .await
            .unwrap();
        drop(tx);

        let mut streamed = Vec::new();
        while let Some(t) = rx.recv().await {
            streamed.push(t);
        }
        assert_eq!(streamed, vec!["Hel", "lo"]);
        assert_eq!(resp.content.as_deref(), Some("Hello"));
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.finish_reason, "stop");
    }
}
