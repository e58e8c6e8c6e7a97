use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use webscout_core::config::AgentDefaults;
use webscout_core::{ChatMessage, Error, LLMResponse, Result, StreamEvent};
use webscout_providers::Provider;
use webscout_tools::ToolRegistry;

use crate::prompt::system_prompt;
use crate::stream::{EventSender, MissionStream};

/// Anything that turns a prompt into a stream of mission events.
pub trait MissionRunner: Send + Sync {
    fn start(&self, prompt: String) -> MissionStream;
}

#[derive(Debug, Clone)]
pub struct MissionSettings {
    /// LLM calls allowed per mission.
    pub max_steps: u32,
    pub llm_max_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub llm_retry_delay: Duration,
}

impl From<&AgentDefaults> for MissionSettings {
    fn from(defaults: &AgentDefaults) -> Self {
        Self {
            max_steps: defaults.max_steps,
            llm_max_retries: defaults.llm_max_retries,
            llm_retry_delay: Duration::from_millis(defaults.llm_retry_delay_ms),
        }
    }
}

/// Tool-calling loop over a chat provider.
#[derive(Clone)]
pub struct MissionAgent {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    settings: MissionSettings,
    system_prompt: Arc<str>,
}

impl MissionAgent {
    pub fn new(provider: Arc<dyn Provider>, tools: ToolRegistry, settings: MissionSettings) -> Self {
        let browser = tools.get("navigate_browser").is_some();
        let names = tools.tool_names();
        info!(tool_count = names.len(), tools = %names.join(", "), "Building mission agent");
        Self {
            provider,
            tools: Arc::new(tools),
            settings,
            system_prompt: system_prompt(browser).into(),
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    async fn run(&self, prompt: &str, events: &EventSender) -> Result<()> {
        let mut messages = vec![ChatMessage::system(&self.system_prompt), ChatMessage::user(prompt)];
        let schemas = self.tools.get_tool_schemas();

        for step in 1..=self.settings.max_steps {
            debug!(step, "LLM call");
            let response = self.call_llm(&messages, &schemas, events).await?;
            info!(
                step,
                content_len = response.content.as_ref().map_or(0, |c| c.len()),
                tool_calls_count = response.tool_calls.len(),
                finish_reason = %response.finish_reason,
                "LLM response received"
            );

            if response.tool_calls.is_empty() {
                return Ok(());
            }

            messages.push(ChatMessage::assistant_with_tools(
                response.content.as_deref().unwrap_or(""),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let _ = events.send(Ok(StreamEvent::ToolStart(call.name.clone()))).await;
                let output = self.tools.dispatch(&call.name, call.arguments.clone()).await;
                debug!(tool = %call.name, output_len = output.len(), "Tool finished");
                let _ = events.send(Ok(StreamEvent::ToolEnd(call.name.clone()))).await;
                messages.push(ChatMessage::tool_result(&call.id, &call.name, &output));
            }
        }

        warn!(max_steps = self.settings.max_steps, "Mission ran out of steps");
        Err(Error::StepBudgetExceeded(self.settings.max_steps))
    }

    /// One streamed LLM call, retried with exponential backoff. An attempt that
    /// already forwarded tokens is not retried: the caller has seen them.
    async fn call_llm(&self, messages: &[ChatMessage], tools: &[Value], events: &EventSender) -> Result<LLMResponse> {
        let max_retries = self.settings.llm_max_retries;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.settings.llm_retry_delay * (1u32 << (attempt - 1).min(4));
                warn!(attempt, max_retries, delay_ms = delay.as_millis() as u64, "Retrying LLM call");
                tokio::time::sleep(delay).await;
            }
            let (outcome, streamed) = self.stream_once(messages, tools, events).await;
            match outcome {
                Ok(response) => {
                    if attempt > 0 {
                        info!(attempt, "LLM call succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) if streamed => {
                    warn!(error = %e, attempt, "LLM stream failed after partial output; not retrying");
                    return Err(e);
                }
                Err(e) if attempt < max_retries => {
                    warn!(error = %e, attempt, max_retries, "LLM call failed");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(error = %e, retries = max_retries, "LLM call failed after all retries");
                    return Err(e);
                }
            }
        }
    }

    /// Returns the call's outcome and whether any token reached `events`.
    async fn stream_once(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        events: &EventSender,
    ) -> (Result<LLMResponse>, bool) {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
        let call = async move {
            let tokens = token_tx;
            self.provider.chat_stream(messages, tools, &tokens).await
        };
        let forward = async {
            let mut streamed = false;
            while let Some(token) = token_rx.recv().await {
                streamed = true;
                let _ = events.send(Ok(StreamEvent::Token(token))).await;
            }
            streamed
        };
        tokio::join!(call, forward)
    }
}

impl MissionRunner for MissionAgent {
    fn start(&self, prompt: String) -> MissionStream {
        let agent = self.clone();
        let span = info_span!("mission", id = %Uuid::new_v4());
        MissionStream::spawn(move |events| {
            async move {
                if let Err(e) = agent.run(&prompt, &events).await {
                    let _ = events.send(Err(e)).await;
                }
            }
            .instrument(span)
        })
    }
}
