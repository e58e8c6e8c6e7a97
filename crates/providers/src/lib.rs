pub mod factory;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use webscout_core::{ChatMessage, LLMResponse, Result};

#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse>;

    /// Like [`chat`](Self::chat), sending content fragments to `tokens` as they
    /// are generated. Providers without streaming send the whole content once.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        tokens: &mpsc::Sender<String>,
    ) -> Result<LLMResponse> {
        let response = self.chat(messages, tools).await?;
        if let Some(content) = response.content.as_ref().filter(|c| !c.is_empty()) {
            let _ = tokens.send(content.clone()).await;
        }
        Ok(response)
    }
}

pub use factory::create_provider;
pub use openai::OpenAIProvider;
