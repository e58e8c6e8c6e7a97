use std::sync::Arc;
use webscout_core::{Config, Error, Result};

use crate::{OpenAIProvider, Provider};

/// Build the chat provider named by `config.provider` and `config.agents`.
///
/// Any OpenAI-compatible endpoint works; the default base URL is Groq's.
pub fn create_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let api_key = config.provider.api_key.trim();
    if api_key.is_empty() {
        return Err(Error::Config(
            "No LLM API key configured. Set provider.apiKey in config.json or WEBSCOUT_PROVIDER_API_KEY."
                .to_string(),
        ));
    }
    let defaults = &config.agents;
    let provider = OpenAIProvider::new(
        api_key,
        &config.provider.api_base,
        &defaults.model,
        defaults.max_tokens,
        defaults.temperature,
        defaults.request_timeout(),
    )?;
    Ok(Arc::new(provider))
}
