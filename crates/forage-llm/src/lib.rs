pub mod cache;
pub mod providers;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use forage_core::config::{AppConfig, ModelConfig};
use forage_core::error::{ForageError, Result};
use forage_core::traits::LlmClient;

pub use cache::{CachedResponse, CachingClient, ResponseCache};
pub use providers::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    if providers::presets::is_openai_compatible(&config.provider) {
        Ok(Box::new(OpenAiClient::new()))
    } else {
        Err(ForageError::UnsupportedProvider(config.provider.clone()))
    }
}

/// Build the full client stack for a run: retries and fallbacks, then
/// the response cache when enabled.
///
/// Returns the cache handle so the coordinator can purge it per run.
pub fn build_client(
    config: &AppConfig,
) -> Result<(Arc<dyn LlmClient>, Option<Arc<ResponseCache>>)> {
    let primary = create_client(&config.model)?;
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| create_client(fb).map(|client| (fb.clone(), client)))
        .collect::<Result<Vec<_>>>()?;
    let retrying = RetryingClient::new(
        primary,
        fallbacks,
        config.model.retry.clone().unwrap_or_default(),
    );

    if !config.workflow.cache {
        return Ok((Arc::new(retrying), None));
    }
    let cache = Arc::new(ResponseCache::new(config.cache_dir()));
    let client = CachingClient::new(Box::new(retrying), cache.clone());
    Ok((Arc::new(client), Some(cache)))
}
