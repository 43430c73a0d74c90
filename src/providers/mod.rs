pub mod anthropic;
pub mod base;
pub mod mock;
pub mod openai;
pub mod resolve;
pub mod sse;

pub use base::{
    ChatMessage, FinishReason, LlmProvider, ProviderEvent, ProviderRequest, ToolCallRequest,
    ToolDefinition, estimate_tokens,
};
pub use resolve::{Credential, CredentialResolver};

use crate::config::ProvidersConfig;
use crate::errors::{PryxError, PryxResult};
use std::sync::Arc;

/// Build the configured default provider.
pub fn build_provider(
    config: &ProvidersConfig,
    resolver: Arc<CredentialResolver>,
) -> PryxResult<Arc<dyn LlmProvider>> {
    match config.default_provider.as_str() {
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(
            config.anthropic.clone(),
            resolver,
            config.default_model.clone(),
        ))),
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(
            config.openai.clone(),
            resolver,
            config.default_model.clone(),
        ))),
        other => Err(PryxError::Config(format!("unknown provider '{other}'"))),
    }
}

/// Providers the gateway can report on.
pub fn known_providers() -> &'static [&'static str] {
    &["anthropic", "openai"]
}
