use crate::models::{AiModel, ModelConfig, Provider};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("No API key is configured for this provider. Add one in Settings.")]
    MissingCredential,
    #[error("The custom endpoint URL is missing or invalid.")]
    InvalidEndpoint,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// Trait defining the interface to the remote AI provider
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Sends one prompt and returns the full reply. An empty `credential`
    /// means none was stored.
    async fn complete(
        &self,
        text: &str,
        credential: &str,
        config: &ModelConfig,
    ) -> Result<String, CompletionError>;

    async fn validate_api_key(
        &self,
        api_key: &str,
        provider: Provider,
    ) -> Result<bool, CompletionError>;
}

// --- Placeholder provider ---

/// Stands in for the real provider APIs: waits `delay` and answers with a
/// canned reply describing the request.
pub struct PlaceholderCompletionService {
    delay: Duration,
}

impl PlaceholderCompletionService {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for PlaceholderCompletionService {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl CompletionService for PlaceholderCompletionService {
    async fn complete(
        &self,
        text: &str,
        credential: &str,
        config: &ModelConfig,
    ) -> Result<String, CompletionError> {
        if credential.is_empty() {
            return Err(CompletionError::MissingCredential);
        }

        let endpoint = match config.provider {
            Provider::Custom => match config.api_endpoint.as_deref().map(str::trim) {
                Some(endpoint) if !endpoint.is_empty() => Some(endpoint.to_string()),
                _ => return Err(CompletionError::InvalidEndpoint),
            },
            Provider::OpenAI | Provider::Anthropic => None,
        };

        log::info!(
            "Sending {} chars to {} using model: {}",
            text.len(),
            config.provider,
            config.model
        );
        tokio::time::sleep(self.delay).await;

        let reply = match endpoint {
            Some(endpoint) => format!(
                "This is a placeholder response from a custom API endpoint: {} using model: {} with temperature: {}. In a real implementation, this would be the response from the custom API.",
                endpoint, config.model, config.temperature
            ),
            None => format!(
                "This is a placeholder response from {} using model: {} with temperature: {}. In a real implementation, this would be the response from the {} API.",
                config.provider, config.model, config.temperature, config.provider
            ),
        };
        Ok(reply)
    }

    async fn validate_api_key(
        &self,
        api_key: &str,
        provider: Provider,
    ) -> Result<bool, CompletionError> {
        log::debug!("Validating API key for {}", provider);
        tokio::time::sleep(self.delay / 2).await;
        Ok(!api_key.is_empty())
    }
}

/// Rough price of a message by character count. Not token-accurate.
pub fn estimate_cost(message_len: usize, model: AiModel) -> f64 {
    let per_char = match model {
        AiModel::Gpt4 | AiModel::Gpt4Turbo => 0.00003,
        AiModel::Gpt35Turbo => 0.000015,
        AiModel::Claude3Opus => 0.00003,
        AiModel::Claude3Sonnet => 0.00002,
        AiModel::Claude3Haiku => 0.00001,
        AiModel::Custom => 0.0,
    };
    message_len as f64 * per_char
}
