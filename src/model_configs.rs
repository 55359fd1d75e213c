//! CRUD over model configurations with exactly one default.

use std::ops::RangeInclusive;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LotusError;
use crate::models::{available_models, AiModel, ModelConfig, Provider};
use crate::storage::StorageManager;

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<u32> = 100..=8000;

/// Field values for `create` and `update`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfigInput {
    pub name: String,
    pub provider: Provider,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub is_default: bool,
    pub api_endpoint: Option<String>,
}

impl ModelConfigInput {
    pub fn new(name: impl Into<String>, provider: Provider, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            temperature: ModelConfig::DEFAULT_TEMPERATURE,
            max_tokens: ModelConfig::DEFAULT_MAX_TOKENS,
            is_default: false,
            api_endpoint: None,
        }
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.api_endpoint = Some(endpoint.into());
        self
    }

    fn validate(&self) -> Result<(), LotusError> {
        if self.name.trim().is_empty() {
            return Err(LotusError::validation("Name cannot be empty"));
        }
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return Err(LotusError::validation(format!(
                "Temperature must be between 0.0 and 1.0, got {}",
                self.temperature
            )));
        }
        if !MAX_TOKENS_RANGE.contains(&self.max_tokens) {
            return Err(LotusError::validation(format!(
                "Max tokens must be between 100 and 8000, got {}",
                self.max_tokens
            )));
        }
        match self.provider {
            Provider::Custom if self.model.trim().is_empty() => {
                Err(LotusError::validation("Model cannot be empty"))
            }
            Provider::Custom => Ok(()),
            provider => {
                let known = AiModel::parse(&self.model)
                    .is_some_and(|model| available_models(provider).contains(&model));
                if known {
                    Ok(())
                } else {
                    Err(LotusError::validation(format!(
                        "Model '{}' is not available for {}",
                        self.model, provider
                    )))
                }
            }
        }
    }

    // Only Custom configs keep an endpoint.
    fn endpoint_for_provider(&self) -> Option<String> {
        match self.provider {
            Provider::Custom => self.api_endpoint.clone(),
            Provider::OpenAI | Provider::Anthropic => None,
        }
    }
}

/// The configs written on first launch.
pub fn default_model_configs() -> Vec<ModelConfig> {
    let mut gpt35 = ModelConfig::new("GPT-3.5 Turbo", Provider::OpenAI, AiModel::Gpt35Turbo);
    gpt35.is_default = true;
    vec![
        gpt35,
        ModelConfig::new("GPT-4", Provider::OpenAI, AiModel::Gpt4),
        ModelConfig::new("Claude 3 Haiku", Provider::Anthropic, AiModel::Claude3Haiku),
    ]
}

#[derive(Clone)]
pub struct ModelConfigManager {
    storage: Arc<StorageManager>,
}

impl ModelConfigManager {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    /// All configs ordered by name, seeding the defaults into an empty store.
    pub async fn list(&self) -> Result<Vec<ModelConfig>, LotusError> {
        let configs = self.storage.list_model_configs().await?;
        if !configs.is_empty() {
            return Ok(configs);
        }

        self.seed_if_empty().await?;
        Ok(self.storage.list_model_configs().await?)
    }

    // Seeding happens before the first write too, so a store never ends up
    // holding only user records and no default.
    async fn seed_if_empty(&self) -> Result<bool, LotusError> {
        Ok(self.storage.seed_model_configs(&default_model_configs()).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ModelConfig>, LotusError> {
        Ok(self.storage.get_model_config(id).await?)
    }

    pub async fn default_config(&self) -> Result<Option<ModelConfig>, LotusError> {
        Ok(self.list().await?.into_iter().find(|config| config.is_default))
    }

    pub async fn create(&self, input: ModelConfigInput) -> Result<ModelConfig, LotusError> {
        input.validate()?;
        self.seed_if_empty().await?;

        let config = ModelConfig {
            id: Uuid::new_v4(),
            name: input.name.clone(),
            provider: input.provider,
            model: input.model.clone(),
            temperature: input.temperature,
            max_tokens: input.max_tokens,
            is_default: input.is_default,
            api_endpoint: input.endpoint_for_provider(),
        };
        self.storage.insert_model_config(&config).await?;
        Ok(config)
    }

    /// Rewrites a config. Asking for `is_default` promotes it; a default
    /// config stays default, since the flag only moves by promotion.
    pub async fn update(&self, id: Uuid, input: ModelConfigInput) -> Result<ModelConfig, LotusError> {
        input.validate()?;

        let config = ModelConfig {
            id,
            name: input.name.clone(),
            provider: input.provider,
            model: input.model.clone(),
            temperature: input.temperature,
            max_tokens: input.max_tokens,
            is_default: input.is_default,
            api_endpoint: input.endpoint_for_provider(),
        };
        let stored = self
            .storage
            .update_model_config(&config, input.is_default)
            .await?
            .ok_or_else(|| LotusError::validation(format!("Model config {} not found", id)))?;

        if stored.is_default && !input.is_default {
            log::debug!("Ignoring request to unset default on model config {}", id);
        }
        Ok(stored)
    }

    /// Deletes a config. The default config is never deleted; returns
    /// whether anything was removed.
    pub async fn delete(&self, id: Uuid) -> Result<bool, LotusError> {
        let deleted = self.storage.delete_model_config(id).await?;
        if !deleted {
            log::info!("Model config {} kept (missing or the current default)", id);
        }
        Ok(deleted)
    }

    /// Makes `id` the only default. Unknown ids change nothing and return `false`.
    pub async fn set_default(&self, id: Uuid) -> Result<bool, LotusError> {
        Ok(self.storage.set_default_model_config(id).await?)
    }

    pub fn available_models(provider: Provider) -> &'static [AiModel] {
        available_models(provider)
    }
}
