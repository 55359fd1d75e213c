use std::sync::Arc;

use crate::api::CompletionService;
use crate::error::LotusError;
use crate::models::Provider;
use crate::secrets::{SecretError, SecretStore};

/// API key onboarding: check a key with the provider, then keep it in the
/// secret store under the provider's name.
#[derive(Clone)]
pub struct CredentialManager {
    secrets: Arc<dyn SecretStore>,
    completion: Arc<dyn CompletionService>,
}

impl CredentialManager {
    pub fn new(secrets: Arc<dyn SecretStore>, completion: Arc<dyn CompletionService>) -> Self {
        Self { secrets, completion }
    }

    pub async fn validate_and_save(&self, provider: Provider, api_key: &str) -> Result<(), LotusError> {
        if api_key.trim().is_empty() {
            return Err(LotusError::validation("API key cannot be empty"));
        }

        let valid = self.completion.validate_api_key(api_key, provider).await?;
        if !valid {
            log::warn!("API key for {} was rejected", provider);
            return Err(LotusError::Credential("Invalid API key".to_string()));
        }

        self.secrets.save(provider.as_str(), api_key)?;
        log::info!("Saved API key for {}", provider);
        Ok(())
    }

    pub fn has_credential(&self, provider: Provider) -> Result<bool, LotusError> {
        match self.secrets.get(provider.as_str()) {
            Ok(key) => Ok(!key.is_empty()),
            Err(SecretError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, provider: Provider) -> Result<(), LotusError> {
        self.secrets.delete(provider.as_str())?;
        log::info!("Removed API key for {}", provider);
        Ok(())
    }
}
