//! Per-provider API key storage.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("no API key stored for '{0}'")]
    NotFound(String),
    #[error("credential store failure: {0}")]
    Backend(String),
}

/// Key/secret storage keyed by provider name.
///
/// `save` replaces any existing secret for the key and `delete` treats a
/// missing key as success.
pub trait SecretStore: Send + Sync {
    fn save(&self, key: &str, secret: &str) -> Result<(), SecretError>;
    fn get(&self, key: &str) -> Result<String, SecretError>;
    fn delete(&self, key: &str) -> Result<(), SecretError>;
}

// --- OS keychain ---

pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, SecretError> {
        Entry::new(&self.service, key).map_err(|e| SecretError::Backend(e.to_string()))
    }
}

impl SecretStore for KeyringSecretStore {
    fn save(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        log::info!("Saving API key in keyring for service: {} ({})", self.service, key);
        self.entry(key)?
            .set_password(secret)
            .map_err(|e| SecretError::Backend(format!("failed to save key for '{}': {}", key, e)))
    }

    fn get(&self, key: &str) -> Result<String, SecretError> {
        log::debug!("Retrieving API key from keyring for service: {} ({})", self.service, key);
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => Err(SecretError::NotFound(key.to_string())),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        log::warn!("Deleting API key from keyring for service: {} ({})", self.service, key);
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }
}

// --- In memory, for tests and previews ---

#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn secrets(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, SecretError> {
        self.secrets
            .lock()
            .map_err(|_| SecretError::Backend("secret store lock poisoned".to_string()))
    }
}

impl SecretStore for InMemorySecretStore {
    fn save(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        self.secrets()?.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<String, SecretError> {
        self.secrets()?
            .get(key)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.secrets()?.remove(key);
        Ok(())
    }
}
