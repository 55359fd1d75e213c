use std::sync::Arc;
use uuid::Uuid;

use crate::api::{CompletionService, PlaceholderCompletionService};
use crate::chats::ChatManager;
use crate::config::AppConfig;
use crate::credentials::CredentialManager;
use crate::error::LotusError;
use crate::model_configs::ModelConfigManager;
use crate::secrets::{KeyringSecretStore, SecretStore};
use crate::session::{ChatSession, InFlightTurns};
use crate::storage::StorageManager;
use crate::templates::PromptTemplateManager;

// Core application state handed to the UI layer
#[derive(Clone)] // Cheap: everything is behind an Arc
pub struct AppState {
    // The pool serializes its own writes; multi-step changes use transactions.
    pub storage: Arc<StorageManager>,
    pub secrets: Arc<dyn SecretStore>,
    pub completion: Arc<dyn CompletionService>,
    pub in_flight: InFlightTurns, // One turn per chat across all sessions
}

impl AppState {
    pub fn new(
        storage: Arc<StorageManager>,
        secrets: Arc<dyn SecretStore>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            storage,
            secrets,
            completion,
            in_flight: InFlightTurns::new(),
        }
    }

    /// Opens the database, wires the keychain and the placeholder provider,
    /// and seeds default model configs and templates on first launch.
    pub async fn bootstrap(config: &AppConfig) -> Result<Self, LotusError> {
        let storage = StorageManager::open(&config.database_path).await?;
        let state = Self::new(
            Arc::new(storage),
            Arc::new(KeyringSecretStore::new(config.keyring_service.clone())),
            Arc::new(PlaceholderCompletionService::new(config.reply_delay)),
        );
        state.seed_defaults().await?;
        Ok(state)
    }

    pub async fn seed_defaults(&self) -> Result<(), LotusError> {
        let configs = self.model_configs().list().await?;
        let templates = self.templates().list().await?;
        log::info!(
            "Loaded {} model configs and {} prompt templates",
            configs.len(),
            templates.len()
        );
        Ok(())
    }

    pub fn model_configs(&self) -> ModelConfigManager {
        ModelConfigManager::new(self.storage.clone())
    }

    pub fn templates(&self) -> PromptTemplateManager {
        PromptTemplateManager::new(self.storage.clone())
    }

    pub fn chats(&self) -> ChatManager {
        ChatManager::new(self.storage.clone())
    }

    pub fn credentials(&self) -> CredentialManager {
        CredentialManager::new(self.secrets.clone(), self.completion.clone())
    }

    /// Opens an existing chat using the default model config.
    pub async fn open_session(&self, chat_id: Uuid) -> Result<ChatSession, LotusError> {
        let config = self
            .model_configs()
            .default_config()
            .await?
            .ok_or_else(|| LotusError::validation("No default model configuration is set"))?;
        ChatSession::open(self, chat_id, config).await
    }

    /// Creates a "New Chat" and opens it.
    pub async fn new_session(&self) -> Result<ChatSession, LotusError> {
        let chat = self.chats().create(None).await?;
        self.open_session(chat.id).await
    }
}
