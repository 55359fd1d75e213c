//! Core of the LotusAI chat assistant.
//!
//! The UI layer holds an [`AppState`] and drives everything through it:
//! model configurations, the prompt template library, the chat list, API key
//! onboarding, and [`ChatSession`]s that send messages to the provider and
//! persist the conversation.

// Declare the modules
pub mod api;
pub mod chats;
pub mod config;
pub mod credentials;
pub mod error;
pub mod exclusive;
pub mod model_configs;
pub mod models;
pub mod secrets;
pub mod session;
pub mod state;
pub mod storage;
pub mod templates;

pub use api::{estimate_cost, CompletionError, CompletionService, PlaceholderCompletionService};
pub use chats::ChatManager;
pub use config::AppConfig;
pub use credentials::CredentialManager;
pub use error::LotusError;
pub use model_configs::{ModelConfigInput, ModelConfigManager};
pub use models::{available_models, AiModel, Chat, ChatSummary, Message, ModelConfig, PromptTemplate, Provider, Sender};
pub use secrets::{InMemorySecretStore, KeyringSecretStore, SecretError, SecretStore};
pub use session::{ChatSession, InFlightTurns, SessionEvent, SessionSnapshot, TurnState};
pub use state::AppState;
pub use storage::StorageManager;
pub use templates::{PromptTemplateManager, TemplateDeletePolicy};

/// Installs the `env_logger` backend (filtered by `RUST_LOG`). Safe to call
/// more than once; only the first call has an effect.
pub fn init_logging() {
    if env_logger::try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
