//! Error taxonomy shared by the managers and the chat session.

use thiserror::Error;
use uuid::Uuid;

use crate::api::CompletionError;
use crate::secrets::SecretError;

#[derive(Debug, Error)]
pub enum LotusError {
    /// A required field was empty or out of range. Nothing was written.
    #[error("{0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    /// Missing or rejected API key.
    #[error("{0}")]
    Credential(String),
    /// Network, endpoint or provider failure on the remote call.
    #[error("{0}")]
    RemoteService(String),
    #[error("storage failure: {0:#}")]
    Persistence(anyhow::Error),
    #[error("a message is already being sent in chat {0}")]
    TurnInFlight(Uuid),
}

impl LotusError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Remote failures are worth resending; everything else needs user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteService(_))
    }
}

impl From<anyhow::Error> for LotusError {
    fn from(value: anyhow::Error) -> Self {
        Self::Persistence(value)
    }
}

impl From<CompletionError> for LotusError {
    fn from(value: CompletionError) -> Self {
        match value {
            CompletionError::MissingCredential => Self::Credential(value.to_string()),
            other => Self::RemoteService(other.to_string()),
        }
    }
}

impl From<SecretError> for LotusError {
    fn from(value: SecretError) -> Self {
        Self::Credential(value.to_string())
    }
}
