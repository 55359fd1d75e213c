use std::sync::Arc;
use uuid::Uuid;

use crate::error::LotusError;
use crate::models::{now_millis, Chat, ChatSummary};
use crate::storage::StorageManager;

/// The chat list: everything about chats except sending messages, which
/// goes through [`crate::session::ChatSession`].
#[derive(Clone)]
pub struct ChatManager {
    storage: Arc<StorageManager>,
}

impl ChatManager {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    /// Most recently updated first, with a preview of the latest message.
    pub async fn list(&self) -> Result<Vec<ChatSummary>, LotusError> {
        Ok(self.storage.list_chats().await?)
    }

    pub async fn get(&self, chat_id: Uuid) -> Result<Option<Chat>, LotusError> {
        Ok(self.storage.get_chat(chat_id).await?)
    }

    /// Creates an empty chat; `None` uses the "New Chat" title.
    pub async fn create(&self, title: Option<&str>) -> Result<Chat, LotusError> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(Chat::DEFAULT_TITLE);
        let chat = Chat::new(title);
        self.storage.insert_chat(&chat).await?;
        Ok(chat)
    }

    pub async fn rename(&self, chat_id: Uuid, title: &str) -> Result<Chat, LotusError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(LotusError::validation("Chat title cannot be empty"));
        }
        let mut chat = self
            .storage
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| LotusError::not_found("chat", chat_id))?;

        let updated_at = now_millis();
        if !self.storage.rename_chat(chat_id, title, updated_at).await? {
            return Err(LotusError::not_found("chat", chat_id));
        }
        chat.title = title.to_string();
        chat.updated_at = updated_at;
        Ok(chat)
    }

    /// Deletes the chat and all of its messages. Unknown ids return `false`.
    pub async fn delete(&self, chat_id: Uuid) -> Result<bool, LotusError> {
        Ok(self.storage.delete_chat(chat_id).await?)
    }
}
