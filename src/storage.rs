use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::exclusive::{self, ExclusiveDefault};
use crate::models::{Chat, ChatSummary, Message, ModelConfig, PromptTemplate, Provider, Sender};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Model Configurations Table
CREATE TABLE IF NOT EXISTS model_configs (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    name TEXT NOT NULL,
    provider TEXT NOT NULL, -- 'OpenAI' | 'Anthropic' | 'Custom'
    model TEXT NOT NULL,
    temperature REAL NOT NULL,
    max_tokens INTEGER NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    api_endpoint TEXT -- only set for Custom
);

-- Prompt Templates Table
CREATE TABLE IF NOT EXISTS prompt_templates (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    updated_at INTEGER NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0
);

-- Chats Table
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chats_updated_at ON chats(updated_at);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    chat_id TEXT NOT NULL,
    sender TEXT NOT NULL, -- 'user' or 'assistant'
    text TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
";

#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            log::info!("Database file not found, creating {}", path.display());
        }
        log::info!("Connecting to database: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. It lives on a single connection that
    /// is never recycled, since every new connection would see an empty one.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection. Later calls fail with a pool-closed error.
    pub async fn close(&self) {
        log::info!("Closing database pool");
        self.pool.close().await;
    }

    // --- Model configs ---

    pub async fn count_model_configs(&self) -> Result<i64, anyhow::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM model_configs")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count model configs")
    }

    /// Fetches all model configurations, ordered by name.
    pub async fn list_model_configs(&self) -> Result<Vec<ModelConfig>, anyhow::Error> {
        log::debug!("Fetching all model configurations from database");
        let configs: Vec<ModelConfig> = sqlx::query(
            r#"
            SELECT id, name, provider, model, temperature, max_tokens, is_default, api_endpoint
            FROM model_configs
            ORDER BY name ASC
            "#,
        )
        .fetch(&self.pool)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { model_config_from_row(&row) })
        .try_collect()
        .await
        .context("Failed to fetch model configs from database")?;

        log::debug!("Fetched {} model configurations", configs.len());
        Ok(configs)
    }

    pub async fn get_model_config(&self, id: Uuid) -> Result<Option<ModelConfig>, anyhow::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, name, provider, model, temperature, max_tokens, is_default, api_endpoint
            FROM model_configs
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch model config from database")?;

        row.as_ref().map(model_config_from_row).transpose()
    }

    /// Inserts a model config. A default record demotes every other row in
    /// the same transaction.
    pub async fn insert_model_config(&self, config: &ModelConfig) -> Result<(), anyhow::Error> {
        log::info!("Adding new model config: {}", config.name);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if config.is_default {
            exclusive::clear_default::<ModelConfig>(&mut tx).await?;
        }
        insert_model_config_row(&mut tx, config).await?;

        tx.commit().await.context("Failed to commit model config")?;
        log::info!("Successfully added model config with ID: {}", config.id);
        Ok(())
    }

    /// Seeds `defaults` only if the table is still empty. Returns whether it did.
    pub async fn seed_model_configs(&self, defaults: &[ModelConfig]) -> Result<bool, anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM model_configs")
            .fetch_one(&mut *tx)
            .await
            .context("Failed to count model configs")?;
        if count > 0 {
            log::debug!("Found {} existing model configs, skipping defaults.", count);
            return Ok(false);
        }

        for config in defaults {
            insert_model_config_row(&mut tx, config).await?;
        }

        tx.commit().await.context("Failed to commit default model configs")?;
        log::info!("No model configs found, added {} defaults.", defaults.len());
        Ok(true)
    }

    /// Writes every field of `config` except the default flag, which only
    /// moves through `promote`. Returns the stored row, or `None` if it
    /// does not exist.
    pub async fn update_model_config(
        &self,
        config: &ModelConfig,
        promote: bool,
    ) -> Result<Option<ModelConfig>, anyhow::Error> {
        let id_text = config.id.to_string();
        log::info!("Updating model config: {} ({})", config.name, id_text);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let result = sqlx::query(
            r#"
            UPDATE model_configs
            SET name = ?, provider = ?, model = ?, temperature = ?, max_tokens = ?, api_endpoint = ?
            WHERE id = ?
            "#,
        )
        .bind(config.name.as_str())
        .bind(config.provider.as_str())
        .bind(config.model.as_str())
        .bind(config.temperature)
        .bind(i64::from(config.max_tokens))
        .bind(config.api_endpoint.as_deref())
        .bind(id_text.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to update model config in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to update non-existent model config: {}", id_text);
            tx.rollback().await.context("Failed to roll back model config update")?;
            return Ok(None);
        }
        if promote {
            exclusive::promote::<ModelConfig>(&mut tx, config.id).await?;
        }

        let row = sqlx::query(
            r#"
            SELECT id, name, provider, model, temperature, max_tokens, is_default, api_endpoint
            FROM model_configs
            WHERE id = ?
            "#,
        )
        .bind(id_text.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to re-read updated model config")?;
        let stored = model_config_from_row(&row)?;

        tx.commit().await.context("Failed to commit model config update")?;
        Ok(Some(stored))
    }

    /// Deletes a model config unless it is the default. Returns whether a row went away.
    pub async fn delete_model_config(&self, id: Uuid) -> Result<bool, anyhow::Error> {
        let id_text = id.to_string();
        let result = sqlx::query("DELETE FROM model_configs WHERE id = ? AND is_default = 0")
            .bind(id_text.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete model config from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Model config {} was not deleted (missing or default)", id_text);
            return Ok(false);
        }
        log::warn!("Deleted model config {}", id_text);
        Ok(true)
    }

    pub async fn set_default_model_config(&self, id: Uuid) -> Result<bool, anyhow::Error> {
        self.promote::<ModelConfig>(id).await
    }

    // --- Prompt templates ---

    /// Fetches all prompt templates, ordered by title.
    pub async fn list_prompt_templates(&self) -> Result<Vec<PromptTemplate>, anyhow::Error> {
        log::debug!("Fetching all prompt templates from database");
        let templates: Vec<PromptTemplate> = sqlx::query(
            r#"
            SELECT id, title, content, created_at, updated_at, is_default
            FROM prompt_templates
            ORDER BY title ASC
            "#,
        )
        .fetch(&self.pool)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { prompt_template_from_row(&row) })
        .try_collect()
        .await
        .context("Failed to fetch prompt templates from database")?;

        log::debug!("Fetched {} prompt templates", templates.len());
        Ok(templates)
    }

    pub async fn get_prompt_template(
        &self,
        id: Uuid,
    ) -> Result<Option<PromptTemplate>, anyhow::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, title, content, created_at, updated_at, is_default
            FROM prompt_templates
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch prompt template from database")?;

        row.as_ref().map(prompt_template_from_row).transpose()
    }

    pub async fn insert_prompt_template(&self, template: &PromptTemplate) -> Result<(), anyhow::Error> {
        log::info!("Adding new prompt template: {}", template.title);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if template.is_default {
            exclusive::clear_default::<PromptTemplate>(&mut tx).await?;
        }
        insert_template_row(&mut tx, template).await?;

        tx.commit().await.context("Failed to commit prompt template")?;
        Ok(())
    }

    pub async fn seed_prompt_templates(
        &self,
        defaults: &[PromptTemplate],
    ) -> Result<bool, anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM prompt_templates")
            .fetch_one(&mut *tx)
            .await
            .context("Failed to count prompt templates")?;
        if count > 0 {
            log::debug!("Found {} existing prompt templates, skipping defaults.", count);
            return Ok(false);
        }

        for template in defaults {
            insert_template_row(&mut tx, template).await?;
        }

        tx.commit().await.context("Failed to commit default prompt templates")?;
        log::info!("No prompt templates found, added {} defaults.", defaults.len());
        Ok(true)
    }

    /// Updates title, content and `updated_at`. Returns `false` if the row does not exist.
    pub async fn update_prompt_template(&self, template: &PromptTemplate) -> Result<bool, anyhow::Error> {
        let id_text = template.id.to_string();
        log::info!("Updating prompt template: {} ({})", template.title, id_text);

        let result = sqlx::query(
            "UPDATE prompt_templates SET title = ?, content = ?, updated_at = ? WHERE id = ?",
        )
        .bind(template.title.as_str())
        .bind(template.content.as_str())
        .bind(template.updated_at.timestamp_millis())
        .bind(id_text.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update prompt template in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to update non-existent prompt template: {}", id_text);
            return Ok(false);
        }
        Ok(true)
    }

    /// Deletes a template. With `protect_default` the default row is kept.
    pub async fn delete_prompt_template(
        &self,
        id: Uuid,
        protect_default: bool,
    ) -> Result<bool, anyhow::Error> {
        let id_text = id.to_string();
        let sql = if protect_default {
            "DELETE FROM prompt_templates WHERE id = ? AND is_default = 0"
        } else {
            "DELETE FROM prompt_templates WHERE id = ?"
        };
        let result = sqlx::query(sql)
            .bind(id_text.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete prompt template from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Prompt template {} was not deleted", id_text);
            return Ok(false);
        }
        log::warn!("Deleted prompt template {}", id_text);
        Ok(true)
    }

    pub async fn set_default_prompt_template(&self, id: Uuid) -> Result<bool, anyhow::Error> {
        self.promote::<PromptTemplate>(id).await
    }

    async fn promote<T: ExclusiveDefault>(&self, id: Uuid) -> Result<bool, anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        if !exclusive::promote::<T>(&mut tx, id).await? {
            tx.rollback().await.context("Failed to roll back default change")?;
            return Ok(false);
        }
        tx.commit().await.context("Failed to commit default change")?;
        Ok(true)
    }

    // --- Chats ---

    pub async fn insert_chat(&self, chat: &Chat) -> Result<(), anyhow::Error> {
        log::info!("Creating new chat {} ({})", chat.id, chat.title);
        sqlx::query("INSERT INTO chats (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(chat.id.to_string())
            .bind(chat.title.as_str())
            .bind(chat.created_at.timestamp_millis())
            .bind(chat.updated_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to insert new chat into database")?;
        Ok(())
    }

    pub async fn get_chat(&self, chat_id: Uuid) -> Result<Option<Chat>, anyhow::Error> {
        log::debug!("Fetching chat with ID: {}", chat_id);
        let row = sqlx::query("SELECT id, title, created_at, updated_at FROM chats WHERE id = ?")
            .bind(chat_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch chat from database")?;

        row.as_ref().map(chat_from_row).transpose()
    }

    /// Fetches every chat with its latest message, most recently updated first.
    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, anyhow::Error> {
        log::debug!("Fetching all chats from database");
        let chats: Vec<ChatSummary> = sqlx::query(
            r#"
            SELECT c.id, c.title, c.created_at, c.updated_at,
                (SELECT m.text FROM messages m
                    WHERE m.chat_id = c.id
                    ORDER BY m.timestamp DESC, m.rowid DESC
                    LIMIT 1) AS last_message,
                (SELECT COUNT(*) FROM messages m WHERE m.chat_id = c.id) AS message_count
            FROM chats c
            ORDER BY c.updated_at DESC, c.rowid DESC
            "#,
        )
        .fetch(&self.pool)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { chat_summary_from_row(&row) })
        .try_collect()
        .await
        .context("Failed to fetch chats from database")?;

        log::debug!("Fetched {} chats", chats.len());
        Ok(chats)
    }

    pub async fn rename_chat(
        &self,
        chat_id: Uuid,
        title: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        log::info!("Renaming chat {} to: {}", chat_id, title);
        let result = sqlx::query("UPDATE chats SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(updated_at.timestamp_millis())
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update chat title in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to rename non-existent chat: {}", chat_id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Deletes a chat; `ON DELETE CASCADE` takes its messages with it.
    pub async fn delete_chat(&self, chat_id: Uuid) -> Result<bool, anyhow::Error> {
        log::warn!("Deleting chat with ID: {}", chat_id);
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete chat from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent chat: {}", chat_id);
            return Ok(false);
        }
        Ok(true)
    }

    // --- Messages ---

    /// Fetches all messages of a chat, oldest first. Equal timestamps keep
    /// insertion order.
    pub async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<Message>, anyhow::Error> {
        log::debug!("Fetching messages for chat ID: {}", chat_id);
        let messages: Vec<Message> = sqlx::query(
            r#"
            SELECT id, chat_id, sender, text, timestamp
            FROM messages
            WHERE chat_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(chat_id.to_string())
        .fetch(&self.pool)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { message_from_row(&row) })
        .try_collect()
        .await
        .context("Failed to fetch messages from database")?;

        log::debug!("Fetched {} messages for chat {}", messages.len(), chat_id);
        Ok(messages)
    }

    /// Saves a message and bumps its chat's `updated_at` as one unit.
    pub async fn append_message(
        &self,
        message: &Message,
        touched_at: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        log::debug!("Saving message ID: {} to chat: {}", message.id, message.chat_id);
        let chat_id_text = message.chat_id.to_string();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender, text, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(chat_id_text.as_str())
        .bind(message.sender.as_str())
        .bind(message.text.as_str())
        .bind(message.timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to insert message into database")?;

        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(touched_at.timestamp_millis())
            .bind(chat_id_text.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to update chat updated_at timestamp")?;

        tx.commit().await.context("Failed to commit message")?;
        log::info!("Successfully saved message ID: {}", message.id);
        Ok(())
    }

    /// Removes a message from its chat and bumps the chat's `updated_at`.
    /// Returns `false` (and changes nothing) if the message is not in that chat.
    pub async fn delete_message(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        touched_at: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let chat_id_text = chat_id.to_string();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND chat_id = ?")
            .bind(message_id.to_string())
            .bind(chat_id_text.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to delete message from database")?;
        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent message {} in chat {}", message_id, chat_id);
            tx.rollback().await.context("Failed to roll back message delete")?;
            return Ok(false);
        }

        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(touched_at.timestamp_millis())
            .bind(chat_id_text.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to update chat updated_at timestamp")?;

        tx.commit().await.context("Failed to commit message delete")?;
        log::info!("Deleted message {} from chat {}", message_id, chat_id);
        Ok(true)
    }

    pub async fn count_messages(&self) -> Result<i64, anyhow::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count messages")
    }
}

async fn insert_model_config_row(
    conn: &mut sqlx::SqliteConnection,
    config: &ModelConfig,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO model_configs (id, name, provider, model, temperature, max_tokens, is_default, api_endpoint)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(config.id.to_string())
    .bind(config.name.as_str())
    .bind(config.provider.as_str())
    .bind(config.model.as_str())
    .bind(config.temperature)
    .bind(i64::from(config.max_tokens))
    .bind(config.is_default)
    .bind(config.api_endpoint.as_deref())
    .execute(&mut *conn)
    .await
    .context("Failed to insert model config into database")?;
    Ok(())
}

async fn insert_template_row(
    conn: &mut sqlx::SqliteConnection,
    template: &PromptTemplate,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO prompt_templates (id, title, content, created_at, updated_at, is_default)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(template.id.to_string())
    .bind(template.title.as_str())
    .bind(template.content.as_str())
    .bind(template.created_at.timestamp_millis())
    .bind(template.updated_at.timestamp_millis())
    .bind(template.is_default)
    .execute(&mut *conn)
    .await
    .context("Failed to insert prompt template into database")?;
    Ok(())
}

// --- Row mapping ---

fn parse_id(raw: &str, what: &str) -> Result<Uuid, anyhow::Error> {
    Uuid::parse_str(raw).with_context(|| format!("Failed to parse {} ID", what))
}

fn from_millis(millis: i64, what: &str) -> Result<DateTime<Utc>, anyhow::Error> {
    DateTime::from_timestamp_millis(millis).with_context(|| format!("Invalid {} timestamp", what))
}

fn model_config_from_row(row: &SqliteRow) -> Result<ModelConfig, anyhow::Error> {
    let max_tokens: i64 = row.try_get("max_tokens")?;
    Ok(ModelConfig {
        id: parse_id(&row.try_get::<String, _>("id")?, "model config")?,
        name: row.try_get("name")?,
        provider: Provider::from_stored(&row.try_get::<String, _>("provider")?),
        model: row.try_get("model")?,
        temperature: row.try_get("temperature")?,
        max_tokens: u32::try_from(max_tokens).context("max_tokens out of range")?,
        is_default: row.try_get("is_default")?,
        api_endpoint: row.try_get("api_endpoint")?,
    })
}

fn prompt_template_from_row(row: &SqliteRow) -> Result<PromptTemplate, anyhow::Error> {
    Ok(PromptTemplate {
        id: parse_id(&row.try_get::<String, _>("id")?, "prompt template")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        created_at: from_millis(row.try_get("created_at")?, "created_at")?,
        updated_at: from_millis(row.try_get("updated_at")?, "updated_at")?,
        is_default: row.try_get("is_default")?,
    })
}

fn chat_from_row(row: &SqliteRow) -> Result<Chat, anyhow::Error> {
    Ok(Chat {
        id: parse_id(&row.try_get::<String, _>("id")?, "chat")?,
        title: row.try_get("title")?,
        created_at: from_millis(row.try_get("created_at")?, "created_at")?,
        updated_at: from_millis(row.try_get("updated_at")?, "updated_at")?,
    })
}

fn chat_summary_from_row(row: &SqliteRow) -> Result<ChatSummary, anyhow::Error> {
    let message_count: i64 = row.try_get("message_count")?;
    Ok(ChatSummary {
        chat: chat_from_row(row)?,
        last_message: row.try_get("last_message")?,
        message_count: u64::try_from(message_count).context("Negative message count")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, anyhow::Error> {
    Ok(Message {
        id: parse_id(&row.try_get::<String, _>("id")?, "message")?,
        chat_id: parse_id(&row.try_get::<String, _>("chat_id")?, "chat")?,
        sender: Sender::from_stored(&row.try_get::<String, _>("sender")?),
        text: row.try_get("text")?,
        timestamp: from_millis(row.try_get("timestamp")?, "message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_millis, AiModel};
    use chrono::Duration;

    #[tokio::test]
    async fn deleting_a_chat_cascades_to_its_messages() {
        let storage = StorageManager::in_memory().await.expect("storage");
        let keep = Chat::new("keep");
        let doomed = Chat::new("doomed");
        storage.insert_chat(&keep).await.expect("insert");
        storage.insert_chat(&doomed).await.expect("insert");

        for chat in [&keep, &doomed] {
            let message = Message::new(chat.id, Sender::User, "hello");
            storage.append_message(&message, now_millis()).await.expect("append");
        }
        assert_eq!(storage.count_messages().await.expect("count"), 2);

        assert!(storage.delete_chat(doomed.id).await.expect("delete"));
        assert_eq!(storage.count_messages().await.expect("count"), 1);
        assert!(storage.list_messages(doomed.id).await.expect("list").is_empty());
        assert_eq!(storage.list_messages(keep.id).await.expect("list").len(), 1);
        assert!(!storage.delete_chat(doomed.id).await.expect("second delete"));
    }

    #[tokio::test]
    async fn messages_with_equal_timestamps_keep_insertion_order() {
        let storage = StorageManager::in_memory().await.expect("storage");
        let chat = Chat::new("ties");
        storage.insert_chat(&chat).await.expect("insert");

        let t1 = now_millis();
        let t2 = t1 + Duration::seconds(1);
        let mut later = Message::new(chat.id, Sender::Assistant, "C");
        later.timestamp = t2;
        let mut a = Message::new(chat.id, Sender::User, "A");
        a.timestamp = t1;
        let mut b = Message::new(chat.id, Sender::Assistant, "B");
        b.timestamp = t1;

        // C is written first but sorts last by timestamp.
        for message in [&later, &a, &b] {
            storage.append_message(message, now_millis()).await.expect("append");
        }

        let texts: Vec<String> = storage
            .list_messages(chat.id)
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn appending_touches_the_chat_and_requires_it_to_exist() {
        let storage = StorageManager::in_memory().await.expect("storage");
        let mut chat = Chat::new("touch");
        chat.updated_at = now_millis() - Duration::hours(1);
        storage.insert_chat(&chat).await.expect("insert");

        let touched = now_millis();
        let message = Message::new(chat.id, Sender::User, "hi");
        storage.append_message(&message, touched).await.expect("append");
        let reloaded = storage.get_chat(chat.id).await.expect("get").expect("chat");
        assert_eq!(reloaded.updated_at, touched);

        let orphan = Message::new(Uuid::new_v4(), Sender::User, "nobody home");
        assert!(storage.append_message(&orphan, now_millis()).await.is_err());
        assert_eq!(storage.count_messages().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn chat_list_is_newest_first_with_preview() {
        let storage = StorageManager::in_memory().await.expect("storage");
        let mut old = Chat::new("old");
        old.updated_at = now_millis() - Duration::days(1);
        let fresh = Chat::new("fresh");
        storage.insert_chat(&old).await.expect("insert");
        storage.insert_chat(&fresh).await.expect("insert");
        storage
            .append_message(&Message::new(fresh.id, Sender::User, "first"), now_millis())
            .await
            .expect("append");
        storage
            .append_message(&Message::new(fresh.id, Sender::Assistant, "latest"), now_millis())
            .await
            .expect("append");

        let chats = storage.list_chats().await.expect("list");
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].chat.id, fresh.id);
        assert_eq!(chats[0].last_message.as_deref(), Some("latest"));
        assert_eq!(chats[0].message_count, 2);
        assert_eq!(chats[1].last_message, None);
    }

    #[tokio::test]
    async fn model_config_round_trips_every_field() {
        let storage = StorageManager::in_memory().await.expect("storage");
        let mut config = ModelConfig::new("Local", Provider::Custom, AiModel::Custom);
        config.model = "llama-3-8b".to_string();
        config.temperature = 0.25;
        config.max_tokens = 4096;
        config.api_endpoint = Some("http://localhost:11434/v1".to_string());

        storage.insert_model_config(&config).await.expect("insert");
        let loaded = storage
            .get_model_config(config.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("lotusai.sqlite");

        let chat = Chat::new("persisted");
        {
            let storage = StorageManager::open(&path).await.expect("open");
            storage.insert_chat(&chat).await.expect("insert");
            storage
                .append_message(&Message::new(chat.id, Sender::User, "still here"), now_millis())
                .await
                .expect("append");
            storage.close().await;
        }

        let storage = StorageManager::open(&path).await.expect("reopen");
        assert_eq!(storage.get_chat(chat.id).await.expect("get"), Some(chat.clone()));
        let messages = storage.list_messages(chat.id).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "still here");
    }

    #[tokio::test]
    async fn closed_pool_reports_errors() {
        let storage = StorageManager::in_memory().await.expect("storage");
        storage.close().await;
        assert!(storage.list_chats().await.is_err());
    }
}
