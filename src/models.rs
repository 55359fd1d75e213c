use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Timestamps are persisted as Unix milliseconds, so everything created in
// memory is truncated to the same precision.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// Which family of API a model config talks to
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Custom,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAI, Provider::Anthropic, Provider::Custom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Custom => "Custom",
        }
    }

    /// Decodes a stored provider name. Unknown values fall back to OpenAI
    /// instead of failing the whole row.
    pub fn from_stored(raw: &str) -> Self {
        match raw {
            "OpenAI" => Provider::OpenAI,
            "Anthropic" => Provider::Anthropic,
            "Custom" => Provider::Custom,
            other => {
                log::warn!("Unknown provider '{}' in store, treating as OpenAI", other);
                Provider::OpenAI
            }
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// The fixed catalogue of model identifiers the app knows about
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AiModel {
    Gpt4,
    Gpt4Turbo,
    Gpt35Turbo,
    Claude3Opus,
    Claude3Sonnet,
    Claude3Haiku,
    Custom,
}

impl AiModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiModel::Gpt4 => "gpt-4",
            AiModel::Gpt4Turbo => "gpt-4-turbo",
            AiModel::Gpt35Turbo => "gpt-3.5-turbo",
            AiModel::Claude3Opus => "claude-3-opus",
            AiModel::Claude3Sonnet => "claude-3-sonnet",
            AiModel::Claude3Haiku => "claude-3-haiku",
            AiModel::Custom => "custom",
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            AiModel::Gpt4 | AiModel::Gpt4Turbo | AiModel::Gpt35Turbo => Provider::OpenAI,
            AiModel::Claude3Opus | AiModel::Claude3Sonnet | AiModel::Claude3Haiku => {
                Provider::Anthropic
            }
            AiModel::Custom => Provider::Custom,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "gpt-4" => Some(AiModel::Gpt4),
            "gpt-4-turbo" => Some(AiModel::Gpt4Turbo),
            "gpt-3.5-turbo" => Some(AiModel::Gpt35Turbo),
            "claude-3-opus" => Some(AiModel::Claude3Opus),
            "claude-3-sonnet" => Some(AiModel::Claude3Sonnet),
            "claude-3-haiku" => Some(AiModel::Claude3Haiku),
            "custom" => Some(AiModel::Custom),
            _ => None,
        }
    }

    /// Same as [`AiModel::parse`] but falls back to gpt-3.5-turbo.
    pub fn from_stored(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(AiModel::Gpt35Turbo)
    }
}

/// The model identifiers selectable for a provider.
pub fn available_models(provider: Provider) -> &'static [AiModel] {
    match provider {
        Provider::OpenAI => &[AiModel::Gpt4, AiModel::Gpt4Turbo, AiModel::Gpt35Turbo],
        Provider::Anthropic => &[
            AiModel::Claude3Opus,
            AiModel::Claude3Sonnet,
            AiModel::Claude3Haiku,
        ],
        Provider::Custom => &[AiModel::Custom],
    }
}

// Represents a configured provider/model pair with its sampling parameters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub provider: Provider,
    // Free-form for Custom, otherwise one of `available_models(provider)`
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
}

impl ModelConfig {
    pub const DEFAULT_TEMPERATURE: f64 = 0.7;
    pub const DEFAULT_MAX_TOKENS: u32 = 1000;

    pub fn new(name: impl Into<String>, provider: Provider, model: AiModel) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider,
            model: model.as_str().to_string(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            is_default: false,
            api_endpoint: None,
        }
    }

    pub fn model_type(&self) -> AiModel {
        AiModel::from_stored(&self.model)
    }
}

// A reusable system prompt
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PromptTemplate {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(default = "now_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now_millis")]
    pub updated_at: DateTime<Utc>,
    pub is_default: bool,
}

impl PromptTemplate {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
            is_default: false,
        }
    }
}

// Represents the metadata for a chat thread. Its messages live in their own
// table and are loaded by the session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chat {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    #[serde(default = "now_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now_millis")]
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub const DEFAULT_TITLE: &'static str = "New Chat";

    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// A row of the chat list: the chat plus a preview of its latest message
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatSummary {
    pub chat: Chat,
    pub last_message: Option<String>,
    pub message_count: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }

    /// Unknown stored values are read as assistant messages.
    pub fn from_stored(raw: &str) -> Self {
        match raw {
            "user" => Sender::User,
            _ => Sender::Assistant,
        }
    }
}

// Represents a single message in a chat
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender: Sender,
    pub text: String,
    #[serde(default = "now_millis")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(chat_id: Uuid, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            sender,
            text: text.into(),
            timestamp: now_millis(),
        }
    }
}
