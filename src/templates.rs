//! Prompt template library.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::LotusError;
use crate::models::{now_millis, PromptTemplate};
use crate::storage::StorageManager;

/// Whether the default template may be deleted.
///
/// Model configs never allow it, templates historically did. Both are
/// available; `Unrestricted` is what the library does unless told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateDeletePolicy {
    #[default]
    Unrestricted,
    ProtectDefault,
}

pub fn default_prompt_templates() -> Vec<PromptTemplate> {
    let mut general = PromptTemplate::new(
        "General Assistant",
        "You are a helpful assistant. Provide clear and concise responses to the user's questions.",
    );
    general.is_default = true;
    vec![
        general,
        PromptTemplate::new(
            "Code Reviewer",
            "You are a code review assistant. Analyze the code provided and suggest improvements, identify bugs, and explain best practices.",
        ),
        PromptTemplate::new(
            "Writing Helper",
            "You are a writing assistant. Help the user improve their writing by suggesting edits, alternative phrasings, and providing feedback on clarity and style.",
        ),
    ]
}

#[derive(Clone)]
pub struct PromptTemplateManager {
    storage: Arc<StorageManager>,
    delete_policy: TemplateDeletePolicy,
}

impl PromptTemplateManager {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            delete_policy: TemplateDeletePolicy::default(),
        }
    }

    pub fn with_delete_policy(mut self, policy: TemplateDeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn delete_policy(&self) -> TemplateDeletePolicy {
        self.delete_policy
    }

    /// All templates ordered by title, seeding the defaults into an empty store.
    pub async fn list(&self) -> Result<Vec<PromptTemplate>, LotusError> {
        let templates = self.storage.list_prompt_templates().await?;
        if !templates.is_empty() {
            return Ok(templates);
        }

        self.seed_if_empty().await?;
        Ok(self.storage.list_prompt_templates().await?)
    }

    async fn seed_if_empty(&self) -> Result<bool, LotusError> {
        Ok(self
            .storage
            .seed_prompt_templates(&default_prompt_templates())
            .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<PromptTemplate>, LotusError> {
        Ok(self.storage.get_prompt_template(id).await?)
    }

    pub async fn default_template(&self) -> Result<Option<PromptTemplate>, LotusError> {
        Ok(self.list().await?.into_iter().find(|t| t.is_default))
    }

    /// Returns `None` without writing when title or content is empty.
    pub async fn create(
        &self,
        title: &str,
        content: &str,
    ) -> Result<Option<PromptTemplate>, LotusError> {
        if title.is_empty() || content.is_empty() {
            log::debug!("Ignoring prompt template with empty title or content");
            return Ok(None);
        }

        self.seed_if_empty().await?;
        let template = PromptTemplate::new(title, content);
        self.storage.insert_prompt_template(&template).await?;
        Ok(Some(template))
    }

    /// Replaces title and content and refreshes `updated_at`. Returns `None`
    /// when either field is empty or the template does not exist.
    pub async fn update(
        &self,
        id: Uuid,
        title: &str,
        content: &str,
    ) -> Result<Option<PromptTemplate>, LotusError> {
        if title.is_empty() || content.is_empty() {
            log::debug!("Ignoring prompt template update with empty title or content");
            return Ok(None);
        }
        let Some(mut template) = self.storage.get_prompt_template(id).await? else {
            log::warn!("Prompt template {} not found for update", id);
            return Ok(None);
        };

        template.title = title.to_string();
        template.content = content.to_string();
        template.updated_at = now_millis();
        if !self.storage.update_prompt_template(&template).await? {
            return Ok(None);
        }
        Ok(Some(template))
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, LotusError> {
        let protect = self.delete_policy == TemplateDeletePolicy::ProtectDefault;
        Ok(self.storage.delete_prompt_template(id, protect).await?)
    }

    pub async fn set_default(&self, id: Uuid) -> Result<bool, LotusError> {
        Ok(self.storage.set_default_prompt_template(id).await?)
    }
}
