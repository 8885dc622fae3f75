use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use twig_llm::LanguageModelProvider;

use crate::config::GenerationConfig;
use crate::conversation::Conversation;
use crate::error::Result;
use crate::persistence::{ConversationSummary, PersistenceGateway};
use crate::record::ConversationRecord;

/// Owns the live conversations of a session.
///
/// Handles stay registered here until the conversation is deleted, so a reply
/// keeps streaming after the caller navigates away from it.
pub struct ConversationManager {
    provider: Arc<LanguageModelProvider>,
    gateway: Arc<dyn PersistenceGateway>,
    config: GenerationConfig,
    default_model: String,
    live: Mutex<HashMap<String, Conversation>>,
}

impl ConversationManager {
    pub fn new(
        provider: Arc<LanguageModelProvider>,
        gateway: Arc<dyn PersistenceGateway>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            gateway,
            config: GenerationConfig::default(),
            default_model: default_model.into(),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Start a new, empty conversation. It is stored on its first mutation.
    pub fn create(&self, model: Option<&str>, project_id: Option<&str>) -> Conversation {
        let mut record = ConversationRecord::new(model.unwrap_or(&self.default_model));
        if let Some(project_id) = project_id {
            record = record.with_project(project_id);
        }
        debug!(conversation_id = %record.id(), model = %record.model(), "conversation created");
        self.register(record)
    }

    /// The live handle for `id`, loading it from storage if needed.
    pub async fn open(&self, id: &str) -> Result<Option<Conversation>> {
        if let Some(conversation) = self.get(id) {
            return Ok(Some(conversation));
        }

        let Some(snapshot) = self.gateway.load_conversation(id).await? else {
            return Ok(None);
        };
        // Another caller may have opened it while we were loading.
        if let Some(conversation) = self.get(id) {
            return Ok(Some(conversation));
        }
        Ok(Some(self.register(ConversationRecord::from_snapshot(snapshot))))
    }

    /// The live handle for `id`, without touching storage.
    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.live.lock().get(id).cloned()
    }

    /// Stop any running generation and remove the conversation everywhere.
    /// Returns whether anything was deleted.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let live = self.live.lock().remove(id);
        if let Some(conversation) = &live {
            conversation.cancel_generation().await;
        }
        let stored = self.gateway.delete_conversation(id).await?;
        debug!(conversation_id = %id, stored, "conversation deleted");
        Ok(stored || live.is_some())
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.gateway.list_conversations().await?)
    }

    fn register(&self, record: ConversationRecord) -> Conversation {
        let id = record.id().to_string();
        let conversation = Conversation::new(
            record,
            Arc::clone(&self.provider),
            Arc::clone(&self.gateway),
            self.config.clone(),
        );
        self.live.lock().insert(id, conversation.clone());
        conversation
    }
}
