use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tree::ConversationTree;

/// Everything needed to restore a conversation. Generation state is not part
/// of it: a loaded conversation is always idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: String,
    pub title: Option<String>,
    pub model: String,
    pub project_id: Option<String>,
    pub tree: ConversationTree,
    pub has_error: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Listing entry for a stored conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: Option<String>,
    pub model: String,
    pub project_id: Option<String>,
    pub has_error: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl From<&ConversationSnapshot> for ConversationSummary {
    fn from(snapshot: &ConversationSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            title: snapshot.title.clone(),
            model: snapshot.model.clone(),
            project_id: snapshot.project_id.clone(),
            has_error: snapshot.has_error,
            created_at_ms: snapshot.created_at_ms,
            updated_at_ms: snapshot.updated_at_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl PersistenceError {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        PersistenceError::Storage(Box::new(err))
    }
}

/// Durable storage for conversations.
///
/// Saves are whole-snapshot upserts keyed by id. Implementations must make a
/// save atomic: a reader sees either the previous snapshot or the new one.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save_conversation(
        &self,
        snapshot: &ConversationSnapshot,
    ) -> Result<(), PersistenceError>;

    async fn load_conversation(
        &self,
        id: &str,
    ) -> Result<Option<ConversationSnapshot>, PersistenceError>;

    /// Returns whether a conversation was removed.
    async fn delete_conversation(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError>;
}

/// Process-local gateway. Useful for tests and for running without a
/// database.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    conversations: Mutex<HashMap<String, ConversationSnapshot>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn save_conversation(
        &self,
        snapshot: &ConversationSnapshot,
    ) -> Result<(), PersistenceError> {
        self.conversations
            .lock()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_conversation(
        &self,
        id: &str,
    ) -> Result<Option<ConversationSnapshot>, PersistenceError> {
        Ok(self.conversations.lock().get(id).cloned())
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, PersistenceError> {
        Ok(self.conversations.lock().remove(id).is_some())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .lock()
            .values()
            .map(ConversationSummary::from)
            .collect();
        summaries.sort_by(|a, b| {
            b.updated_at_ms
                .cmp(&a.updated_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(summaries)
    }
}
