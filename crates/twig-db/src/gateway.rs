use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;
use twig_core::{
    ConversationSnapshot, ConversationSummary, PersistenceError, PersistenceGateway,
};

use crate::conversations::ListConversations;
use crate::error::Result;
use crate::store::Store;

/// [`PersistenceGateway`] backed by a SQLite [`Store`].
///
/// Statements are short single-row transactions, so they run inline on the
/// calling task.
pub struct SqliteGateway {
    store: Mutex<Store>,
}

impl SqliteGateway {
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Store::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Store::open_in_memory()?))
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn save_conversation(
        &self,
        snapshot: &ConversationSnapshot,
    ) -> std::result::Result<(), PersistenceError> {
        self.store
            .lock()
            .conversations()
            .save(snapshot)
            .map_err(|err| {
                warn!(conversation_id = %snapshot.id, error = %err, "sqlite save failed");
                err.into()
            })
    }

    async fn load_conversation(
        &self,
        id: &str,
    ) -> std::result::Result<Option<ConversationSnapshot>, PersistenceError> {
        Ok(self.store.lock().conversations().get(id)?)
    }

    async fn delete_conversation(&self, id: &str) -> std::result::Result<bool, PersistenceError> {
        Ok(self.store.lock().conversations().delete(id)?)
    }

    async fn list_conversations(
        &self,
    ) -> std::result::Result<Vec<ConversationSummary>, PersistenceError> {
        Ok(self
            .store
            .lock()
            .conversations()
            .list(&ListConversations::default())?)
    }
}
