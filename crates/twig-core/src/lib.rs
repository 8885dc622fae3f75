pub mod config;
pub mod conversation;
pub mod coordinator;
mod convert;
pub mod deletion;
pub mod editor;
pub mod error;
pub mod event;
pub mod manager;
pub mod part;
pub mod persistence;
pub mod record;
pub mod tree;

pub use config::{DEFAULT_FIRST_CHUNK_TIMEOUT, GenerationConfig};
pub use conversation::Conversation;
pub use coordinator::Generation;
pub use deletion::Deletion;
pub use editor::Edit;
pub use error::{Error, Result};
pub use event::ConversationEvent;
pub use manager::ConversationManager;
pub use part::{Delta, Part, has_content, plain_text};
pub use persistence::{
    ConversationSnapshot, ConversationSummary, InMemoryGateway, PersistenceError,
    PersistenceGateway,
};
pub use record::{ConversationRecord, GenerationOutcome, GenerationStatus};
pub use tree::{Branch, BranchId, ConversationTree, Role, StreamTarget, Version, VersionId};
